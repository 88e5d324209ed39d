//! Snowflake session REST protocol: request and response bodies.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::value::{Row, SqlValue};
use crate::credentials::WarehouseKind;
use crate::error::{Result, TransferError};

/// Response codes meaning "query still running, poll `getResultUrl`".
pub(crate) const QUERY_IN_PROGRESS: [&str; 2] = ["333333", "333334"];

#[derive(Debug, Serialize)]
pub(crate) struct LoginRequest<'a> {
    pub data: LoginRequestData<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) struct LoginRequestData<'a> {
    pub client_app_id: &'a str,
    pub client_app_version: &'a str,
    pub account_name: &'a str,
    pub login_name: &'a str,
    pub password: &'a str,
    pub session_parameters: SessionParameters,
}

/// Session settings sent with the login. Results must come back as JSON
/// row sets; accounts may default to Arrow.
#[derive(Debug, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) struct SessionParameters {
    pub query_result_format: &'static str,
}

impl Default for SessionParameters {
    fn default() -> Self {
        Self {
            query_result_format: "JSON",
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct LoginResponseData {
    pub token: String,
}

/// Common envelope of every Snowflake REST response.
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope<T> {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub code: Option<Value>,
    #[serde(default)]
    pub message: Option<String>,
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    /// Response code as text (Snowflake sends it as a string or number).
    pub fn code(&self) -> Option<String> {
        match &self.code {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.code()
            .map(|c| QUERY_IN_PROGRESS.contains(&c.as_str()))
            .unwrap_or(false)
    }

    /// Typed error for an unsuccessful response.
    ///
    /// Codes in the 390xxx range are session and authentication failures.
    pub fn error(&self) -> TransferError {
        let code = self.code().unwrap_or_default();
        let message = format!(
            "{} ({})",
            self.message.as_deref().unwrap_or("request failed"),
            if code.is_empty() { "no code" } else { &code }
        );
        if code.starts_with("390") {
            TransferError::connection(WarehouseKind::Snowflake, message)
        } else {
            TransferError::query(WarehouseKind::Snowflake, message)
        }
    }
}

/// Positional binding for `?` placeholders; `value` is a string or, for
/// array binding, a list of strings.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct Binding {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub value: Value,
}

impl Binding {
    pub fn text(value: Option<String>) -> Self {
        Self {
            kind: "TEXT",
            value: value.map(Value::String).unwrap_or(Value::Null),
        }
    }

    pub fn text_array(values: Vec<Option<String>>) -> Self {
        Self {
            kind: "TEXT",
            value: Value::Array(
                values
                    .into_iter()
                    .map(|v| v.map(Value::String).unwrap_or(Value::Null))
                    .collect(),
            ),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct QueryRequest<'a> {
    pub sql_text: &'a str,
    pub async_exec: bool,
    pub sequence_id: u64,
    pub query_submission_time: i64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub bindings: BTreeMap<String, Binding>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RowType {
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Chunk {
    pub url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct QueryResponseData {
    #[serde(default)]
    pub rowtype: Vec<RowType>,
    #[serde(default)]
    pub rowset: Vec<Vec<Option<String>>>,
    #[serde(default)]
    pub chunks: Vec<Chunk>,
    #[serde(default)]
    pub chunk_headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub qrmk: Option<String>,
    #[serde(default)]
    pub get_result_url: Option<String>,
    #[serde(default)]
    pub query_result_format: Option<String>,
    #[serde(default)]
    pub statement_type_id: Option<i64>,
}

impl QueryResponseData {
    /// Whether the statement produced a result set (as opposed to DML/DDL).
    ///
    /// Statement type ids in the 0x3000 range are DML, whose "rows" are
    /// only affected-row counts.
    pub fn has_result_set(&self) -> bool {
        if self.rowtype.is_empty() {
            return false;
        }
        !matches!(self.statement_type_id, Some(id) if (0x3000..0x4000).contains(&id))
    }

    /// Reject result formats other than JSON (e.g. Arrow).
    pub fn check_format(&self) -> Result<()> {
        match self.query_result_format.as_deref() {
            None | Some("json") => Ok(()),
            Some(other) => Err(TransferError::query(
                WarehouseKind::Snowflake,
                format!("unsupported result format '{}'", other),
            )),
        }
    }

    pub fn column_names(&self) -> Vec<String> {
        self.rowtype.iter().map(|r| r.name.clone()).collect()
    }
}

/// Build named rows from a rowset.
pub(crate) fn rows_from_rowset(columns: &[String], rowset: Vec<Vec<Option<String>>>) -> Vec<Row> {
    rowset
        .into_iter()
        .map(|values| {
            Row::Named(
                columns
                    .iter()
                    .cloned()
                    .zip(values.into_iter().map(SqlValue::from))
                    .collect(),
            )
        })
        .collect()
}

/// Parse a downloaded result chunk: comma-separated JSON arrays without the
/// enclosing brackets.
pub(crate) fn parse_chunk(body: &str) -> Result<Vec<Vec<Option<String>>>> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let wrapped = if trimmed.starts_with("[[") || trimmed == "[]" {
        trimmed.to_string()
    } else {
        format!("[{}]", trimmed)
    };
    serde_json::from_str(&wrapped).map_err(|e| {
        TransferError::query(
            WarehouseKind::Snowflake,
            format!("malformed result chunk: {}", e),
        )
    })
}

/// Account identifier and host for a configured account.
///
/// Accepts `xy12345`, `xy12345.us-east-1` or a full
/// `xy12345.us-east-1.snowflakecomputing.com` host name.
pub(crate) fn account_endpoint(account: &str) -> (String, String) {
    let host = account
        .trim()
        .trim_start_matches("https://")
        .trim_end_matches('/')
        .trim_end_matches(".snowflakecomputing.com")
        .to_string();
    let account_name = host.split('.').next().unwrap_or(&host).to_uppercase();
    (account_name, format!("{}.snowflakecomputing.com", host))
}
