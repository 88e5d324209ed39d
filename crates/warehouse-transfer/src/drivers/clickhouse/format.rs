//! ClickHouse wire formats: `JSONCompact` results and `JSONEachRow` loads.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::core::schema::TableDescriptor;
use crate::core::value::{Row, SqlValue};
use crate::credentials::WarehouseKind;
use crate::error::{Result, TransferError};

#[derive(Debug, Deserialize)]
pub(crate) struct ColumnMeta {
    pub name: String,
}

/// Body of a `FORMAT JSONCompact` response.
#[derive(Debug, Deserialize)]
pub(crate) struct CompactResult {
    pub meta: Vec<ColumnMeta>,
    pub data: Vec<Vec<Value>>,
}

impl CompactResult {
    /// Named rows in column order.
    pub fn into_rows(self) -> Vec<Row> {
        let names: Vec<String> = self.meta.into_iter().map(|m| m.name).collect();
        self.data
            .into_iter()
            .map(|values| {
                Row::Named(
                    names
                        .iter()
                        .cloned()
                        .zip(values.iter().map(SqlValue::from_json))
                        .collect(),
                )
            })
            .collect()
    }
}

/// Parse a response body; an empty body means the statement produced no result set.
pub(crate) fn parse_compact(body: &str) -> Result<Option<CompactResult>> {
    if body.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(body).map(Some).map_err(|e| {
        TransferError::query(
            WarehouseKind::Clickhouse,
            format!("malformed JSONCompact response: {}", e),
        )
    })
}

/// Encode rows as `JSONEachRow` lines keyed by the table's columns.
pub(crate) fn encode_json_each_row(table: &TableDescriptor, rows: &[Row]) -> Result<String> {
    let mut body = String::new();
    for row in rows {
        let object: Map<String, Value> = table
            .columns
            .iter()
            .cloned()
            .zip(table.project(row).into_iter().map(|v| match v {
                Some(text) => Value::String(text),
                None => Value::Null,
            }))
            .collect();
        body.push_str(&serde_json::to_string(&Value::Object(object))?);
        body.push('\n');
    }
    Ok(body)
}

/// ClickHouse exception codes for failed or rejected authentication.
const AUTH_CODES: [u32; 3] = [192, 193, 516];

/// Exception codes for timeouts, overload and network trouble on the server side.
const TRANSIENT_CODES: [u32; 7] = [159, 164, 202, 209, 210, 241, 252];

/// Classify a failure reported through `X-ClickHouse-Exception-Code`.
pub(crate) fn exception_error(code: u32, message: String) -> TransferError {
    let kind = WarehouseKind::Clickhouse;
    if AUTH_CODES.contains(&code) {
        TransferError::connection(kind, message)
    } else if TRANSIENT_CODES.contains(&code) {
        TransferError::transient_query(kind, message)
    } else {
        TransferError::query(kind, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compact_rows() {
        let body = r#"{
            "meta": [{"name": "id", "type": "UInt64"}, {"name": "name", "type": "Nullable(String)"}],
            "data": [["1", "ada"], ["2", null]],
            "rows": 2,
            "statistics": {"elapsed": 0.001}
        }"#;
        let rows = parse_compact(body).unwrap().unwrap().into_rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("name"), Some(&SqlValue::from("ada")));
        assert_eq!(rows[1].get("name"), Some(&SqlValue::Null));
    }

    #[test]
    fn test_wide_decimals_keep_every_digit() {
        let body = r#"{
            "meta": [{"name": "amount", "type": "Decimal(38, 3)"}],
            "data": [["12345678901234567.891"]],
            "rows": 1
        }"#;
        let rows = parse_compact(body).unwrap().unwrap().into_rows();
        assert_eq!(
            rows[0].get("amount").and_then(SqlValue::to_text).as_deref(),
            Some("12345678901234567.891")
        );
    }

    #[test]
    fn test_empty_body_has_no_result() {
        assert!(parse_compact("").unwrap().is_none());
        assert!(parse_compact("not json").is_err());
    }

    #[test]
    fn test_json_each_row_uses_text_and_null() {
        let table = TableDescriptor::new("users", vec!["id".into(), "email".into()]);
        let rows = vec![Row::named([("id", SqlValue::Int(7))])];
        let body = encode_json_each_row(&table, &rows).unwrap();
        assert!(body.ends_with('\n'));
        let parsed: Value = serde_json::from_str(body.trim_end()).unwrap();
        assert_eq!(parsed, serde_json::json!({"id": "7", "email": null}));
    }

    #[test]
    fn test_exception_classification() {
        assert!(matches!(
            exception_error(516, "auth".into()),
            TransferError::Connection { .. }
        ));
        assert!(exception_error(159, "timeout".into()).is_retryable());
        assert!(!exception_error(60, "unknown table".into()).is_retryable());
    }
}
