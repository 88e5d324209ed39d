//! Snowflake connector over the session REST protocol.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::core::identifier::{qualify_snowflake, quote_snowflake};
use crate::core::schema::TableDescriptor;
use crate::core::traits::Connector;
use crate::core::value::{Row, SqlValue};
use crate::credentials::{SnowflakeCredentials, WarehouseKind};
use crate::drivers::common::http::{build_client, status_error, transport_error};
use crate::error::{Result, TransferError};

use super::protocol::{
    account_endpoint, parse_chunk, rows_from_rowset, Binding, Envelope, LoginRequest,
    LoginRequestData, LoginResponseData, QueryRequest, QueryResponseData, SessionParameters,
};

const KIND: WarehouseKind = WarehouseKind::Snowflake;

const CLIENT_APP_ID: &str = "warehouse-transfer";

/// Rows per array-bound INSERT.
const INSERT_BATCH_ROWS: usize = 10_000;

/// Poll interval bounds while a statement is still running.
const POLL_INITIAL: Duration = Duration::from_millis(250);
const POLL_MAX: Duration = Duration::from_secs(5);

struct Session {
    client: Client,
    token: String,
    sequence: u64,
}

/// Connector over one Snowflake login session.
pub struct SnowflakeConnector {
    credentials: SnowflakeCredentials,
    account_name: String,
    base_url: String,
    session: Option<Session>,
}

impl SnowflakeConnector {
    pub fn new(credentials: SnowflakeCredentials) -> Self {
        let (account_name, host) = account_endpoint(&credentials.account);
        Self {
            credentials,
            account_name,
            base_url: format!("https://{}", host),
            session: None,
        }
    }

    fn session(&mut self) -> Result<&mut Session> {
        self.session
            .as_mut()
            .ok_or_else(|| TransferError::connection(KIND, "not connected"))
    }

    fn qualified(&self, table: &str) -> Result<String> {
        qualify_snowflake(&self.credentials.database, &self.credentials.schema, table)
    }

    fn authorized(builder: RequestBuilder, token: &str) -> RequestBuilder {
        builder
            .header(AUTHORIZATION, format!("Snowflake Token=\"{}\"", token))
            .header(ACCEPT, "application/snowflake")
    }

    async fn read_envelope<T: DeserializeOwned>(request: RequestBuilder) -> Result<Envelope<T>> {
        let response = request.send().await.map_err(|e| transport_error(KIND, e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(KIND, status, &body));
        }
        response.json::<Envelope<T>>().await.map_err(|e| {
            TransferError::query(KIND, format!("malformed Snowflake response: {}", e))
        })
    }

    async fn login(&self, client: &Client) -> Result<String> {
        let mut url_params = vec![
            ("warehouse", self.credentials.warehouse.as_str()),
            ("databaseName", self.credentials.database.as_str()),
            ("schemaName", self.credentials.schema.as_str()),
        ];
        if let Some(role) = &self.credentials.role {
            url_params.push(("roleName", role.as_str()));
        }

        let body = LoginRequest {
            data: LoginRequestData {
                client_app_id: CLIENT_APP_ID,
                client_app_version: env!("CARGO_PKG_VERSION"),
                account_name: &self.account_name,
                login_name: &self.credentials.user,
                password: &self.credentials.password,
                session_parameters: SessionParameters::default(),
            },
        };

        let request = client
            .post(format!("{}/session/v1/login-request", self.base_url))
            .query(&url_params)
            .header(ACCEPT, "application/json")
            .json(&body);

        let envelope: Envelope<LoginResponseData> = Self::read_envelope(request).await?;
        if !envelope.success {
            // Any rejected login is an authentication problem, whatever the code.
            return Err(match envelope.error() {
                TransferError::Query { message, .. } => TransferError::connection(KIND, message),
                other => other,
            });
        }
        envelope
            .data
            .map(|d| d.token)
            .ok_or_else(|| TransferError::connection(KIND, "login response carried no token"))
    }

    /// Submit a statement, wait for it, and download every result chunk.
    async fn execute(
        &mut self,
        sql: &str,
        bindings: BTreeMap<String, Binding>,
    ) -> Result<Option<Vec<Row>>> {
        let base_url = self.base_url.clone();
        let session = self.session()?;
        session.sequence += 1;

        let body = QueryRequest {
            sql_text: sql,
            async_exec: false,
            sequence_id: session.sequence,
            query_submission_time: chrono::Utc::now().timestamp_millis(),
            bindings,
        };
        let request_id = uuid::Uuid::new_v4().to_string();
        debug!("{}", sql);

        let request = Self::authorized(
            session
                .client
                .post(format!("{}/queries/v1/query-request", base_url))
                .query(&[("requestId", request_id.as_str())])
                .json(&body),
            &session.token,
        );
        let mut envelope: Envelope<QueryResponseData> = Self::read_envelope(request).await?;

        let mut delay = POLL_INITIAL;
        while envelope.in_progress() {
            let result_url = envelope
                .data
                .as_ref()
                .and_then(|d| d.get_result_url.clone())
                .ok_or_else(|| {
                    TransferError::query(KIND, "statement in progress without a result URL")
                })?;
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(POLL_MAX);
            let request = Self::authorized(
                session.client.get(format!("{}{}", base_url, result_url)),
                &session.token,
            );
            envelope = Self::read_envelope(request).await?;
        }

        if !envelope.success {
            return Err(envelope.error());
        }

        let data = envelope.data.unwrap_or_default();
        data.check_format()?;
        if !data.has_result_set() {
            return Ok(None);
        }

        let columns = data.column_names();
        let mut rows = rows_from_rowset(&columns, data.rowset);

        if !data.chunks.is_empty() {
            let headers = chunk_headers(&data.chunk_headers, data.qrmk.as_deref())?;
            for chunk in &data.chunks {
                let response = session
                    .client
                    .get(&chunk.url)
                    .headers(headers.clone())
                    .send()
                    .await
                    .map_err(|e| transport_error(KIND, e))?;
                let status = response.status();
                let text = response.text().await.map_err(|e| transport_error(KIND, e))?;
                if !status.is_success() {
                    return Err(status_error(KIND, status, &text));
                }
                rows.extend(rows_from_rowset(&columns, parse_chunk(&text)?));
            }
        }

        Ok(Some(rows))
    }
}

/// Headers required to download result chunks from cloud storage.
fn chunk_headers(
    explicit: &Option<std::collections::HashMap<String, String>>,
    qrmk: Option<&str>,
) -> Result<HeaderMap> {
    let invalid = |e: String| TransferError::query(KIND, format!("invalid chunk header: {}", e));
    let mut headers = HeaderMap::new();
    match (explicit, qrmk) {
        (Some(map), _) if !map.is_empty() => {
            for (name, value) in map {
                headers.insert(
                    HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(e.to_string()))?,
                    HeaderValue::from_str(value).map_err(|e| invalid(e.to_string()))?,
                );
            }
        }
        (_, Some(key)) => {
            headers.insert(
                HeaderName::from_static("x-amz-server-side-encryption-customer-algorithm"),
                HeaderValue::from_static("AES256"),
            );
            headers.insert(
                HeaderName::from_static("x-amz-server-side-encryption-customer-key"),
                HeaderValue::from_str(key).map_err(|e| invalid(e.to_string()))?,
            );
        }
        _ => {}
    }
    Ok(headers)
}

#[async_trait]
impl Connector for SnowflakeConnector {
    fn kind(&self) -> WarehouseKind {
        KIND
    }

    async fn connect(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let client = build_client(KIND)?;
        let token = self.login(&client).await?;
        info!(
            "Connected to Snowflake: {}/{}.{} (warehouse {})",
            self.account_name,
            self.credentials.database,
            self.credentials.schema,
            self.credentials.warehouse
        );
        self.session = Some(Session {
            client,
            token,
            sequence: 0,
        });
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        let request = Self::authorized(
            session
                .client
                .post(format!("{}/session", self.base_url))
                .query(&[("delete", "true")]),
            &session.token,
        );
        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!("Snowflake session deleted");
            }
            Ok(response) => warn!("Snowflake session delete returned {}", response.status()),
            Err(e) => warn!("Snowflake session delete failed: {}", e),
        }
        Ok(())
    }

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Option<Vec<Row>>> {
        let bindings = params
            .iter()
            .enumerate()
            .map(|(i, p)| ((i + 1).to_string(), Binding::text(p.to_text())))
            .collect();
        self.execute(sql, bindings).await
    }

    async fn list_tables(&mut self) -> Result<Vec<String>> {
        let sql = format!(
            "SHOW TABLES IN SCHEMA {}.{}",
            quote_snowflake(&self.credentials.database)?,
            quote_snowflake(&self.credentials.schema)?
        );
        let rows = self.execute(&sql, BTreeMap::new()).await?.unwrap_or_default();
        Ok(rows
            .iter()
            .filter_map(|row| row.get("name").and_then(SqlValue::to_text))
            .collect())
    }

    async fn read_table(&mut self, table: &str) -> Result<Vec<Row>> {
        let sql = format!("SELECT * FROM {}", self.qualified(table)?);
        Ok(self.execute(&sql, BTreeMap::new()).await?.unwrap_or_default())
    }

    async fn create_table_if_absent(&mut self, table: &TableDescriptor) -> Result<()> {
        let columns = table
            .columns
            .iter()
            .map(|c| Ok(format!("{} VARCHAR", quote_snowflake(c)?)))
            .collect::<Result<Vec<_>>>()?;
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.qualified(&table.name)?,
            columns.join(", ")
        );
        self.execute(&sql, BTreeMap::new()).await?;
        Ok(())
    }

    async fn insert_rows(&mut self, table: &TableDescriptor, rows: &[Row]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let columns = table
            .columns
            .iter()
            .map(|c| quote_snowflake(c))
            .collect::<Result<Vec<_>>>()?;
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.qualified(&table.name)?,
            columns.join(", "),
            placeholders
        );

        let mut written = 0u64;
        for batch in rows.chunks(INSERT_BATCH_ROWS) {
            let mut by_column: Vec<Vec<Option<String>>> =
                vec![Vec::with_capacity(batch.len()); table.columns.len()];
            for row in batch {
                for (i, value) in table.project(row).into_iter().enumerate() {
                    by_column[i].push(value);
                }
            }
            let bindings = by_column
                .into_iter()
                .enumerate()
                .map(|(i, values)| ((i + 1).to_string(), Binding::text_array(values)))
                .collect();
            self.execute(&sql, bindings).await?;
            written += batch.len() as u64;
        }
        Ok(written)
    }

    async fn clear_table(&mut self, table: &str) -> Result<()> {
        let sql = format!("TRUNCATE TABLE IF EXISTS {}", self.qualified(table)?);
        self.execute(&sql, BTreeMap::new()).await?;
        Ok(())
    }
}
