//! ClickHouse connector over the HTTP interface.

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};

use crate::core::identifier::{qualify_clickhouse, quote_clickhouse};
use crate::core::schema::TableDescriptor;
use crate::core::traits::Connector;
use crate::core::value::{Row, SqlValue};
use crate::credentials::{ClickhouseCredentials, WarehouseKind};
use crate::drivers::common::http::{build_client, status_error, transport_error, truncate};
use crate::error::{Result, TransferError};

use super::format::{encode_json_each_row, exception_error, parse_compact, CompactResult};

const KIND: WarehouseKind = WarehouseKind::Clickhouse;

/// Rows per `INSERT ... FORMAT JSONEachRow` request.
const INSERT_BATCH_ROWS: usize = 50_000;

/// Connector over the ClickHouse HTTP interface.
///
/// A "session" is an HTTP client whose credentials were verified with
/// `SELECT 1`; closing drops the client and its connection pool.
pub struct ClickhouseConnector {
    credentials: ClickhouseCredentials,
    base_url: String,
    client: Option<Client>,
}

impl ClickhouseConnector {
    pub fn new(credentials: ClickhouseCredentials) -> Self {
        let scheme = if credentials.secure { "https" } else { "http" };
        let base_url = format!("{}://{}:{}/", scheme, credentials.host, credentials.port);
        Self {
            credentials,
            base_url,
            client: None,
        }
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| TransferError::connection(KIND, "not connected"))
    }

    fn qualified(&self, table: &str) -> Result<String> {
        qualify_clickhouse(&self.credentials.database, table)
    }

    /// Run one statement. `query` travels in the URL when a body is supplied,
    /// otherwise the statement itself is the body.
    async fn execute(
        &self,
        sql: &str,
        params: &[SqlValue],
        data: Option<String>,
    ) -> Result<Option<CompactResult>> {
        let client = self.client()?;

        let mut url_params = session_params(&self.credentials.database);
        for (i, param) in params.iter().enumerate() {
            // NULL binds as ClickHouse's escaped-format NULL marker.
            let value = param.to_text().unwrap_or_else(|| "\\N".to_string());
            url_params.push((format!("param_p{}", i + 1), value));
        }

        let body = match data {
            Some(data) => {
                url_params.push(("query".into(), sql.to_string()));
                data
            }
            None => sql.to_string(),
        };

        debug!("{}", sql);
        let response = client
            .post(&self.base_url)
            .basic_auth(&self.credentials.user, Some(&self.credentials.password))
            .query(&url_params)
            .body(body)
            .send()
            .await
            .map_err(|e| transport_error(KIND, e))?;

        let status = response.status();
        let exception_code = response
            .headers()
            .get("X-ClickHouse-Exception-Code")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u32>().ok());
        let text = response.text().await.map_err(|e| transport_error(KIND, e))?;

        if !status.is_success() {
            return Err(match exception_code {
                Some(code) => exception_error(
                    code,
                    format!("code {}: {}", code, truncate(text.trim(), 500)),
                ),
                None => status_error(KIND, status, &text),
            });
        }

        parse_compact(&text)
    }
}

#[async_trait]
impl Connector for ClickhouseConnector {
    fn kind(&self) -> WarehouseKind {
        KIND
    }

    async fn connect(&mut self) -> Result<()> {
        if self.client.is_some() {
            return Ok(());
        }
        self.client = Some(build_client(KIND)?);
        if let Err(e) = self.execute("SELECT 1", &[], None).await {
            self.client = None;
            return Err(match e {
                TransferError::Query { message, .. } => TransferError::connection(KIND, message),
                other => other,
            });
        }
        info!(
            "Connected to ClickHouse: {}:{}/{}",
            self.credentials.host, self.credentials.port, self.credentials.database
        );
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.client = None;
        Ok(())
    }

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Option<Vec<Row>>> {
        Ok(self
            .execute(sql, params, None)
            .await?
            .map(CompactResult::into_rows))
    }

    async fn list_tables(&mut self) -> Result<Vec<String>> {
        let sql = format!(
            "SHOW TABLES FROM {}",
            quote_clickhouse(&self.credentials.database)?
        );
        let result = self.execute(&sql, &[], None).await?;
        Ok(result
            .map(|r| {
                r.data
                    .into_iter()
                    .filter_map(|row| row.first().and_then(|v| v.as_str().map(str::to_string)))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn read_table(&mut self, table: &str) -> Result<Vec<Row>> {
        let sql = format!("SELECT * FROM {}", self.qualified(table)?);
        Ok(self
            .execute(&sql, &[], None)
            .await?
            .map(CompactResult::into_rows)
            .unwrap_or_default())
    }

    async fn create_table_if_absent(&mut self, table: &TableDescriptor) -> Result<()> {
        let columns = table
            .columns
            .iter()
            .map(|c| Ok(format!("{} Nullable(String)", quote_clickhouse(c)?)))
            .collect::<Result<Vec<_>>>()?;
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({}) ENGINE = MergeTree() ORDER BY tuple()",
            self.qualified(&table.name)?,
            columns.join(", ")
        );
        self.execute(&sql, &[], None).await?;
        Ok(())
    }

    async fn insert_rows(&mut self, table: &TableDescriptor, rows: &[Row]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let columns = table
            .columns
            .iter()
            .map(|c| quote_clickhouse(c))
            .collect::<Result<Vec<_>>>()?;
        let sql = format!(
            "INSERT INTO {} ({}) FORMAT JSONEachRow",
            self.qualified(&table.name)?,
            columns.join(", ")
        );

        let mut written = 0u64;
        for batch in rows.chunks(INSERT_BATCH_ROWS) {
            let data = encode_json_each_row(table, batch)?;
            self.execute(&sql, &[], Some(data)).await?;
            written += batch.len() as u64;
        }
        Ok(written)
    }

    async fn clear_table(&mut self, table: &str) -> Result<()> {
        let sql = format!("TRUNCATE TABLE IF EXISTS {}", self.qualified(table)?);
        self.execute(&sql, &[], None).await?;
        Ok(())
    }
}

/// Settings sent with every statement. Decimals and 64-bit integers come
/// back quoted so no digits pass through `f64`.
fn session_params(database: &str) -> Vec<(String, String)> {
    vec![
        ("database".into(), database.to_string()),
        ("default_format".into(), "JSONCompact".into()),
        ("output_format_json_quote_decimals".into(), "1".into()),
        ("output_format_json_quote_64bit_integers".into(), "1".into()),
    ]
}
