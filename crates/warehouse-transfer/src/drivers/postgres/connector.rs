//! PostgreSQL connector.
//!
//! One `tokio-postgres` client per connector. Table reads go through the
//! simple-query protocol so every value arrives as text; loads use
//! `COPY ... FROM STDIN` in text format.

use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::SinkExt;
use tokio::task::JoinHandle;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};
use tracing::{debug, info, warn};

use crate::core::identifier::{qualify_pg, quote_pg};
use crate::core::schema::TableDescriptor;
use crate::core::traits::Connector;
use crate::core::value::{Row, SqlValue};
use crate::credentials::{PostgresCredentials, WarehouseKind};
use crate::drivers::common::tls::{make_tls_connect, SslMode};
use crate::error::{Result, TransferError};

use super::copy::encode_row;

const KIND: WarehouseKind = WarehouseKind::Postgres;

/// Connect timeout for new sessions.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Flush COPY data to the server once the buffer reaches this size.
const COPY_CHUNK_BYTES: usize = 1 << 20;

/// Connector over a single PostgreSQL session.
pub struct PostgresConnector {
    credentials: PostgresCredentials,
    ssl_mode: SslMode,
    client: Option<Client>,
    connection_task: Option<JoinHandle<()>>,
}

impl PostgresConnector {
    pub fn new(credentials: PostgresCredentials) -> Self {
        let ssl_mode = credentials.ssl_mode;
        Self {
            credentials,
            ssl_mode,
            client: None,
            connection_task: None,
        }
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| TransferError::connection(KIND, "not connected"))
    }

    fn qualified(&self, table: &str) -> Result<String> {
        qualify_pg(&self.credentials.schema, table)
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let row = self
            .client()?
            .query_one(
                "SELECT to_regclass($1::text) IS NOT NULL",
                &[&self.qualified(table)?],
            )
            .await
            .map_err(|e| pg_error(e, "checking table existence"))?;
        row.try_get::<_, bool>(0)
            .map_err(|e| pg_error(e, "checking table existence"))
    }

    async fn delete_all(&self, table: &str) -> Result<()> {
        if !self.table_exists(table).await? {
            return Ok(());
        }
        let sql = format!("DELETE FROM {}", self.qualified(table)?);
        debug!("{}", sql);
        self.client()?
            .batch_execute(&sql)
            .await
            .map_err(|e| pg_error(e, "clearing table"))
    }

    async fn copy_rows(&self, table: &TableDescriptor, rows: &[Row]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let columns = table
            .columns
            .iter()
            .map(|c| quote_pg(c))
            .collect::<Result<Vec<_>>>()?;
        let copy_sql = format!(
            "COPY {} ({}) FROM STDIN",
            self.qualified(&table.name)?,
            columns.join(", ")
        );
        debug!("{} [{} rows]", copy_sql, rows.len());

        let sink = self
            .client()?
            .copy_in(&copy_sql)
            .await
            .map_err(|e| pg_error(e, "starting COPY"))?;
        tokio::pin!(sink);

        let mut buf = BytesMut::with_capacity(COPY_CHUNK_BYTES);
        for row in rows {
            encode_row(&mut buf, &table.project(row));
            if buf.len() >= COPY_CHUNK_BYTES {
                sink.send(buf.split().freeze())
                    .await
                    .map_err(|e| pg_error(e, "sending COPY data"))?;
            }
        }
        if !buf.is_empty() {
            sink.send(buf.freeze())
                .await
                .map_err(|e| pg_error(e, "sending COPY data"))?;
        }

        sink.as_mut()
            .finish()
            .await
            .map_err(|e| pg_error(e, "finishing COPY"))
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    fn kind(&self) -> WarehouseKind {
        KIND
    }

    async fn connect(&mut self) -> Result<()> {
        if self.client.is_some() {
            return Ok(());
        }

        let creds = &self.credentials;
        let mut config = tokio_postgres::Config::new();
        config
            .host(&creds.host)
            .port(creds.port)
            .dbname(&creds.database)
            .user(&creds.user)
            .password(&creds.password)
            .application_name("warehouse-transfer")
            .keepalives(true)
            .keepalives_idle(Duration::from_secs(30))
            .connect_timeout(CONNECT_TIMEOUT);

        let (client, task) = match make_tls_connect(self.ssl_mode)? {
            None => {
                let (client, connection) = config
                    .connect(NoTls)
                    .await
                    .map_err(|e| TransferError::connection(KIND, e.to_string()))?;
                let task = tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        warn!("PostgreSQL connection error: {}", e);
                    }
                });
                (client, task)
            }
            Some(tls) => {
                let (client, connection) = config
                    .connect(tls)
                    .await
                    .map_err(|e| TransferError::connection(KIND, e.to_string()))?;
                let task = tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        warn!("PostgreSQL connection error: {}", e);
                    }
                });
                (client, task)
            }
        };

        info!(
            "Connected to PostgreSQL: {}:{}/{} (sslmode={})",
            creds.host, creds.port, creds.database, self.ssl_mode
        );
        self.client = Some(client);
        self.connection_task = Some(task);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping the client ends the session; the connection task then exits.
        self.client = None;
        if let Some(task) = self.connection_task.take() {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("PostgreSQL connection task did not exit after close");
            }
        }
        Ok(())
    }

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Option<Vec<Row>>> {
        let client = self.client()?;
        let text_params: Vec<Option<String>> = params.iter().map(SqlValue::to_text).collect();
        let param_refs: Vec<&(dyn ToSql + Sync)> = text_params
            .iter()
            .map(|p| p as &(dyn ToSql + Sync))
            .collect();
        let param_types = vec![Type::TEXT; text_params.len()];

        debug!("{}", sql);
        let statement = client
            .prepare_typed(sql, &param_types)
            .await
            .map_err(|e| pg_error(e, "preparing statement"))?;

        if statement.columns().is_empty() {
            client
                .execute(&statement, &param_refs)
                .await
                .map_err(|e| pg_error(e, "executing statement"))?;
            return Ok(None);
        }

        let rows = client
            .query(&statement, &param_refs)
            .await
            .map_err(|e| pg_error(e, "executing query"))?;

        rows.iter()
            .map(|row| {
                let cells = row
                    .columns()
                    .iter()
                    .enumerate()
                    .map(|(idx, column)| Ok((column.name().to_string(), cell_value(row, idx)?)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Row::Named(cells))
            })
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    async fn list_tables(&mut self) -> Result<Vec<String>> {
        let rows = self
            .client()?
            .query(
                "SELECT table_name::text FROM information_schema.tables \
                 WHERE table_schema = $1::text AND table_type = 'BASE TABLE'",
                &[&self.credentials.schema],
            )
            .await
            .map_err(|e| pg_error(e, "listing tables"))?;

        rows.iter()
            .map(|row| {
                row.try_get::<_, String>(0)
                    .map_err(|e| pg_error(e, "listing tables"))
            })
            .collect()
    }

    async fn read_table(&mut self, table: &str) -> Result<Vec<Row>> {
        let sql = format!("SELECT * FROM {}", self.qualified(table)?);
        debug!("{}", sql);
        let messages = self
            .client()?
            .simple_query(&sql)
            .await
            .map_err(|e| pg_error(e, "reading table"))?;

        let mut rows = Vec::new();
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                let cells = row
                    .columns()
                    .iter()
                    .enumerate()
                    .map(|(idx, column)| {
                        let value = row
                            .get(idx)
                            .map(|text| SqlValue::Text(text.to_string()))
                            .unwrap_or(SqlValue::Null);
                        (column.name().to_string(), value)
                    })
                    .collect();
                rows.push(Row::Named(cells));
            }
        }
        Ok(rows)
    }

    async fn create_table_if_absent(&mut self, table: &TableDescriptor) -> Result<()> {
        let columns = table
            .columns
            .iter()
            .map(|c| Ok(format!("{} TEXT", quote_pg(c)?)))
            .collect::<Result<Vec<_>>>()?;
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.qualified(&table.name)?,
            columns.join(", ")
        );
        debug!("{}", sql);
        self.client()?
            .batch_execute(&sql)
            .await
            .map_err(|e| pg_error(e, "creating table"))
    }

    async fn insert_rows(&mut self, table: &TableDescriptor, rows: &[Row]) -> Result<u64> {
        self.copy_rows(table, rows).await
    }

    async fn clear_table(&mut self, table: &str) -> Result<()> {
        self.delete_all(table).await
    }

    /// Delete and reload inside one transaction.
    async fn replace_rows(&mut self, table: &TableDescriptor, rows: &[Row]) -> Result<u64> {
        self.client()?
            .batch_execute("BEGIN")
            .await
            .map_err(|e| pg_error(e, "starting transaction"))?;

        let loaded = match self.delete_all(&table.name).await {
            Ok(()) => self.copy_rows(table, rows).await,
            Err(e) => Err(e),
        };

        match loaded {
            Ok(count) => {
                self.client()?
                    .batch_execute("COMMIT")
                    .await
                    .map_err(|e| pg_error(e, "committing transaction"))?;
                Ok(count)
            }
            Err(e) => {
                if let Ok(client) = self.client() {
                    if let Err(rollback) = client.batch_execute("ROLLBACK").await {
                        warn!("Rollback of {} failed: {}", table.name, rollback);
                    }
                }
                Err(e)
            }
        }
    }
}

/// Decode one column of an extended-protocol row.
fn cell_value(row: &tokio_postgres::Row, idx: usize) -> Result<SqlValue> {
    let column = &row.columns()[idx];
    let decoded = match *column.type_() {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx).map(SqlValue::from),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)
            .map(|v| SqlValue::from(v.map(i64::from))),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)
            .map(|v| SqlValue::from(v.map(i64::from))),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx).map(SqlValue::from),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)
            .map(|v| SqlValue::from(v.map(f64::from))),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx).map(SqlValue::from),
        Type::BYTEA => row.try_get::<_, Option<Vec<u8>>>(idx).map(SqlValue::from),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)
            .map(|v| SqlValue::from(v.map(|j| j.to_string()))),
        Type::UUID => row
            .try_get::<_, Option<uuid::Uuid>>(idx)
            .map(|v| SqlValue::from(v.map(|u| u.to_string()))),
        Type::TIMESTAMP => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
            .map(|v| SqlValue::from(v.map(|t| t.to_string()))),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
            .map(|v| SqlValue::from(v.map(|t| t.to_rfc3339()))),
        Type::DATE => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)
            .map(|v| SqlValue::from(v.map(|d| d.to_string()))),
        Type::TIME => row
            .try_get::<_, Option<chrono::NaiveTime>>(idx)
            .map(|v| SqlValue::from(v.map(|t| t.to_string()))),
        _ => row.try_get::<_, Option<String>>(idx).map(SqlValue::from),
    };
    decoded.map_err(|e| {
        TransferError::query(
            KIND,
            format!(
                "cannot decode column '{}' of type {}: {}",
                column.name(),
                column.type_(),
                e
            ),
        )
    })
}

/// Classify a driver error by SQLSTATE.
///
/// Class 08 (connection) and 28 (authorization) are connection failures;
/// classes 40 (rollback), 53 (resources) and 57P (operator intervention)
/// are transient query failures.
pub(crate) fn pg_error(e: tokio_postgres::Error, context: &str) -> TransferError {
    let message = format!("{}: {}", context, e);

    if let Some(db) = e.as_db_error() {
        let code = db.code().code();
        if code.starts_with("08") || code.starts_with("28") {
            return TransferError::connection(KIND, message);
        }
        let transient = code.starts_with("40") || code.starts_with("53") || code.starts_with("57P");
        return if transient {
            TransferError::transient_query(KIND, message)
        } else {
            TransferError::query(KIND, message)
        };
    }

    let io_failure = std::error::Error::source(&e)
        .map(|source| source.is::<std::io::Error>())
        .unwrap_or(false);
    if e.is_closed() || io_failure {
        TransferError::connection(KIND, message)
    } else {
        TransferError::query(KIND, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials(ssl_mode: SslMode) -> PostgresCredentials {
        PostgresCredentials {
            host: "localhost".into(),
            port: 5432,
            database: "app".into(),
            user: "reader".into(),
            password: "pw".into(),
            schema: "public".into(),
            ssl_mode,
        }
    }

    #[tokio::test]
    async fn test_operations_before_connect_fail() {
        let mut conn = PostgresConnector::new(credentials(SslMode::Disable));
        let err = conn.list_tables().await.unwrap_err();
        assert!(matches!(err, TransferError::Connection { .. }));
        conn.close().await.unwrap();
        conn.close().await.unwrap();
    }

    #[test]
    fn test_qualified_names_use_schema() {
        let conn = PostgresConnector::new(credentials(SslMode::Disable));
        assert_eq!(conn.qualified("users").unwrap(), "\"public\".\"users\"");
    }
}
