//! Database-backed registry.
//!
//! Stores job and source records in PostgreSQL tables within the
//! `_warehouse_transfer` schema. Preferred over the file backend when more
//! than one process serves the same jobs:
//! - Transactional duplicate-job checks
//! - No file system access required

use std::fmt::Display;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tracing::info;

use super::{JobRecord, JobRegistry, JobStatus, SourceRecord};
use crate::config::PgRegistryConfig;
use crate::credentials::WarehouseKind;
use crate::drivers::common::tls::make_tls_connect;
use crate::error::{Result, TransferError};

const SCHEMA: &str = "_warehouse_transfer";

const TERMINAL_STATUSES: [JobStatus; 4] = [
    JobStatus::Completed,
    JobStatus::PartialFailure,
    JobStatus::Failed,
    JobStatus::Cancelled,
];

fn db_error(e: impl Display, context: &str) -> TransferError {
    TransferError::registry(format!("{}: {}", context, e))
}

fn terminal_list() -> String {
    TERMINAL_STATUSES
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Registry stored in PostgreSQL.
pub struct PgRegistry {
    pool: Pool,
    schema: String,
}

impl PgRegistry {
    /// Wrap an existing pool.
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            schema: SCHEMA.to_string(),
        }
    }

    /// Build a pool from configuration and verify it can hand out a connection.
    pub async fn connect(config: &PgRegistryConfig) -> Result<Self> {
        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(&config.host)
            .port(config.port)
            .dbname(&config.database)
            .user(&config.user)
            .password(&config.password)
            .application_name("warehouse-transfer");

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let mgr = match make_tls_connect(config.ssl_mode)? {
            Some(tls) => Manager::from_config(pg_config, tls, mgr_config),
            None => Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config),
        };
        let pool = Pool::builder(mgr)
            .max_size(config.max_connections)
            .build()
            .map_err(|e| db_error(e, "creating registry pool"))?;

        let registry = Self::new(pool);
        registry
            .pool
            .get()
            .await
            .map_err(|e| {
                TransferError::connection(
                    WarehouseKind::Postgres,
                    format!("registry database {}:{}: {}", config.host, config.port, e),
                )
            })?;
        info!(
            "Registry connected to {}:{}/{}",
            config.host, config.port, config.database
        );
        Ok(registry)
    }

    async fn client(&self) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| db_error(e, "getting registry connection"))
    }
}

impl std::fmt::Debug for PgRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgRegistry")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

fn record_from_json(value: serde_json::Value) -> Result<JobRecord> {
    serde_json::from_value(value).map_err(|e| db_error(e, "decoding job record"))
}

#[async_trait]
impl JobRegistry for PgRegistry {
    async fn init_schema(&self) -> Result<()> {
        let conn = self.client().await?;

        conn.batch_execute(&format!(
            "CREATE SCHEMA IF NOT EXISTS {schema};
             CREATE TABLE IF NOT EXISTS {schema}.jobs (
                 id TEXT PRIMARY KEY,
                 organization TEXT NOT NULL,
                 status TEXT NOT NULL,
                 record JSONB NOT NULL,
                 created_at TIMESTAMPTZ NOT NULL,
                 updated_at TIMESTAMPTZ NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_jobs_status_created
                 ON {schema}.jobs(status, created_at);
             CREATE TABLE IF NOT EXISTS {schema}.sources (
                 id TEXT PRIMARY KEY,
                 organization TEXT NOT NULL,
                 kind TEXT NOT NULL,
                 credentials JSONB NOT NULL,
                 created_at TIMESTAMPTZ NOT NULL
             );",
            schema = self.schema
        ))
        .await
        .map_err(|e| db_error(e, "initializing registry schema"))?;

        Ok(())
    }

    async fn insert_job(&self, job: &JobRecord) -> Result<()> {
        let mut conn = self.client().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| db_error(e, "starting transaction"))?;

        let existing = tx
            .query_opt(
                &format!("SELECT status FROM {}.jobs WHERE id = $1 FOR UPDATE", self.schema),
                &[&job.id],
            )
            .await
            .map_err(|e| db_error(e, "checking existing job"))?;
        if let Some(row) = existing {
            let status: String = row.get(0);
            if !status.parse::<JobStatus>()?.is_terminal() {
                return Err(TransferError::DuplicateJob(job.id.clone()));
            }
        }

        let record = serde_json::to_value(job)?;
        tx.execute(
            &format!(
                "INSERT INTO {}.jobs (id, organization, status, record, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (id) DO UPDATE SET
                    organization = EXCLUDED.organization,
                    status = EXCLUDED.status,
                    record = EXCLUDED.record,
                    created_at = EXCLUDED.created_at,
                    updated_at = EXCLUDED.updated_at",
                self.schema
            ),
            &[
                &job.id,
                &job.organization,
                &job.status.as_str(),
                &record,
                &job.created_at,
                &job.updated_at,
            ],
        )
        .await
        .map_err(|e| db_error(e, "inserting job"))?;

        tx.commit()
            .await
            .map_err(|e| db_error(e, "committing job insert"))?;
        Ok(())
    }

    async fn save_job(&self, job: &JobRecord) -> Result<()> {
        let conn = self.client().await?;
        let record = serde_json::to_value(job)?;
        let updated = conn
            .execute(
                &format!(
                    "UPDATE {}.jobs SET status = $2, record = $3, updated_at = $4 WHERE id = $1",
                    self.schema
                ),
                &[&job.id, &job.status.as_str(), &record, &job.updated_at],
            )
            .await
            .map_err(|e| db_error(e, "saving job"))?;
        if updated == 0 {
            return Err(TransferError::NotFound(format!("job {}", job.id)));
        }
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobRecord>> {
        let conn = self.client().await?;
        let row = conn
            .query_opt(
                &format!("SELECT record FROM {}.jobs WHERE id = $1", self.schema),
                &[&id],
            )
            .await
            .map_err(|e| db_error(e, "loading job"))?;
        row.map(|r| record_from_json(r.get(0))).transpose()
    }

    async fn list_unfinished(&self) -> Result<Vec<JobRecord>> {
        let conn = self.client().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT record FROM {}.jobs WHERE status NOT IN ({}) ORDER BY created_at",
                    self.schema,
                    terminal_list()
                ),
                &[],
            )
            .await
            .map_err(|e| db_error(e, "listing unfinished jobs"))?;
        rows.into_iter().map(|r| record_from_json(r.get(0))).collect()
    }

    async fn insert_source(&self, source: &SourceRecord) -> Result<()> {
        let conn = self.client().await?;
        let credentials = serde_json::Value::Object(source.credentials.clone());
        conn.execute(
            &format!(
                "INSERT INTO {}.sources (id, organization, kind, credentials, created_at)
                 VALUES ($1, $2, $3, $4, $5)",
                self.schema
            ),
            &[
                &source.id,
                &source.organization,
                &source.kind.as_str(),
                &credentials,
                &source.created_at,
            ],
        )
        .await
        .map_err(|e| db_error(e, "inserting source"))?;
        Ok(())
    }

    async fn get_source(&self, id: &str) -> Result<Option<SourceRecord>> {
        let conn = self.client().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT id, organization, kind, credentials, created_at
                     FROM {}.sources WHERE id = $1",
                    self.schema
                ),
                &[&id],
            )
            .await
            .map_err(|e| db_error(e, "loading source"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let kind: String = row.get(2);
        let credentials = match row.get::<_, serde_json::Value>(3) {
            serde_json::Value::Object(map) => map,
            _ => return Err(TransferError::registry("source credentials are not an object")),
        };
        let created_at: DateTime<Utc> = row.get(4);
        Ok(Some(SourceRecord {
            id: row.get(0),
            organization: row.get(1),
            kind: kind.parse()?,
            credentials,
            created_at,
        }))
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }
}
