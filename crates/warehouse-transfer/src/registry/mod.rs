//! Job and source persistence.
//!
//! The [`JobRegistry`] trait defines the interface the service and the
//! orchestrator use to persist job records and registered sources:
//!
//! - **Memory**: [`MemoryRegistry`], for tests and single-process use
//! - **File**: [`FileRegistry`], one signed JSON document
//! - **PostgreSQL**: [`PgRegistry`], tables in the `_warehouse_transfer` schema
//!
//! The orchestrator is the only writer of a job record once it has been
//! submitted; it saves the whole record after every transition.

mod file;
mod memory;
mod postgres;

pub use file::FileRegistry;
pub use memory::MemoryRegistry;
pub use postgres::PgRegistry;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{RegistryBackend, RegistryConfig};
use crate::credentials::{mask_credentials, CredentialMap, WarehouseKind};
use crate::error::{Result, TransferError};
use crate::orchestrator::TransferResult;

/// Value of the persisted `type` field for table transfer jobs.
pub const TRANSFER_JOB_TYPE: &str = "transfer";

/// Overall job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Resolving,
    Enumerating,
    Transferring,
    Completed,
    PartialFailure,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Resolving => "resolving",
            JobStatus::Enumerating => "enumerating",
            JobStatus::Transferring => "transferring",
            JobStatus::Completed => "completed",
            JobStatus::PartialFailure => "partial_failure",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::PartialFailure
                | JobStatus::Failed
                | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "resolving" => Ok(JobStatus::Resolving),
            "enumerating" => Ok(JobStatus::Enumerating),
            "transferring" => Ok(JobStatus::Transferring),
            "completed" => Ok(JobStatus::Completed),
            "partial_failure" => Ok(JobStatus::PartialFailure),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(TransferError::registry(format!("Invalid job status: {}", s))),
        }
    }
}

/// Per-table status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Pending,
    InProgress,
    Completed,
    /// Source table was empty; nothing was created.
    Skipped,
    Failed,
}

impl TableStatus {
    /// Completed and skipped tables are not attempted again on resume.
    pub fn is_done(&self) -> bool {
        matches!(self, TableStatus::Completed | TableStatus::Skipped)
    }
}

/// Per-table progress inside a job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRecord {
    pub name: String,
    pub status: TableStatus,
    #[serde(default)]
    pub rows_transferred: u64,
    /// Step attempts across all runs of the job.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TableRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: TableStatus::Pending,
            rows_transferred: 0,
            attempts: 0,
            error: None,
            completed_at: None,
        }
    }

    pub fn mark_in_progress(&mut self) {
        self.status = TableStatus::InProgress;
        self.error = None;
    }

    pub fn mark_completed(&mut self, rows: u64) {
        self.status = TableStatus::Completed;
        self.rows_transferred = rows;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_skipped(&mut self) {
        self.status = TableStatus::Skipped;
        self.rows_transferred = 0;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: &str) {
        self.status = TableStatus::Failed;
        self.error = Some(error.to_string());
    }
}

/// Persisted transfer job.
#[derive(Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub organization: String,
    /// Source label used in the job id.
    pub source: String,
    /// Registered source whose credentials were copied into this job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    /// Destination warehouse kind.
    pub import_warehouse: WarehouseKind,
    pub source_warehouse: WarehouseKind,
    #[serde(rename = "type")]
    pub job_type: String,
    pub dataset_name: String,
    pub source_credentials: CredentialMap,
    /// Destination credentials.
    pub link_credentials: CredentialMap,
    pub status: JobStatus,
    /// Filled in by enumeration; `None` until then.
    #[serde(default)]
    pub tables: Option<Vec<TableRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TransferResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// A new pending transfer job.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        organization: impl Into<String>,
        source: impl Into<String>,
        source_warehouse: WarehouseKind,
        import_warehouse: WarehouseKind,
        dataset_name: impl Into<String>,
        source_credentials: CredentialMap,
        link_credentials: CredentialMap,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            organization: organization.into(),
            source: source.into(),
            source_id: None,
            import_warehouse,
            source_warehouse,
            job_type: TRANSFER_JOB_TYPE.to_string(),
            dataset_name: dataset_name.into(),
            source_credentials,
            link_credentials,
            status: JobStatus::Pending,
            tables: None,
            current_table: None,
            error: None,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn table_mut(&mut self, name: &str) -> Option<&mut TableRecord> {
        self.tables
            .as_mut()
            .and_then(|tables| tables.iter_mut().find(|t| t.name == name))
    }

    /// Status view without credentials.
    pub fn view(&self) -> JobStatusView {
        JobStatusView {
            id: self.id.clone(),
            organization: self.organization.clone(),
            source: self.source.clone(),
            source_warehouse: self.source_warehouse,
            import_warehouse: self.import_warehouse,
            dataset_name: self.dataset_name.clone(),
            status: self.status,
            tables: self.tables.clone().unwrap_or_default(),
            current_table: self.current_table.clone(),
            error: self.error.clone(),
            result: self.result.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

impl fmt::Debug for JobRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRecord")
            .field("id", &self.id)
            .field("organization", &self.organization)
            .field("source", &self.source)
            .field("source_warehouse", &self.source_warehouse)
            .field("import_warehouse", &self.import_warehouse)
            .field("dataset_name", &self.dataset_name)
            .field("source_credentials", &mask_credentials(&self.source_credentials))
            .field("link_credentials", &mask_credentials(&self.link_credentials))
            .field("status", &self.status)
            .field("tables", &self.tables)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// What callers see when they ask for a job's status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusView {
    pub id: String,
    pub organization: String,
    pub source: String,
    pub source_warehouse: WarehouseKind,
    pub import_warehouse: WarehouseKind,
    pub dataset_name: String,
    pub status: JobStatus,
    pub tables: Vec<TableRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TransferResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Reusable credentials registered by an organization.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: String,
    pub organization: String,
    pub kind: WarehouseKind,
    pub credentials: CredentialMap,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for SourceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceRecord")
            .field("id", &self.id)
            .field("organization", &self.organization)
            .field("kind", &self.kind)
            .field("credentials", &mask_credentials(&self.credentials))
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Persistence backend for jobs and sources.
///
/// Implementations must be `Send + Sync`; one registry handle is shared by
/// the service, the engine and every running orchestration.
#[async_trait]
pub trait JobRegistry: Send + Sync {
    /// Create tables or files. Idempotent.
    async fn init_schema(&self) -> Result<()>;

    /// Persist a new job. Fails with `DuplicateJob` if a non-terminal record
    /// with the same id exists; a terminal record is replaced.
    async fn insert_job(&self, job: &JobRecord) -> Result<()>;

    /// Overwrite an existing job record.
    async fn save_job(&self, job: &JobRecord) -> Result<()>;

    async fn get_job(&self, id: &str) -> Result<Option<JobRecord>>;

    /// Jobs not yet in a terminal status, oldest first.
    async fn list_unfinished(&self) -> Result<Vec<JobRecord>>;

    async fn insert_source(&self, source: &SourceRecord) -> Result<()>;

    async fn get_source(&self, id: &str) -> Result<Option<SourceRecord>>;

    /// Backend name for logging.
    fn backend_type(&self) -> &'static str;
}

/// Build and initialize the configured registry backend.
pub async fn open(config: &RegistryConfig) -> Result<Arc<dyn JobRegistry>> {
    let registry: Arc<dyn JobRegistry> = match config.backend {
        RegistryBackend::Memory => Arc::new(MemoryRegistry::new()),
        RegistryBackend::File => {
            let key = config.signing_key.as_deref().ok_or_else(|| {
                TransferError::Config("registry.signing_key is required for the file backend".into())
            })?;
            Arc::new(FileRegistry::open(&config.path, key).await?)
        }
        RegistryBackend::Postgres => {
            let pg = config.postgres.as_ref().ok_or_else(|| {
                TransferError::Config("registry.postgres is required for the postgres backend".into())
            })?;
            Arc::new(PgRegistry::connect(pg).await?)
        }
    };
    registry.init_schema().await?;
    info!("Using {} job registry", registry.backend_type());
    Ok(registry)
}

/// Shared `insert_job` rule: only terminal records may be replaced.
pub(crate) fn check_replaceable(existing: Option<&JobRecord>) -> Result<()> {
    match existing {
        Some(job) if !job.status.is_terminal() => Err(TransferError::DuplicateJob(job.id.clone())),
        _ => Ok(()),
    }
}
