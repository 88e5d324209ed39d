//! Transfer orchestrator - per-job state machine.
//!
//! A job moves through `Resolving → Enumerating → Transferring → terminal`.
//! Every phase runs as a step under [`execute_step`] with its own timeout and
//! retry policy, and every transition is saved to the registry before the
//! next step starts. Re-running a job id whose record is not terminal resumes
//! after the last completed table.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ExecutionConfig, LoadMode};
use crate::core::{with_connection, ConnectorCatalog};
use crate::credentials::{resolve, CredentialMap, Credentials, WarehouseKind};
use crate::engine::{
    execute_step, RetryPolicy, StepOptions, DEFAULT_CREDENTIAL_TIMEOUT, DEFAULT_ENUMERATE_TIMEOUT,
    DEFAULT_TABLE_TIMEOUT,
};
use crate::error::{Result, TransferError};
use crate::registry::{JobRecord, JobRegistry, JobStatus, TableRecord, TableStatus};
use crate::transfer::{TableOutcome, TableTransfer};

/// Outcome of one job run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferResult {
    /// Final status.
    pub status: JobStatus,

    /// Tables that reached a terminal outcome.
    pub tables_attempted: usize,

    /// Tables transferred or skipped as empty.
    pub tables_succeeded: usize,

    /// Tables that failed after retries.
    pub tables_failed: usize,

    /// Rows moved per table.
    pub rows_per_table: BTreeMap<String, u64>,

    /// Total rows moved.
    pub rows_transferred: u64,

    /// Names of failed tables.
    pub failed_tables: Vec<String>,

    /// First error encountered, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_error: Option<String>,

    /// Wall time of this run in milliseconds.
    pub duration_ms: u64,
}

/// Step budgets and load behavior.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub credential_timeout: Duration,
    pub enumerate_timeout: Duration,
    pub table_timeout: Duration,
    pub retry: RetryPolicy,
    pub load_mode: LoadMode,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            credential_timeout: DEFAULT_CREDENTIAL_TIMEOUT,
            enumerate_timeout: DEFAULT_ENUMERATE_TIMEOUT,
            table_timeout: DEFAULT_TABLE_TIMEOUT,
            retry: RetryPolicy::default(),
            load_mode: LoadMode::default(),
        }
    }
}

impl From<&ExecutionConfig> for OrchestratorSettings {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            credential_timeout: config.credential_timeout(),
            enumerate_timeout: config.enumerate_timeout(),
            table_timeout: config.table_timeout(),
            retry: config.retry_policy(),
            load_mode: config.load_mode,
        }
    }
}

/// Drives persisted jobs to a terminal status.
pub struct TransferOrchestrator {
    registry: Arc<dyn JobRegistry>,
    catalog: Arc<ConnectorCatalog>,
    settings: OrchestratorSettings,
}

impl TransferOrchestrator {
    pub fn new(
        registry: Arc<dyn JobRegistry>,
        catalog: Arc<ConnectorCatalog>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            registry,
            catalog,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<dyn JobRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &Arc<ConnectorCatalog> {
        &self.catalog
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Run (or resume) the job `job_id`.
    ///
    /// Job-level failures (bad credentials, enumeration failure, table
    /// failures, cancellation) are recorded in the job and returned inside
    /// the `TransferResult`. `Err` means the registry could not be read or
    /// written.
    pub async fn run(&self, job_id: &str, cancel: &CancellationToken) -> Result<TransferResult> {
        self.run_until_shutdown(job_id, cancel, &CancellationToken::new())
            .await
    }

    /// Like [`run`](Self::run), but a cancellation observed while `shutdown`
    /// is cancelled interrupts the job instead of ending it.
    ///
    /// `cancel` must fire when `shutdown` does. An interrupted job keeps its
    /// non-terminal status and table cursor, so the next
    /// [`LocalEngine::recover`](crate::engine::LocalEngine::recover) resumes
    /// it, and this returns [`TransferError::Interrupted`].
    pub async fn run_until_shutdown(
        &self,
        job_id: &str,
        cancel: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> Result<TransferResult> {
        let started = Instant::now();
        let mut record = self
            .registry
            .get_job(job_id)
            .await?
            .ok_or_else(|| TransferError::NotFound(format!("job {}", job_id)))?;

        if record.status.is_terminal() {
            if let Some(result) = record.result.clone() {
                info!("Job {} already finished with status {}", job_id, record.status);
                return Ok(result);
            }
        }

        info!(
            "Starting job {}: {} -> {} for {}",
            job_id, record.source_warehouse, record.import_warehouse, record.organization
        );

        // Phase 1: Resolve credentials
        self.transition(&mut record, JobStatus::Resolving).await?;
        let (source, destination) = match self.resolve_credentials(&record, cancel).await {
            Ok(pair) => pair,
            Err(e) => return self.abort(&mut record, e, started, shutdown).await,
        };

        // Phase 2: Enumerate source tables (skipped on resume)
        if record.tables.is_none() {
            self.transition(&mut record, JobStatus::Enumerating).await?;
            match self.enumerate(&source, cancel).await {
                Ok(tables) => {
                    info!("Job {}: found {} source tables", job_id, tables.len());
                    record.tables = Some(tables.into_iter().map(TableRecord::new).collect());
                }
                Err(e) => return self.abort(&mut record, e, started, shutdown).await,
            }
        } else {
            let done = record
                .tables
                .iter()
                .flatten()
                .filter(|t| t.status.is_done())
                .count();
            info!("Job {}: resuming after {} finished tables", job_id, done);
        }

        // Phase 3: Transfer tables in enumeration order
        self.transition(&mut record, JobStatus::Transferring).await?;
        let transfer = TableTransfer::new(
            self.catalog.clone(),
            source,
            destination,
            self.settings.load_mode,
        );
        let names: Vec<String> = record
            .tables
            .iter()
            .flatten()
            .map(|t| t.name.clone())
            .collect();

        let mut first_error: Option<String> = None;
        let mut cancelled = false;
        for name in names {
            if record.table_mut(&name).is_some_and(|t| t.status.is_done()) {
                continue;
            }
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            if let Some(table) = record.table_mut(&name) {
                table.mark_in_progress();
            }
            record.current_table = Some(name.clone());
            record.touch();
            self.registry.save_job(&record).await?;

            let attempts = AtomicU32::new(0);
            let outcome = self.transfer_table(&transfer, &name, &attempts, cancel).await;

            let Some(table) = record.table_mut(&name) else {
                continue;
            };
            table.attempts += attempts.load(Ordering::SeqCst);
            match outcome {
                Ok(TableOutcome::Transferred { rows }) => {
                    info!("{}: transferred {} rows", name, rows);
                    table.mark_completed(rows);
                }
                Ok(TableOutcome::Skipped) => table.mark_skipped(),
                Err(TransferError::Cancelled) if shutdown.is_cancelled() => {
                    info!("{}: interrupted by shutdown", name);
                    table.status = TableStatus::Pending;
                    cancelled = true;
                }
                Err(e) => {
                    if matches!(e, TransferError::Cancelled) {
                        cancelled = true;
                    }
                    warn!("{}: transfer failed: {}", name, e);
                    table.mark_failed(&e.to_string());
                    first_error.get_or_insert_with(|| format!("{}: {}", name, e));
                }
            }
            record.current_table = None;
            record.touch();
            self.registry.save_job(&record).await?;

            if cancelled {
                break;
            }
        }

        if cancelled && shutdown.is_cancelled() {
            return self.interrupt(&mut record).await;
        }

        let status = if cancelled {
            JobStatus::Cancelled
        } else if record.tables.iter().flatten().any(|t| t.status == TableStatus::Failed) {
            JobStatus::PartialFailure
        } else {
            JobStatus::Completed
        };
        self.finish(&mut record, status, first_error, started).await
    }

    async fn transition(&self, record: &mut JobRecord, status: JobStatus) -> Result<()> {
        record.status = status;
        record.touch();
        self.registry.save_job(record).await
    }

    async fn resolve_credentials(
        &self,
        record: &JobRecord,
        cancel: &CancellationToken,
    ) -> Result<(Credentials, Credentials)> {
        let options = StepOptions::new("resolve_credentials", self.settings.credential_timeout)
            .with_retry(RetryPolicy::no_retry());
        let (source_kind, source_map) = (record.source_warehouse, &record.source_credentials);
        let (link_kind, link_map) = (record.import_warehouse, &record.link_credentials);

        let (source, destination) = execute_step(&options, cancel, |_| async move {
            resolve_pair(source_kind, source_map, link_kind, link_map)
        })
        .await?;

        for kind in [source.kind(), destination.kind()] {
            if !self.catalog.supports(kind) {
                return Err(TransferError::Config(format!(
                    "No connector registered for {}",
                    kind
                )));
            }
        }
        Ok((source, destination))
    }

    async fn enumerate(
        &self,
        source: &Credentials,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let options = StepOptions::new("enumerate_tables", self.settings.enumerate_timeout)
            .with_retry(self.settings.retry.clone());
        let catalog = &self.catalog;

        execute_step(&options, cancel, |ctx| async move {
            list_source_tables(catalog, source, &ctx.cancel).await
        })
        .await
    }

    async fn transfer_table(
        &self,
        transfer: &TableTransfer,
        table: &str,
        attempts: &AtomicU32,
        cancel: &CancellationToken,
    ) -> Result<TableOutcome> {
        let options = StepOptions::new(format!("transfer_table:{}", table), self.settings.table_timeout)
            .with_retry(self.settings.retry.clone());

        execute_step(&options, cancel, |ctx| async move {
            attempts.store(ctx.attempt, Ordering::SeqCst);
            transfer.run(table, &ctx.cancel).await
        })
        .await
    }

    /// Record a job-level failure before any table was transferred.
    async fn abort(
        &self,
        record: &mut JobRecord,
        err: TransferError,
        started: Instant,
        shutdown: &CancellationToken,
    ) -> Result<TransferResult> {
        if matches!(err, TransferError::Cancelled) && shutdown.is_cancelled() {
            return self.interrupt(record).await;
        }
        let status = if matches!(err, TransferError::Cancelled) {
            JobStatus::Cancelled
        } else {
            error!("Job {} failed during {}: {}", record.id, record.status, err);
            JobStatus::Failed
        };
        record.error = Some(err.to_string());
        self.finish(record, status, Some(err.to_string()), started)
            .await
    }

    /// Save the job as-is without a terminal status.
    async fn interrupt(&self, record: &mut JobRecord) -> Result<TransferResult> {
        record.current_table = None;
        record.touch();
        self.registry.save_job(record).await?;
        warn!(
            "Job {} interrupted during {}; it resumes on restart",
            record.id, record.status
        );
        Err(TransferError::Interrupted(record.id.clone()))
    }

    async fn finish(
        &self,
        record: &mut JobRecord,
        status: JobStatus,
        first_error: Option<String>,
        started: Instant,
    ) -> Result<TransferResult> {
        let result = summarize(record, status, first_error, started.elapsed());

        record.status = status;
        record.current_table = None;
        record.result = Some(result.clone());
        record.touch();
        self.registry.save_job(record).await?;

        info!(
            "Job {} finished: {} ({}/{} tables, {} rows)",
            record.id,
            status,
            result.tables_succeeded,
            result.tables_attempted,
            result.rows_transferred
        );
        Ok(result)
    }
}

impl std::fmt::Debug for TransferOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferOrchestrator")
            .field("registry", &self.registry.backend_type())
            .field("catalog", &self.catalog)
            .field("settings", &self.settings)
            .finish()
    }
}

fn resolve_pair(
    source_kind: WarehouseKind,
    source: &CredentialMap,
    link_kind: WarehouseKind,
    link: &CredentialMap,
) -> Result<(Credentials, Credentials)> {
    Ok((resolve(source_kind, source)?, resolve(link_kind, link)?))
}

async fn list_source_tables(
    catalog: &ConnectorCatalog,
    source: &Credentials,
    cancel: &CancellationToken,
) -> Result<Vec<String>> {
    let connector = catalog.create(source)?;
    with_connection(connector, cancel, |conn| {
        Box::pin(async move { conn.list_tables().await })
    })
    .await
}

fn summarize(
    record: &JobRecord,
    status: JobStatus,
    first_error: Option<String>,
    elapsed: Duration,
) -> TransferResult {
    let tables = record.tables.as_deref().unwrap_or_default();

    let mut rows_per_table = BTreeMap::new();
    let mut failed_tables = Vec::new();
    let mut tables_succeeded = 0;
    for table in tables {
        match table.status {
            TableStatus::Completed | TableStatus::Skipped => {
                tables_succeeded += 1;
                rows_per_table.insert(table.name.clone(), table.rows_transferred);
            }
            TableStatus::Failed => failed_tables.push(table.name.clone()),
            TableStatus::Pending | TableStatus::InProgress => {}
        }
    }

    // A resumed job keeps the first error of its earlier run.
    let first_error = first_error.or_else(|| {
        tables
            .iter()
            .find_map(|t| t.error.as_ref().map(|e| format!("{}: {}", t.name, e)))
    });

    TransferResult {
        status,
        tables_attempted: tables_succeeded + failed_tables.len(),
        tables_succeeded,
        tables_failed: failed_tables.len(),
        rows_transferred: rows_per_table.values().sum(),
        rows_per_table,
        failed_tables,
        first_error,
        duration_ms: elapsed.as_millis() as u64,
    }
}
