//! Request-level operations: submit, inspect and cancel transfer jobs, and
//! register reusable source credentials.
//!
//! [`TransferService`] is what the HTTP router and the CLI talk to. It
//! validates requests, persists records through the [`JobRegistry`] and hands
//! job ids to an [`ExecutionEngine`].

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::{with_connection, ConnectorCatalog};
use crate::credentials::{mask_credentials, resolve, CredentialMap, WarehouseKind};
use crate::engine::{ExecutionEngine, JobHandle};
use crate::error::{Result, TransferError};
use crate::registry::{
    JobRecord, JobRegistry, JobStatus, JobStatusView, SourceRecord, TRANSFER_JOB_TYPE,
};

fn default_job_type() -> String {
    TRANSFER_JOB_TYPE.to_string()
}

/// A request to move every table of one warehouse into another.
#[derive(Clone, Serialize, Deserialize)]
pub struct SubmitJobRequest {
    pub organization: String,
    /// Source label; part of the job id.
    pub source: String,
    pub source_warehouse: WarehouseKind,
    /// Destination warehouse kind.
    pub import_warehouse: WarehouseKind,
    #[serde(rename = "type", default = "default_job_type")]
    pub job_type: String,
    pub dataset_name: String,
    /// Registered source to take the source credentials from.
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub source_credentials: CredentialMap,
    /// Destination credentials.
    #[serde(default)]
    pub link_credentials: CredentialMap,
    /// Appended to the job id so one source can run several jobs.
    #[serde(default)]
    pub suffix: Option<String>,
}

impl SubmitJobRequest {
    /// `{organization}_{source}_workflow[_{suffix}]`
    pub fn job_id(&self) -> String {
        let base = format!("{}_{}_workflow", self.organization, self.source);
        match self.suffix.as_deref() {
            Some(suffix) if !suffix.is_empty() => format!("{}_{}", base, suffix),
            _ => base,
        }
    }
}

impl std::fmt::Debug for SubmitJobRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmitJobRequest")
            .field("organization", &self.organization)
            .field("source", &self.source)
            .field("source_warehouse", &self.source_warehouse)
            .field("import_warehouse", &self.import_warehouse)
            .field("dataset_name", &self.dataset_name)
            .field("source_id", &self.source_id)
            .field("source_credentials", &mask_credentials(&self.source_credentials))
            .field("link_credentials", &mask_credentials(&self.link_credentials))
            .field("suffix", &self.suffix)
            .finish()
    }
}

/// Facade over the registry, the engine and the connector catalog.
#[derive(Clone)]
pub struct TransferService {
    registry: Arc<dyn JobRegistry>,
    engine: Arc<dyn ExecutionEngine>,
    catalog: Arc<ConnectorCatalog>,
}

impl TransferService {
    pub fn new(
        registry: Arc<dyn JobRegistry>,
        engine: Arc<dyn ExecutionEngine>,
        catalog: Arc<ConnectorCatalog>,
    ) -> Self {
        Self {
            registry,
            engine,
            catalog,
        }
    }

    pub fn registry(&self) -> &Arc<dyn JobRegistry> {
        &self.registry
    }

    /// Validate, persist and enqueue a transfer job.
    ///
    /// Credentials are not resolved here: an incomplete map makes the job
    /// fail in its resolving phase, before any connection is opened.
    pub async fn submit_job(&self, request: SubmitJobRequest) -> Result<JobHandle> {
        validate_id_part("organization", &request.organization)?;
        validate_id_part("source", &request.source)?;
        if let Some(suffix) = request.suffix.as_deref() {
            if !suffix.is_empty() {
                validate_id_part("suffix", suffix)?;
            }
        }
        if request.dataset_name.trim().is_empty() {
            return Err(TransferError::Config("dataset_name is required".into()));
        }
        if request.job_type != TRANSFER_JOB_TYPE {
            return Err(TransferError::Config(format!(
                "Unsupported job type '{}'",
                request.job_type
            )));
        }
        for kind in [request.source_warehouse, request.import_warehouse] {
            if !self.catalog.supports(kind) {
                return Err(TransferError::Config(format!(
                    "No connector registered for warehouse kind '{}'",
                    kind
                )));
            }
        }

        let job_id = request.job_id();
        let source_credentials = match request.source_id.as_deref() {
            Some(source_id) => {
                if !request.source_credentials.is_empty() {
                    return Err(TransferError::Config(
                        "source_id and source_credentials are mutually exclusive".into(),
                    ));
                }
                self.registered_credentials(source_id, &request.organization, request.source_warehouse)
                    .await?
            }
            None => request.source_credentials,
        };

        let mut job = JobRecord::new(
            job_id.clone(),
            request.organization,
            request.source,
            request.source_warehouse,
            request.import_warehouse,
            request.dataset_name,
            source_credentials,
            request.link_credentials,
        );
        job.source_id = request.source_id;

        let previous = self.registry.get_job(&job_id).await?;
        self.registry.insert_job(&job).await?;
        info!(
            "Submitted job {} ({} -> {})",
            job_id, job.source_warehouse, job.import_warehouse
        );
        match self.engine.enqueue(&job_id).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.rollback_submit(job, previous, &e).await;
                Err(e)
            }
        }
    }

    /// Undo a submission the engine refused: restore the finished record it
    /// replaced, or close the new one as failed.
    async fn rollback_submit(
        &self,
        mut job: JobRecord,
        previous: Option<JobRecord>,
        err: &TransferError,
    ) {
        let restored = match previous {
            Some(previous) => previous,
            None => {
                job.status = JobStatus::Failed;
                job.error = Some(err.to_string());
                job.touch();
                job
            }
        };
        if let Err(e) = self.registry.save_job(&restored).await {
            warn!("Could not roll back submission of job {}: {}", restored.id, e);
        }
    }

    async fn registered_credentials(
        &self,
        source_id: &str,
        organization: &str,
        kind: WarehouseKind,
    ) -> Result<CredentialMap> {
        let source = self
            .registry
            .get_source(source_id)
            .await?
            .filter(|s| s.organization == organization)
            .ok_or_else(|| TransferError::NotFound(format!("source {}", source_id)))?;
        if source.kind != kind {
            return Err(TransferError::Config(format!(
                "Source {} is a {} warehouse, not {}",
                source_id, source.kind, kind
            )));
        }
        Ok(source.credentials)
    }

    /// Current status of a job, without its credentials.
    pub async fn job_status(&self, job_id: &str) -> Result<JobStatusView> {
        self.registry
            .get_job(job_id)
            .await?
            .map(|job| job.view())
            .ok_or_else(|| TransferError::NotFound(format!("job {}", job_id)))
    }

    /// Persist a reusable credential set and return its id.
    ///
    /// The map must resolve for `kind`; incomplete maps are rejected.
    pub async fn register_source(
        &self,
        organization: &str,
        kind: WarehouseKind,
        credentials: CredentialMap,
    ) -> Result<String> {
        validate_id_part("organization", organization)?;
        resolve(kind, &credentials)?;

        let source = SourceRecord {
            id: Uuid::new_v4().to_string(),
            organization: organization.to_string(),
            kind,
            credentials,
            created_at: Utc::now(),
        };
        self.registry.insert_source(&source).await?;
        info!("Registered {} source {} for {}", kind, source.id, organization);
        Ok(source.id)
    }

    /// Request cancellation. Returns `false` if the job exists but is not running.
    pub async fn cancel_job(&self, job_id: &str) -> Result<bool> {
        if self.registry.get_job(job_id).await?.is_none() {
            return Err(TransferError::NotFound(format!("job {}", job_id)));
        }
        self.engine.cancel(job_id).await
    }

    /// Resolve `credentials`, open a session and list its tables.
    pub async fn verify_connection(
        &self,
        kind: WarehouseKind,
        credentials: &CredentialMap,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        verify_connection(&self.catalog, kind, credentials, cancel).await
    }
}

impl std::fmt::Debug for TransferService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferService")
            .field("registry", &self.registry.backend_type())
            .field("catalog", &self.catalog)
            .finish_non_exhaustive()
    }
}

/// Resolve `credentials`, connect with a connector from `catalog` and list
/// the tables it can see. The session is always closed.
pub async fn verify_connection(
    catalog: &ConnectorCatalog,
    kind: WarehouseKind,
    credentials: &CredentialMap,
    cancel: &CancellationToken,
) -> Result<Vec<String>> {
    let resolved = resolve(kind, credentials)?;
    let connector = catalog.create(&resolved)?;
    with_connection(connector, cancel, |conn| {
        Box::pin(async move { conn.list_tables().await })
    })
    .await
}

/// Job id components must be non-empty and free of whitespace and slashes.
fn validate_id_part(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(TransferError::Config(format!("{} is required", field)));
    }
    if value.chars().any(|c| c.is_whitespace() || c == '/') {
        return Err(TransferError::Config(format!(
            "{} must not contain whitespace or '/': '{}'",
            field, value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Row;
    use crate::drivers::{MemoryConnectorFactory, MemoryWarehouse};
    use crate::engine::LocalEngine;
    use crate::orchestrator::{OrchestratorSettings, TransferOrchestrator};
    use crate::registry::MemoryRegistry;
    use async_trait::async_trait;
    use serde_json::json;

    /// Engine whose queue is always busy.
    struct BusyEngine;

    #[async_trait]
    impl ExecutionEngine for BusyEngine {
        async fn enqueue(&self, job_id: &str) -> Result<JobHandle> {
            Err(TransferError::DuplicateJob(job_id.to_string()))
        }

        async fn query_status(&self, _job_id: &str) -> Result<String> {
            Ok("pending".into())
        }

        async fn cancel(&self, _job_id: &str) -> Result<bool> {
            Ok(false)
        }
    }

    fn busy_service(registry: Arc<dyn JobRegistry>) -> TransferService {
        let mut catalog = ConnectorCatalog::new();
        for kind in [WarehouseKind::Postgres, WarehouseKind::Clickhouse] {
            catalog.register(Arc::new(MemoryConnectorFactory::new(
                kind,
                MemoryWarehouse::new(),
            )));
        }
        TransferService::new(registry, Arc::new(BusyEngine), Arc::new(catalog))
    }

    struct Fixture {
        source: MemoryWarehouse,
        destination: MemoryWarehouse,
        service: TransferService,
    }

    fn fixture() -> Fixture {
        let source = MemoryWarehouse::new();
        let destination = MemoryWarehouse::new();
        let mut catalog = ConnectorCatalog::new();
        catalog.register(Arc::new(MemoryConnectorFactory::new(
            WarehouseKind::Postgres,
            source.clone(),
        )));
        catalog.register(Arc::new(MemoryConnectorFactory::new(
            WarehouseKind::Clickhouse,
            destination.clone(),
        )));
        let catalog = Arc::new(catalog);
        let registry: Arc<dyn JobRegistry> = Arc::new(MemoryRegistry::new());
        let orchestrator = Arc::new(TransferOrchestrator::new(
            registry.clone(),
            catalog.clone(),
            OrchestratorSettings::default(),
        ));
        let engine = Arc::new(LocalEngine::new(orchestrator));
        Fixture {
            source,
            destination,
            service: TransferService::new(registry, engine, catalog),
        }
    }

    fn map(value: serde_json::Value) -> CredentialMap {
        match value {
            serde_json::Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    fn pg_credentials() -> CredentialMap {
        map(json!({"host": "pg", "port": 5432, "database": "app", "user": "u", "password": "p"}))
    }

    fn request() -> SubmitJobRequest {
        serde_json::from_value(json!({
            "organization": "acme",
            "source": "postgres",
            "source_warehouse": "postgres",
            "import_warehouse": "clickhouse",
            "dataset_name": "analytics",
            "source_credentials": pg_credentials(),
            "link_credentials": {"host": "ch", "database": "lake", "user": "u", "password": "p"}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_refused_enqueue_restores_previous_record() {
        let registry: Arc<dyn JobRegistry> = Arc::new(MemoryRegistry::new());
        let service = busy_service(registry.clone());
        let job_id = request().job_id();

        let mut finished = JobRecord::new(
            job_id.clone(),
            "acme",
            "postgres",
            WarehouseKind::Postgres,
            WarehouseKind::Clickhouse,
            "analytics",
            pg_credentials(),
            CredentialMap::new(),
        );
        finished.status = JobStatus::Completed;
        registry.insert_job(&finished).await.unwrap();

        let err = service.submit_job(request()).await.unwrap_err();
        assert!(matches!(err, TransferError::DuplicateJob(_)));
        let stored = registry.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert!(registry.list_unfinished().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refused_enqueue_does_not_strand_new_record() {
        let registry: Arc<dyn JobRegistry> = Arc::new(MemoryRegistry::new());
        let service = busy_service(registry.clone());

        assert!(service.submit_job(request()).await.is_err());
        let stored = registry.get_job(&request().job_id()).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(registry.list_unfinished().await.unwrap().is_empty());
    }

    #[test]
    fn test_request_debug_masks_credentials() {
        let output = format!("{:?}", request());
        assert!(output.contains("****"));
        assert!(!output.contains("\"p\""));
    }

    #[test]
    fn test_job_id_format() {
        let mut req = request();
        assert_eq!(req.job_id(), "acme_postgres_workflow");
        assert_eq!(req.job_type, "transfer");
        req.suffix = Some("nightly".into());
        assert_eq!(req.job_id(), "acme_postgres_workflow_nightly");
    }

    #[tokio::test]
    async fn test_submit_runs_to_completion() {
        let fx = fixture();
        fx.source.insert("users", vec![Row::named([("id", "1")])]);

        let handle = fx.service.submit_job(request()).await.unwrap();
        assert_eq!(handle.job_id(), "acme_postgres_workflow");
        let result = handle.wait().await.unwrap();
        assert_eq!(result.status, JobStatus::Completed);
        assert!(fx.destination.has_table("users"));

        let view = fx.service.job_status("acme_postgres_workflow").await.unwrap();
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.tables.len(), 1);
    }

    #[tokio::test]
    async fn test_submit_rejects_bad_identifiers() {
        let fx = fixture();
        let mut req = request();
        req.organization = "acme corp".into();
        assert!(fx.service.submit_job(req).await.unwrap_err().is_configuration());

        let mut req = request();
        req.dataset_name = " ".into();
        assert!(fx.service.submit_job(req).await.unwrap_err().is_configuration());
    }

    #[tokio::test]
    async fn test_submit_rejects_unregistered_kind() {
        let fx = fixture();
        let mut req = request();
        req.import_warehouse = WarehouseKind::Snowflake;
        let err = fx.service.submit_job(req).await.unwrap_err();
        assert!(err.to_string().contains("snowflake"));
        assert_eq!(fx.source.stats().connects, 0);
    }

    #[tokio::test]
    async fn test_submit_with_registered_source() {
        let fx = fixture();
        fx.source.insert("users", vec![Row::named([("id", "1")])]);
        let source_id = fx
            .service
            .register_source("acme", WarehouseKind::Postgres, pg_credentials())
            .await
            .unwrap();

        let mut req = request();
        req.source_credentials = CredentialMap::new();
        req.source_id = Some(source_id.clone());
        let result = fx.service.submit_job(req).await.unwrap().wait().await.unwrap();
        assert_eq!(result.status, JobStatus::Completed);

        let job = fx
            .service
            .registry()
            .get_job("acme_postgres_workflow")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.source_id.as_deref(), Some(source_id.as_str()));
    }

    #[tokio::test]
    async fn test_registered_source_is_scoped_to_organization() {
        let fx = fixture();
        let source_id = fx
            .service
            .register_source("other-org", WarehouseKind::Postgres, pg_credentials())
            .await
            .unwrap();

        let mut req = request();
        req.source_credentials = CredentialMap::new();
        req.source_id = Some(source_id);
        assert!(matches!(
            fx.service.submit_job(req).await,
            Err(TransferError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_register_source_rejects_incomplete_credentials() {
        let fx = fixture();
        let mut creds = pg_credentials();
        creds.remove("password");
        let err = fx
            .service
            .register_source("acme", WarehouseKind::Postgres, creds)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::MissingCredentialFields { .. }));
    }

    #[tokio::test]
    async fn test_status_and_cancel_unknown_job() {
        let fx = fixture();
        assert!(matches!(
            fx.service.job_status("nope").await,
            Err(TransferError::NotFound(_))
        ));
        assert!(matches!(
            fx.service.cancel_job("nope").await,
            Err(TransferError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_verify_connection_lists_tables() {
        let fx = fixture();
        fx.source.insert("users", vec![Row::named([("id", "1")])]);
        let tables = fx
            .service
            .verify_connection(
                WarehouseKind::Postgres,
                &pg_credentials(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(tables, vec!["users".to_string()]);
        assert_eq!(fx.source.open_sessions(), 0);
    }
}
