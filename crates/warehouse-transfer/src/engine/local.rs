//! In-process execution engine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{ExecutionEngine, JobHandle};
use crate::error::{Result, TransferError};
use crate::orchestrator::TransferOrchestrator;
use crate::registry::{JobRegistry, JobStatus};

struct RunningJob {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

/// Runs each job on its own tokio task.
///
/// At most one orchestration per job id runs at a time. All jobs share one
/// shutdown token; [`LocalEngine::shutdown`] interrupts them and waits for
/// them to save their progress. Interrupted jobs stay unfinished in the
/// registry and are picked up by [`LocalEngine::recover`].
pub struct LocalEngine {
    orchestrator: Arc<TransferOrchestrator>,
    running: Arc<Mutex<HashMap<String, RunningJob>>>,
    shutdown: CancellationToken,
}

impl LocalEngine {
    pub fn new(orchestrator: Arc<TransferOrchestrator>) -> Self {
        Self {
            orchestrator,
            running: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    fn registry(&self) -> &Arc<dyn JobRegistry> {
        self.orchestrator.registry()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RunningJob>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether `job_id` is currently being orchestrated.
    pub fn is_running(&self, job_id: &str) -> bool {
        self.lock().contains_key(job_id)
    }

    /// Re-enqueue every job the registry still lists as unfinished.
    ///
    /// Called at startup after a crash or restart; each job resumes after its
    /// last completed table.
    pub async fn recover(&self) -> Result<Vec<JobHandle>> {
        let unfinished = self.registry().list_unfinished().await?;
        if !unfinished.is_empty() {
            info!("Recovering {} unfinished jobs", unfinished.len());
        }

        let mut handles = Vec::with_capacity(unfinished.len());
        for job in unfinished {
            match self.enqueue(&job.id).await {
                Ok(handle) => handles.push(handle),
                Err(TransferError::DuplicateJob(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(handles)
    }

    /// Interrupt every running job and wait for each to save its progress.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let pending: Vec<watch::Receiver<bool>> =
            self.lock().values().map(|job| job.done.clone()).collect();
        for mut done in pending {
            let _ = done.wait_for(|finished| *finished).await;
        }
    }
}

impl std::fmt::Debug for LocalEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalEngine")
            .field("running", &self.lock().len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ExecutionEngine for LocalEngine {
    async fn enqueue(&self, job_id: &str) -> Result<JobHandle> {
        if self.registry().get_job(job_id).await?.is_none() {
            return Err(TransferError::NotFound(format!("job {}", job_id)));
        }

        let cancel = self.shutdown.child_token();
        let (done_tx, done_rx) = watch::channel(false);
        {
            let mut running = self.lock();
            if running.contains_key(job_id) {
                return Err(TransferError::DuplicateJob(job_id.to_string()));
            }
            running.insert(
                job_id.to_string(),
                RunningJob {
                    cancel: cancel.clone(),
                    done: done_rx.clone(),
                },
            );
        }

        let orchestrator = self.orchestrator.clone();
        let running = self.running.clone();
        let shutdown = self.shutdown.clone();
        let id = job_id.to_string();
        tokio::spawn(async move {
            match orchestrator.run_until_shutdown(&id, &cancel, &shutdown).await {
                Ok(_) | Err(TransferError::Interrupted(_)) => {}
                Err(e) => {
                    error!("Job {} stopped: {}", id, e);
                    mark_failed(orchestrator.registry(), &id, &e).await;
                }
            }
            running
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&id);
            let _ = done_tx.send(true);
        });

        info!("Enqueued job {}", job_id);
        Ok(JobHandle::new(
            job_id.to_string(),
            self.registry().clone(),
            done_rx,
        ))
    }

    async fn query_status(&self, job_id: &str) -> Result<String> {
        let job = self
            .registry()
            .get_job(job_id)
            .await?
            .ok_or_else(|| TransferError::NotFound(format!("job {}", job_id)))?;
        Ok(job.status.to_string())
    }

    async fn cancel(&self, job_id: &str) -> Result<bool> {
        let token = self.lock().get(job_id).map(|job| job.cancel.clone());
        match token {
            Some(token) => {
                info!("Cancelling job {}", job_id);
                token.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Best-effort record of an orchestration that ended without saving a
/// terminal status (registry failure mid-run).
async fn mark_failed(registry: &Arc<dyn JobRegistry>, job_id: &str, err: &TransferError) {
    let Ok(Some(mut job)) = registry.get_job(job_id).await else {
        return;
    };
    if job.status.is_terminal() {
        return;
    }
    job.status = JobStatus::Failed;
    job.error = Some(err.to_string());
    job.touch();
    if let Err(e) = registry.save_job(&job).await {
        warn!("Could not record failure of job {}: {}", job_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ConnectorCatalog, Row};
    use crate::credentials::WarehouseKind;
    use crate::drivers::{MemoryConnectorFactory, MemoryWarehouse};
    use crate::orchestrator::OrchestratorSettings;
    use crate::registry::tests::sample_job;
    use crate::registry::{MemoryRegistry, TableRecord};
    use std::time::Duration;

    fn engine(
        source: &MemoryWarehouse,
        destination: &MemoryWarehouse,
    ) -> (Arc<MemoryRegistry>, LocalEngine) {
        let registry = Arc::new(MemoryRegistry::new());
        let mut catalog = ConnectorCatalog::new();
        catalog.register(Arc::new(MemoryConnectorFactory::new(
            WarehouseKind::Postgres,
            source.clone(),
        )));
        catalog.register(Arc::new(MemoryConnectorFactory::new(
            WarehouseKind::Clickhouse,
            destination.clone(),
        )));
        let orchestrator = TransferOrchestrator::new(
            registry.clone(),
            Arc::new(catalog),
            OrchestratorSettings::default(),
        );
        (registry, LocalEngine::new(Arc::new(orchestrator)))
    }

    #[tokio::test]
    async fn test_enqueue_and_wait() {
        let source = MemoryWarehouse::new();
        let destination = MemoryWarehouse::new();
        source.insert("users", vec![Row::named([("id", "1")])]);
        let (registry, engine) = engine(&source, &destination);
        registry.insert_job(&sample_job("job-1")).await.unwrap();

        let handle = engine.enqueue("job-1").await.unwrap();
        let result = handle.wait().await.unwrap();
        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(engine.query_status("job-1").await.unwrap(), "completed");
        assert!(!engine.is_running("job-1"));
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_is_rejected() {
        let source = MemoryWarehouse::new();
        let destination = MemoryWarehouse::new();
        source.insert("users", vec![Row::named([("id", "1")])]);
        source.set_read_delay(Duration::from_millis(200));
        let (registry, engine) = engine(&source, &destination);
        registry.insert_job(&sample_job("job-1")).await.unwrap();

        let handle = engine.enqueue("job-1").await.unwrap();
        assert!(matches!(
            engine.enqueue("job-1").await,
            Err(TransferError::DuplicateJob(_))
        ));
        handle.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_unknown_job() {
        let (_, engine) = engine(&MemoryWarehouse::new(), &MemoryWarehouse::new());
        assert!(matches!(
            engine.enqueue("missing").await,
            Err(TransferError::NotFound(_))
        ));
        assert!(matches!(
            engine.query_status("missing").await,
            Err(TransferError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_running_job() {
        let source = MemoryWarehouse::new();
        let destination = MemoryWarehouse::new();
        source.insert("a", vec![Row::named([("id", "1")])]);
        source.insert("b", vec![Row::named([("id", "2")])]);
        source.set_read_delay(Duration::from_secs(30));
        let (registry, engine) = engine(&source, &destination);
        registry.insert_job(&sample_job("job-1")).await.unwrap();

        let handle = engine.enqueue("job-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.cancel("job-1").await.unwrap());

        let result = handle.wait().await.unwrap();
        assert_eq!(result.status, JobStatus::Cancelled);
        assert!(!destination.has_table("b"));
        assert_eq!(source.open_sessions(), 0);
        assert!(!engine.cancel("job-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_recover_resumes_unfinished_jobs() {
        let source = MemoryWarehouse::new();
        let destination = MemoryWarehouse::new();
        source.insert("a", vec![Row::named([("id", "1")])]);
        source.insert("b", vec![Row::named([("id", "2")])]);
        let (registry, engine) = engine(&source, &destination);

        // Crashed while transferring table b.
        let mut job = sample_job("job-1");
        let mut a = TableRecord::new("a");
        a.mark_completed(1);
        let mut b = TableRecord::new("b");
        b.mark_in_progress();
        job.status = JobStatus::Transferring;
        job.tables = Some(vec![a, b]);
        registry.insert_job(&job).await.unwrap();

        let mut finished = sample_job("job-2");
        finished.status = JobStatus::Completed;
        registry.insert_job(&finished).await.unwrap();

        let handles = engine.recover().await.unwrap();
        assert_eq!(handles.len(), 1);
        let result = handles.into_iter().next().unwrap().wait().await.unwrap();
        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(result.tables_succeeded, 2);
        assert!(!destination.has_table("a"));
        assert!(destination.has_table("b"));
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_jobs() {
        let source = MemoryWarehouse::new();
        let destination = MemoryWarehouse::new();
        source.insert("a", vec![Row::named([("id", "1")])]);
        source.set_read_delay(Duration::from_secs(30));
        let (registry, engine) = engine(&source, &destination);
        registry.insert_job(&sample_job("job-1")).await.unwrap();

        let handle = engine.enqueue("job-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.shutdown().await;

        assert!(!engine.is_running("job-1"));
        let job = registry.get_job("job-1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Transferring);
        assert!(job.result.is_none());
        assert!(matches!(
            handle.wait().await,
            Err(TransferError::Interrupted(_))
        ));
    }

    #[tokio::test]
    async fn test_job_interrupted_by_shutdown_resumes_after_restart() {
        let source = MemoryWarehouse::new();
        let destination = MemoryWarehouse::new();
        source.insert("a", vec![Row::named([("id", "1")])]);
        source.set_read_delay(Duration::from_millis(300));
        let (registry, engine) = engine(&source, &destination);
        registry.insert_job(&sample_job("job-1")).await.unwrap();

        engine.enqueue("job-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.shutdown().await;
        assert!(!destination.has_table("a"));

        // A new engine over the same registry, as after a process restart.
        let mut catalog = ConnectorCatalog::new();
        catalog.register(Arc::new(MemoryConnectorFactory::new(
            WarehouseKind::Postgres,
            source.clone(),
        )));
        catalog.register(Arc::new(MemoryConnectorFactory::new(
            WarehouseKind::Clickhouse,
            destination.clone(),
        )));
        let orchestrator = TransferOrchestrator::new(
            registry.clone(),
            Arc::new(catalog),
            OrchestratorSettings::default(),
        );
        let restarted = LocalEngine::new(Arc::new(orchestrator));

        let handles = restarted.recover().await.unwrap();
        assert_eq!(handles.len(), 1);
        let result = handles.into_iter().next().unwrap().wait().await.unwrap();
        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(destination.rows("a").unwrap().len(), 1);
    }
}
