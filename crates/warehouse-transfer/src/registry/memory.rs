//! In-memory registry.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{check_replaceable, JobRecord, JobRegistry, SourceRecord};
use crate::error::{Result, TransferError};

/// Registry that lives as long as the process.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    jobs: RwLock<HashMap<String, JobRecord>>,
    sources: RwLock<HashMap<String, SourceRecord>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRegistry for MemoryRegistry {
    async fn init_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn insert_job(&self, job: &JobRecord) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        check_replaceable(jobs.get(&job.id))?;
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn save_job(&self, job: &JobRecord) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(TransferError::NotFound(format!("job {}", job.id))),
        }
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobRecord>> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn list_unfinished(&self) -> Result<Vec<JobRecord>> {
        let mut jobs: Vec<JobRecord> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| !job.status.is_terminal())
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn insert_source(&self, source: &SourceRecord) -> Result<()> {
        self.sources
            .write()
            .await
            .insert(source.id.clone(), source.clone());
        Ok(())
    }

    async fn get_source(&self, id: &str) -> Result<Option<SourceRecord>> {
        Ok(self.sources.read().await.get(id).cloned())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::sample_job;
    use crate::registry::JobStatus;

    #[tokio::test]
    async fn test_insert_rejects_running_duplicate() {
        let registry = MemoryRegistry::new();
        let mut job = sample_job("acme_pg_workflow");
        registry.insert_job(&job).await.unwrap();
        assert!(matches!(
            registry.insert_job(&job).await,
            Err(TransferError::DuplicateJob(_))
        ));

        job.status = JobStatus::Completed;
        registry.save_job(&job).await.unwrap();
        registry.insert_job(&sample_job("acme_pg_workflow")).await.unwrap();
        let stored = registry.get_job("acme_pg_workflow").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_save_unknown_job_fails() {
        let registry = MemoryRegistry::new();
        let err = registry.save_job(&sample_job("ghost")).await.unwrap_err();
        assert!(matches!(err, TransferError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_unfinished_skips_terminal() {
        let registry = MemoryRegistry::new();
        let running = sample_job("a");
        let mut done = sample_job("b");
        done.status = JobStatus::PartialFailure;
        registry.insert_job(&running).await.unwrap();
        registry.insert_job(&done).await.unwrap();

        let unfinished = registry.list_unfinished().await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].id, "a");
    }
}
