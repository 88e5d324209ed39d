//! File-backed registry: one JSON document with an integrity signature.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{check_replaceable, JobRecord, JobRegistry, SourceRecord};
use crate::error::{Result, TransferError};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    jobs: BTreeMap<String, JobRecord>,
    #[serde(default)]
    sources: BTreeMap<String, SourceRecord>,
    /// HMAC-SHA256 over the document without this field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hmac: Option<String>,
}

impl Document {
    fn compute_hmac(&self, key: &str) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;
        let content = serde_json::to_string(&unsigned)?;

        let mut mac = HmacSha256::new_from_slice(key.as_bytes())
            .map_err(|e| TransferError::registry(format!("Failed to create HMAC: {}", e)))?;
        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// Registry persisted to a single JSON file.
///
/// Every write rewrites the whole document to a temp file and renames it
/// into place. Reads are served from memory after [`FileRegistry::open`].
pub struct FileRegistry {
    path: PathBuf,
    signing_key: String,
    doc: Mutex<Document>,
}

impl FileRegistry {
    /// Open the registry at `path`, loading it if the file exists.
    ///
    /// Fails if the stored signature does not match `signing_key`.
    pub async fn open(path: impl AsRef<Path>, signing_key: impl Into<String>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let signing_key = signing_key.into();
        let doc = if tokio::fs::try_exists(&path).await? {
            Self::load(&path, &signing_key).await?
        } else {
            Document::default()
        };
        Ok(Self {
            path,
            signing_key,
            doc: Mutex::new(doc),
        })
    }

    async fn load(path: &Path, key: &str) -> Result<Document> {
        let content = tokio::fs::read_to_string(path).await?;
        let doc: Document = serde_json::from_str(&content)?;

        match &doc.hmac {
            Some(stored) => {
                if stored != &doc.compute_hmac(key)? {
                    return Err(TransferError::registry(format!(
                        "{} failed its integrity check: HMAC mismatch (possible tampering)",
                        path.display()
                    )));
                }
            }
            None => warn!(
                "Registry file {} has no HMAC signature, integrity cannot be verified",
                path.display()
            ),
        }
        debug!(
            "Loaded {} jobs and {} sources from {}",
            doc.jobs.len(),
            doc.sources.len(),
            path.display()
        );
        Ok(doc)
    }

    /// Sign and atomically write `next`, then make it the in-memory state.
    ///
    /// On a failed write `current` is left untouched.
    async fn commit(&self, current: &mut Document, mut next: Document) -> Result<()> {
        next.hmac = Some(next.compute_hmac(&self.signing_key)?);
        let content = serde_json::to_string_pretty(&next)?;

        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, content).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;
        *current = next;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for FileRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileRegistry")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl JobRegistry for FileRegistry {
    async fn init_schema(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        if !tokio::fs::try_exists(&self.path).await? {
            let mut doc = self.doc.lock().await;
            let next = doc.clone();
            self.commit(&mut doc, next).await?;
        }
        Ok(())
    }

    async fn insert_job(&self, job: &JobRecord) -> Result<()> {
        let mut doc = self.doc.lock().await;
        check_replaceable(doc.jobs.get(&job.id))?;
        let mut next = doc.clone();
        next.jobs.insert(job.id.clone(), job.clone());
        self.commit(&mut doc, next).await
    }

    async fn save_job(&self, job: &JobRecord) -> Result<()> {
        let mut doc = self.doc.lock().await;
        if !doc.jobs.contains_key(&job.id) {
            return Err(TransferError::NotFound(format!("job {}", job.id)));
        }
        let mut next = doc.clone();
        next.jobs.insert(job.id.clone(), job.clone());
        self.commit(&mut doc, next).await
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobRecord>> {
        Ok(self.doc.lock().await.jobs.get(id).cloned())
    }

    async fn list_unfinished(&self) -> Result<Vec<JobRecord>> {
        let doc = self.doc.lock().await;
        let mut jobs: Vec<JobRecord> = doc
            .jobs
            .values()
            .filter(|job| !job.status.is_terminal())
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn insert_source(&self, source: &SourceRecord) -> Result<()> {
        let mut doc = self.doc.lock().await;
        let mut next = doc.clone();
        next.sources.insert(source.id.clone(), source.clone());
        self.commit(&mut doc, next).await
    }

    async fn get_source(&self, id: &str) -> Result<Option<SourceRecord>> {
        Ok(self.doc.lock().await.sources.get(id).cloned())
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::sample_job;
    use crate::registry::{JobStatus, TableRecord};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_jobs_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.json");

        let registry = FileRegistry::open(&path, "key").await.unwrap();
        registry.init_schema().await.unwrap();
        let mut job = sample_job("acme_pg_workflow");
        registry.insert_job(&job).await.unwrap();
        job.status = JobStatus::Transferring;
        job.tables = Some(vec![TableRecord::new("users")]);
        registry.save_job(&job).await.unwrap();

        let reopened = FileRegistry::open(&path, "key").await.unwrap();
        let loaded = reopened.get_job("acme_pg_workflow").await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Transferring);
        assert_eq!(loaded.tables.unwrap()[0].name, "users");
        assert_eq!(reopened.list_unfinished().await.unwrap().len(), 1);
        assert!(!dir.path().join("jobs.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_is_signed_pretty_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.json");
        let registry = FileRegistry::open(&path, "key").await.unwrap();
        registry.init_schema().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert!(value["hmac"].is_string());
        assert!(content.contains('\n'));
    }

    #[tokio::test]
    async fn test_tampering_is_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.json");
        let registry = FileRegistry::open(&path, "key").await.unwrap();
        registry.insert_job(&sample_job("acme_pg_workflow")).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, content.replace("analytics", "exfiltrated")).unwrap();

        let err = FileRegistry::open(&path, "key").await.unwrap_err();
        assert!(matches!(err, TransferError::Registry(_)));
    }

    #[tokio::test]
    async fn test_wrong_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.json");
        let registry = FileRegistry::open(&path, "key").await.unwrap();
        registry.insert_job(&sample_job("a")).await.unwrap();

        assert!(FileRegistry::open(&path, "other").await.is_err());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_state_unchanged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.json");
        let registry = FileRegistry::open(&path, "key").await.unwrap();
        let mut job = sample_job("acme_pg_workflow");
        registry.insert_job(&job).await.unwrap();

        // A non-empty directory in place of the file makes the rename fail.
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), "x").unwrap();

        job.status = JobStatus::Completed;
        assert!(registry.save_job(&job).await.is_err());
        assert!(registry.insert_job(&sample_job("other")).await.is_err());

        let stored = registry.get_job("acme_pg_workflow").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert!(registry.get_job("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unsigned_file_is_accepted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.json");
        std::fs::write(&path, r#"{"jobs": {}, "sources": {}}"#).unwrap();

        let registry = FileRegistry::open(&path, "key").await.unwrap();
        assert!(registry.get_job("x").await.unwrap().is_none());
    }
}
