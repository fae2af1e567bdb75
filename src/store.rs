//! Side-car job metadata store.
//!
//! One JSON record per job at `<root>/<job_id>.job.json`. Records are created
//! exclusively (`O_CREAT | O_EXCL`) and never rewritten; lookup is a single
//! path computation from the id.

use std::path::PathBuf;

use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::StoreError;
use crate::job::{JobId, JobRecord, SCHEMA_VERSION};

/// Suffix of every record file.
const RECORD_SUFFIX: &str = ".job.json";

/// File-backed store of job records.
#[derive(Debug, Clone)]
pub struct JobStore {
    root: PathBuf,
}

impl JobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path of the record for `job_id`.
    pub fn record_path(&self, job_id: &JobId) -> PathBuf {
        self.root.join(format!("{job_id}{RECORD_SUFFIX}"))
    }

    /// Write a record. Fails if one already exists for the same id.
    pub async fn persist(&self, record: &JobRecord) -> Result<PathBuf, StoreError> {
        let job_id = record.job_id();
        let path = self.record_path(&job_id);
        let body = serde_json::to_vec_pretty(record)?;

        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StoreError::AlreadyExists(job_id));
            }
            Err(source) => return Err(StoreError::Write { path, source }),
        };

        let write = async {
            file.write_all(&body).await?;
            file.sync_all().await
        };
        if let Err(source) = write.await {
            // Don't leave a truncated record behind.
            let _ = tokio::fs::remove_file(&path).await;
            return Err(StoreError::Write { path, source });
        }

        debug!(job_id = %job_id, "Job record persisted");
        Ok(path)
    }

    /// Load the record for `job_id`.
    pub async fn load(&self, job_id: &JobId) -> Result<JobRecord, StoreError> {
        let path = self.record_path(job_id);
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(*job_id));
            }
            Err(source) => return Err(StoreError::Read { path, source }),
        };

        let record: JobRecord = serde_json::from_slice(&body)?;
        if record.schema_version > SCHEMA_VERSION {
            return Err(StoreError::UnsupportedSchema {
                found: record.schema_version,
                supported: SCHEMA_VERSION,
            });
        }
        Ok(record)
    }
}
