//! Scratch-directory workspace allocation.
//!
//! Every job gets its own pair of files under a single scratch root. Names
//! combine a readable prefix, a millisecond timestamp, the random job id and
//! a short random suffix, so concurrent allocations never collide and no lock
//! is needed.

use std::path::{Path, PathBuf};

use chrono::Utc;
use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::info;

use crate::error::WorkspaceError;
use crate::job::JobId;

/// File name prefix for every per-job file.
const FILE_PREFIX: &str = "job";

/// Extension of the produced toolpath.
pub const OUTPUT_EXTENSION: &str = ".gcode";

/// Length of the random suffix appended to each file stem.
const SUFFIX_LEN: usize = 8;

/// Paths owned by a single job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobWorkspace {
    pub job_id: JobId,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
}

/// Hands out per-job paths inside the scratch root.
#[derive(Debug, Clone)]
pub struct WorkspaceAllocator {
    root: PathBuf,
}

impl WorkspaceAllocator {
    /// Create the scratch root (idempotently) and confirm it is writable.
    ///
    /// Called once at startup; a failure here is fatal.
    pub async fn init(root: impl Into<PathBuf>) -> Result<Self, WorkspaceError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|source| WorkspaceError::CreateRoot {
                path: root.clone(),
                source,
            })?;

        let root = tokio::fs::canonicalize(&root)
            .await
            .map_err(|source| WorkspaceError::Canonicalize {
                path: root.clone(),
                source,
            })?;

        check_writable(&root).await?;
        info!(root = %root.display(), "Scratch directory ready");
        Ok(Self { root })
    }

    /// The canonical scratch root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Allocate a fresh id and path pair. `extension` includes its leading dot.
    pub fn allocate(&self, extension: &str) -> JobWorkspace {
        let job_id = JobId::generate();
        let stem = file_stem(&job_id);
        JobWorkspace {
            job_id,
            input_path: self.root.join(format!("{stem}.input{extension}")),
            output_path: self.root.join(format!("{stem}{OUTPUT_EXTENSION}")),
        }
    }
}

fn file_stem(job_id: &JobId) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!(
        "{FILE_PREFIX}-{}-{job_id}-{suffix}",
        Utc::now().format("%Y%m%dT%H%M%S%3f")
    )
}

async fn check_writable(root: &Path) -> Result<(), WorkspaceError> {
    let marker = root.join(format!(".write-check-{}", JobId::generate()));
    let not_writable = |source| WorkspaceError::NotWritable {
        path: root.to_path_buf(),
        source,
    };
    tokio::fs::write(&marker, b"").await.map_err(not_writable)?;
    tokio::fs::remove_file(&marker).await.map_err(not_writable)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_init_creates_nested_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("a/b/scratch");
        let allocator = WorkspaceAllocator::init(&root).await.unwrap();
        assert!(allocator.root().is_dir());
        assert!(allocator.root().is_absolute());

        // Idempotent.
        WorkspaceAllocator::init(&root).await.unwrap();
    }

    #[tokio::test]
    async fn test_init_fails_when_root_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("occupied");
        tokio::fs::write(&file, b"x").await.unwrap();

        let result = WorkspaceAllocator::init(&file).await;
        assert!(matches!(result, Err(WorkspaceError::CreateRoot { .. })));
    }

    #[tokio::test]
    async fn test_allocated_paths_live_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = WorkspaceAllocator::init(dir.path()).await.unwrap();
        let ws = allocator.allocate(".stl");

        assert_eq!(ws.input_path.parent(), Some(allocator.root()));
        assert_eq!(ws.output_path.parent(), Some(allocator.root()));
        assert!(ws.input_path.to_string_lossy().ends_with(".input.stl"));
        assert!(ws.output_path.to_string_lossy().ends_with(".gcode"));

        let name = ws.output_path.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("job-"));
        assert!(name.contains(&ws.job_id.to_string()));
    }

    #[tokio::test]
    async fn test_concurrent_allocations_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = Arc::new(WorkspaceAllocator::init(dir.path()).await.unwrap());

        let mut handles = Vec::new();
        for _ in 0..100 {
            let allocator = Arc::clone(&allocator);
            handles.push(tokio::spawn(async move {
                (0..100).map(|_| allocator.allocate(".stl")).collect::<Vec<_>>()
            }));
        }

        let mut ids = HashSet::new();
        let mut paths = HashSet::new();
        for handle in handles {
            for ws in handle.await.unwrap() {
                assert!(ids.insert(ws.job_id));
                assert!(paths.insert(ws.input_path));
                assert!(paths.insert(ws.output_path));
            }
        }
        assert_eq!(ids.len(), 10_000);
        assert_eq!(paths.len(), 20_000);
    }
}
