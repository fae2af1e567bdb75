//! Error types for slicegate.

use std::path::PathBuf;
use std::time::Duration;

use crate::job::JobId;
use crate::validator::Rejection;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Scratch directory errors. All of these are startup-time failures.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("Failed to create scratch directory '{path}': {source}")]
    CreateRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Scratch directory '{path}' is not writable: {source}")]
    NotWritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to resolve scratch directory '{path}': {source}")]
    Canonicalize {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures to run the slicing engine at all.
///
/// A non-zero exit or a timeout is an outcome, not an error; see
/// [`crate::engine::SliceOutcome`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Failed to spawn slicing engine '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed waiting for slicing engine: {0}")]
    Wait(#[source] std::io::Error),

    #[error("Slicing engine concurrency limiter closed")]
    LimiterClosed,
}

/// Job metadata store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Job record {0} not found")]
    NotFound(JobId),

    #[error("Job record {0} already exists")]
    AlreadyExists(JobId),

    #[error("Failed to write job record '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read job record '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Job record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job record schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: u32, supported: u32 },
}

/// Uniform retrieval failure. Never says whether a path was missing, outside
/// the scratch root or unreadable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Artifact not found")]
pub struct ArtifactNotFound;

/// Per-job pipeline failures, one variant per failure class a client can see.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Upload rejected: {0}")]
    Rejected(#[from] Rejection),

    #[error("Failed to write input for job {job_id}: {source}")]
    InputWrite {
        job_id: JobId,
        #[source]
        source: std::io::Error,
    },

    #[error("Slicing engine unavailable for job {job_id}: {source}")]
    EngineUnavailable {
        job_id: JobId,
        #[source]
        source: EngineError,
    },

    #[error("Slicing engine failed for job {job_id} (exit code {exit_code:?})")]
    EngineFailed {
        job_id: JobId,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Slicing engine timed out for job {job_id} after {timeout:?}")]
    EngineTimeout { job_id: JobId, timeout: Duration },

    #[error("Failed to persist job {job_id}: {source}")]
    Persistence {
        job_id: JobId,
        #[source]
        source: StoreError,
    },
}

impl PipelineError {
    /// Stable machine-readable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Rejected(rejection) => rejection.code(),
            Self::InputWrite { .. } => "input_write_failed",
            Self::EngineUnavailable { .. } => "engine_unavailable",
            Self::EngineFailed { .. } => "engine_failed",
            Self::EngineTimeout { .. } => "engine_timeout",
            Self::Persistence { .. } => "persistence_failed",
        }
    }

    /// Whether the failure was caused by the client's request rather than the
    /// environment.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    /// Engine diagnostic text, when the engine produced one.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            Self::EngineFailed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_error_codes_are_distinct() {
        let job_id = JobId::generate();
        let errors = vec![
            PipelineError::Rejected(Rejection::UnsupportedExtension {
                extension: ".txt".to_string(),
            }),
            PipelineError::Rejected(Rejection::TooLarge { size: 10, max: 5 }),
            PipelineError::Rejected(Rejection::MissingPayload),
            PipelineError::InputWrite {
                job_id,
                source: std::io::Error::other("disk full"),
            },
            PipelineError::EngineUnavailable {
                job_id,
                source: EngineError::LimiterClosed,
            },
            PipelineError::EngineFailed {
                job_id,
                exit_code: Some(1),
                stderr: "boom".to_string(),
            },
            PipelineError::EngineTimeout {
                job_id,
                timeout: Duration::from_secs(1),
            },
            PipelineError::Persistence {
                job_id,
                source: StoreError::AlreadyExists(job_id),
            },
        ];

        let mut codes: Vec<&str> = errors.iter().map(|e| e.code()).collect();
        let total = codes.len();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), total);
    }

    #[test]
    fn test_only_rejections_are_client_errors() {
        let job_id = JobId::generate();
        assert!(PipelineError::Rejected(Rejection::MissingPayload).is_client_error());
        assert!(
            !PipelineError::EngineTimeout {
                job_id,
                timeout: Duration::from_secs(1)
            }
            .is_client_error()
        );
    }

    #[test]
    fn test_diagnostic_only_for_engine_failure() {
        let job_id = JobId::generate();
        let failed = PipelineError::EngineFailed {
            job_id,
            exit_code: Some(1),
            stderr: "boom".to_string(),
        };
        assert_eq!(failed.diagnostic(), Some("boom"));

        let timeout = PipelineError::EngineTimeout {
            job_id,
            timeout: Duration::from_secs(1),
        };
        assert_eq!(timeout.diagnostic(), None);
    }
}
