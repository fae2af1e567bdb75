//! Job data model: identifiers, lifecycle states and the persisted record.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use uuid::Uuid;

use crate::estimate::Estimate;
use crate::toolpath::ToolpathSummary;

/// Current version of the on-disk [`JobRecord`] layout.
pub const SCHEMA_VERSION: u32 = 1;

/// Externally visible job handle.
///
/// Backed by a random v4 UUID so ids cannot be enumerated.
/// Serialized in the same 32-hex-digit form as its `Display`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a client-supplied id. Anything that isn't a UUID yields `None`.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::try_parse(s).ok().map(Self)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl Serialize for JobId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).ok_or_else(|| de::Error::custom(format!("invalid job id '{s}'")))
    }
}

/// Pipeline state of a job.
///
/// `Allocated → Sliced | SliceFailed → Estimated (only from Sliced) → Persisted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Allocated,
    Sliced,
    SliceFailed,
    Estimated,
    Persisted,
}

impl JobState {
    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (Self::Allocated, Self::Sliced)
                | (Self::Allocated, Self::SliceFailed)
                | (Self::Sliced, Self::Estimated)
                | (Self::Estimated, Self::Persisted)
                | (Self::SliceFailed, Self::Persisted)
        )
    }
}

/// Terminal outcome stored in a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Engine succeeded; the record carries an estimate (possibly zero).
    Sliced,
    /// Engine exited unsuccessfully.
    SliceFailed,
    /// Engine was killed after exceeding its wall-clock budget.
    TimedOut,
}

/// Request descriptor as submitted by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMeta {
    /// Original filename, as declared by the client.
    pub name: String,
    /// Normalized extension, with leading dot.
    pub extension: String,
    /// Payload size in bytes.
    pub size: u64,
    pub job_id: JobId,
}

/// How the engine process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitInfo {
    /// Process exited on its own.
    Exited { code: i32 },
    /// Process was terminated by a signal (no exit code).
    Signaled,
    /// Process was killed after the configured timeout.
    TimedOut { after_ms: u64 },
}

impl ExitInfo {
    pub fn from_code(code: Option<i32>) -> Self {
        match code {
            Some(code) => Self::Exited { code },
            None => Self::Signaled,
        }
    }
}

/// Captured result of one engine invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineResult {
    pub exit_info: ExitInfo,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

/// Derived metrics attached to a successfully sliced job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEstimate {
    /// `None` when the toolpath could not be analyzed.
    pub summary: Option<ToolpathSummary>,
    #[serde(flatten)]
    pub estimate: Estimate,
    #[serde(default)]
    pub quick_analysis: String,
}

/// Persisted side-car record, one per job, written once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub schema_version: u32,
    pub request_meta: RequestMeta,
    pub created_at: DateTime<Utc>,
    pub status: JobStatus,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub engine_result: EngineResult,
    /// Present only when `status == Sliced`.
    #[serde(default)]
    pub estimate: Option<JobEstimate>,
}

impl JobRecord {
    pub fn job_id(&self) -> JobId {
        self.request_meta.job_id
    }

    pub fn is_sliced(&self) -> bool {
        self.status == JobStatus::Sliced
    }
}
