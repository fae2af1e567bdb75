//! Job pipeline: validate → allocate → slice → estimate → persist.
//!
//! Each submission runs the steps strictly in order, inside its own `job`
//! span. Jobs share nothing but the scratch root and the engine permit pool,
//! so no lock is held across any await point.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::engine::{Capture, SliceOutcome, Slicer};
use crate::error::{EngineError, PipelineError, StoreError};
use crate::estimate::{PricingModel, quick_analysis};
use crate::job::{
    EngineResult, ExitInfo, JobEstimate, JobId, JobRecord, JobState, JobStatus, RequestMeta,
    SCHEMA_VERSION,
};
use crate::store::JobStore;
use crate::toolpath::summarize_file;
use crate::validator::InputValidator;
use crate::workspace::{JobWorkspace, WorkspaceAllocator};

/// Default number of engine processes allowed to run at once.
pub const DEFAULT_MAX_CONCURRENT_SLICES: usize = 4;

/// Orchestrates one submission end to end.
pub struct SlicePipeline {
    validator: InputValidator,
    workspace: WorkspaceAllocator,
    slicer: Arc<dyn Slicer>,
    store: JobStore,
    pricing: PricingModel,
    permits: Arc<Semaphore>,
}

impl SlicePipeline {
    /// Build a pipeline whose records live next to the artifacts in the
    /// scratch root.
    pub fn new(
        validator: InputValidator,
        workspace: WorkspaceAllocator,
        slicer: Arc<dyn Slicer>,
        pricing: PricingModel,
    ) -> Self {
        let store = JobStore::new(workspace.root());
        Self {
            validator,
            workspace,
            slicer,
            store,
            pricing,
            permits: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT_SLICES)),
        }
    }

    /// Bound the number of concurrent engine invocations.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(max.max(1)));
        self
    }

    /// Use a different metadata store.
    pub fn with_store(mut self, store: JobStore) -> Self {
        self.store = store;
        self
    }

    pub fn validator(&self) -> &InputValidator {
        &self.validator
    }

    /// Run one submission. Returns the persisted record on success.
    ///
    /// Engine failures and timeouts are persisted before being returned as
    /// errors, so they stay inspectable by job id.
    pub async fn submit(&self, filename: &str, payload: &[u8]) -> Result<JobRecord, PipelineError> {
        let name = client_file_name(filename);
        let extension = self.validator.check(&name, payload.len() as u64)?;

        let workspace = self.workspace.allocate(&extension);
        let meta = RequestMeta {
            name: name.clone(),
            extension,
            size: payload.len() as u64,
            job_id: workspace.job_id,
        };

        let span = info_span!("job", job_id = %workspace.job_id, filename = %name);
        self.run(workspace, meta, payload).instrument(span).await
    }

    async fn run(
        &self,
        workspace: JobWorkspace,
        meta: RequestMeta,
        payload: &[u8],
    ) -> Result<JobRecord, PipelineError> {
        let job_id = workspace.job_id;
        let created_at = Utc::now();
        let mut state = JobState::Allocated;
        info!(size = meta.size, "Job accepted");

        write_input(&workspace.input_path, payload)
            .await
            .map_err(|source| PipelineError::InputWrite { job_id, source })?;
        debug!(input = %workspace.input_path.display(), "Input written");

        let outcome = self.slice(&workspace).await.map_err(|source| {
            error!(error = %source, "Slicing engine unavailable");
            PipelineError::EngineUnavailable { job_id, source }
        })?;

        let (status, engine_result, estimate, pending) = match outcome {
            SliceOutcome::Success { artifact_path, capture } => {
                advance(&mut state, JobState::Sliced);
                let summary = summarize_file(&artifact_path).await;
                if summary.is_none() {
                    info!("Toolpath could not be analyzed, estimate is zero");
                }
                let estimate = JobEstimate {
                    estimate: self.pricing.estimate(summary.as_ref()),
                    quick_analysis: quick_analysis(summary.as_ref()),
                    summary,
                };
                advance(&mut state, JobState::Estimated);
                (
                    JobStatus::Sliced,
                    engine_result_from(ExitInfo::Exited { code: 0 }, capture),
                    Some(estimate),
                    None,
                )
            }
            SliceOutcome::Failure { exit_code, capture } => {
                advance(&mut state, JobState::SliceFailed);
                warn!(exit_code = ?exit_code, "Slicing engine failed");
                let failure = PipelineError::EngineFailed {
                    job_id,
                    exit_code,
                    stderr: capture.stderr.clone(),
                };
                (
                    JobStatus::SliceFailed,
                    engine_result_from(ExitInfo::from_code(exit_code), capture),
                    None,
                    Some(failure),
                )
            }
            SliceOutcome::Timeout { after } => {
                advance(&mut state, JobState::SliceFailed);
                warn!(timeout = ?after, "Slicing engine timed out, job abandoned");
                (
                    JobStatus::TimedOut,
                    engine_result_from(
                        ExitInfo::TimedOut {
                            after_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
                        },
                        Capture::default(),
                    ),
                    None,
                    Some(PipelineError::EngineTimeout {
                        job_id,
                        timeout: after,
                    }),
                )
            }
        };

        let record = JobRecord {
            schema_version: SCHEMA_VERSION,
            request_meta: meta,
            created_at,
            status,
            input_path: workspace.input_path,
            output_path: workspace.output_path,
            engine_result,
            estimate,
        };

        if let Err(source) = self.store.persist(&record).await {
            error!(error = %source, "Failed to persist job record");
            // An engine failure outranks the write failure.
            return Err(pending.unwrap_or(PipelineError::Persistence { job_id, source }));
        }
        advance(&mut state, JobState::Persisted);

        match pending {
            Some(failure) => Err(failure),
            None => {
                info!(
                    price = %record.estimate.as_ref().map(|e| e.estimate.price).unwrap_or_default(),
                    "Job complete"
                );
                Ok(record)
            }
        }
    }

    /// Invoke the engine while holding a permit.
    async fn slice(&self, workspace: &JobWorkspace) -> Result<SliceOutcome, EngineError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| EngineError::LimiterClosed)?;
        self.slicer
            .slice(&workspace.input_path, &workspace.output_path)
            .await
    }

    /// Look up a persisted record.
    pub async fn load(&self, job_id: &JobId) -> Result<JobRecord, StoreError> {
        self.store.load(job_id).await
    }
}

fn engine_result_from(exit_info: ExitInfo, capture: Capture) -> EngineResult {
    EngineResult {
        exit_info,
        stdout: capture.stdout,
        stderr: capture.stderr,
    }
}

fn advance(state: &mut JobState, next: JobState) {
    debug_assert!(
        state.can_transition_to(next),
        "illegal job transition {state:?} -> {next:?}"
    );
    debug!(from = ?state, to = ?next, "Job state changed");
    *state = next;
}

/// Final path component of a client-declared filename, for both separators.
fn client_file_name(filename: &str) -> String {
    filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// Write the uploaded payload. The file must not already exist.
async fn write_input(path: &Path, payload: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(payload).await?;
    file.flush().await
}
