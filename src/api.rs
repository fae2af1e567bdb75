//! HTTP surface: multipart upload, job lookup and artifact retrieval.
//!
//! Handlers only translate between HTTP and the pipeline. Every retrieval
//! failure answers the same 404 body.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, State, multipart::MultipartError},
    http::{Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::artifact::ArtifactReader;
use crate::error::PipelineError;
use crate::estimate::{Estimate, format_price};
use crate::job::{ExitInfo, JobEstimate, JobId, JobRecord, JobStatus, RequestMeta};
use crate::pipeline::SlicePipeline;
use crate::toolpath::ToolpathSummary;
use crate::validator::Rejection;

/// Multipart field carrying the model file.
pub const UPLOAD_FIELD: &str = "file";

/// Slack on top of the upload limit for multipart framing.
const MULTIPART_OVERHEAD: u64 = 1024 * 1024;

/// Content type of served toolpaths.
const GCODE_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SlicePipeline>,
    pub reader: Arc<ArtifactReader>,
    /// Currency code used for `formattedPrice`.
    pub currency: String,
}

/// Build the router with every route and middleware layer.
pub fn routes(state: AppState) -> Router {
    let body_limit = state
        .pipeline
        .validator()
        .max_bytes()
        .saturating_add(MULTIPART_OVERHEAD);
    let body_limit = usize::try_from(body_limit).unwrap_or(usize::MAX);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/slice", post(submit))
        .route("/api/jobs/{id}", get(job_view))
        .route("/api/jobs/{id}/gcode", get(job_gcode))
        .route("/api/artifacts/{*path}", get(artifact))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

// ── Errors ──────────────────────────────────────────────────────────────

/// JSON error response `{ error, message, diagnostic? }`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    diagnostic: Option<String>,
}

impl ApiError {
    fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: "Not found".to_string(),
            diagnostic: None,
        }
    }

    fn from_multipart(err: MultipartError) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            return Self {
                status: StatusCode::PAYLOAD_TOO_LARGE,
                code: "payload_too_large",
                message: "Upload exceeds the size limit".to_string(),
                diagnostic: None,
            };
        }
        debug!(error = %err.body_text(), "Malformed multipart upload");
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "malformed_upload",
            message: err.body_text(),
            diagnostic: None,
        }
    }
}

/// HTTP status for a pipeline failure.
pub fn status_for(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::Rejected(Rejection::TooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
        PipelineError::Rejected(_) => StatusCode::BAD_REQUEST,
        PipelineError::EngineFailed { .. } => StatusCode::BAD_GATEWAY,
        PipelineError::EngineTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        PipelineError::InputWrite { .. }
        | PipelineError::EngineUnavailable { .. }
        | PipelineError::Persistence { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let status = status_for(&err);
        let message = if err.is_client_error() {
            err.to_string()
        } else {
            // Internal details (paths, io errors) stay in the logs.
            error!(error = %err, code = err.code(), "Slice request failed");
            match err {
                PipelineError::EngineFailed { .. } => "Slicing engine failed".to_string(),
                PipelineError::EngineTimeout { .. } => "Slicing engine timed out".to_string(),
                _ => "Internal server error".to_string(),
            }
        };
        Self {
            status,
            code: err.code(),
            message,
            diagnostic: err.diagnostic().map(str::to_string),
        }
    }
}

impl From<Rejection> for ApiError {
    fn from(rejection: Rejection) -> Self {
        PipelineError::from(rejection).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({
            "error": self.code,
            "message": self.message,
        });
        if let Some(diagnostic) = self.diagnostic {
            body["diagnostic"] = serde_json::Value::String(diagnostic);
        }
        (self.status, Json(body)).into_response()
    }
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "slicegate",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Submission ──────────────────────────────────────────────────────────

/// Successful submission body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub job_id: String,
    pub download_url: String,
    #[serde(flatten)]
    pub estimate: Estimate,
    pub formatted_price: String,
    pub quick_analysis: String,
    pub summary: Option<ToolpathSummary>,
}

impl SubmitResponse {
    fn new(record: &JobRecord, currency: &str) -> Self {
        let (estimate, quick_analysis, summary) = match &record.estimate {
            Some(e) => (e.estimate, e.quick_analysis.clone(), e.summary.clone()),
            None => (Estimate::ZERO, String::new(), None),
        };
        Self {
            job_id: record.job_id().to_string(),
            download_url: download_url(&record.job_id()),
            formatted_price: format_price(estimate.price, currency),
            estimate,
            quick_analysis,
            summary,
        }
    }
}

fn download_url(job_id: &JobId) -> String {
    format!("/api/jobs/{job_id}/gcode")
}

async fn submit(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<SubmitResponse>, ApiError> {
    let validator = state.pipeline.validator();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(ApiError::from_multipart)?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        // Refuse unsupported types before reading the body.
        validator.check_name(&filename)?;

        let max = validator.max_bytes();
        let mut payload = Vec::new();
        while let Some(chunk) = field.chunk().await.map_err(ApiError::from_multipart)? {
            let size = (payload.len() + chunk.len()) as u64;
            if size > max {
                return Err(Rejection::TooLarge { size, max }.into());
            }
            payload.extend_from_slice(&chunk);
        }

        let record = state.pipeline.submit(&filename, &payload).await?;
        return Ok(Json(SubmitResponse::new(&record, &state.currency)));
    }

    Err(Rejection::MissingPayload.into())
}

// ── Lookup ──────────────────────────────────────────────────────────────

/// Client view of a persisted job. Never exposes scratch paths.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub job_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub request_meta: RequestMeta,
    pub exit_info: ExitInfo,
    pub estimate: Option<JobEstimate>,
    pub download_url: Option<String>,
}

impl From<JobRecord> for JobView {
    fn from(record: JobRecord) -> Self {
        let job_id = record.job_id();
        Self {
            job_id: job_id.to_string(),
            download_url: record.is_sliced().then(|| download_url(&job_id)),
            status: record.status,
            created_at: record.created_at,
            request_meta: record.request_meta,
            exit_info: record.engine_result.exit_info,
            estimate: record.estimate,
        }
    }
}

async fn load_record(state: &AppState, id: &str) -> Result<JobRecord, ApiError> {
    let job_id = JobId::parse(id).ok_or_else(ApiError::not_found)?;
    state.pipeline.load(&job_id).await.map_err(|e| {
        debug!(job_id = %job_id, error = %e, "Job lookup failed");
        ApiError::not_found()
    })
}

async fn job_view(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    let record = load_record(&state, &id).await?;
    Ok(Json(record.into()))
}

// ── Retrieval ───────────────────────────────────────────────────────────

fn gcode_response(bytes: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, GCODE_CONTENT_TYPE)], Body::from(bytes)).into_response()
}

async fn job_gcode(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let record = load_record(&state, &id).await?;
    if !record.is_sliced() {
        return Err(ApiError::not_found());
    }
    let bytes = state
        .reader
        .read(&record.output_path)
        .await
        .map_err(|_| ApiError::not_found())?;
    Ok(gcode_response(bytes))
}

async fn artifact(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Response, ApiError> {
    let bytes = state
        .reader
        .read(&path)
        .await
        .map_err(|_| ApiError::not_found())?;
    Ok(gcode_response(bytes))
}
