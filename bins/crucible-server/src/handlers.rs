// HTTP route handlers for the Crucible API

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use crucible_common::store::StoreError;
use crucible_common::types::{InputFile, Job, JobSeed, JobStatus, JobSummary};
use crucible_engine::archive;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::auth::Tenant;
use crate::AppState;

/// Submissions larger than this are rejected before any parsing.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound,
    Storage(StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "job not found".to_string()),
            ApiError::Storage(err) => {
                error!(error = %err, "store failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => ApiError::NotFound,
            other => ApiError::Storage(other),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub source: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub input_files: Vec<InputFile>,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: String,
    pub status: JobStatus,
}

/// POST /api/submit - Accept a job and spawn its supervisor
pub async fn submit_job(
    State(state): State<Arc<AppState>>,
    Tenant(owner): Tenant,
    Json(payload): Json<SubmitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if payload.source.trim().is_empty() {
        return Err(ApiError::BadRequest("source is required".to_string()));
    }
    for file in &payload.input_files {
        archive::validate_file_name(&file.name).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    }

    let seed = JobSeed {
        owner,
        source: payload.source,
        args: payload.args,
        input_files: payload.input_files,
    };
    let job = state.store.create(&seed).await?;
    info!(job_id = %job.id, "job submitted");

    // A submitted job always runs to completion; dropping the HTTP request
    // must not cancel the supervisor.
    let supervisor = state.supervisor.clone();
    let job_id = job.id;
    tokio::spawn(async move { supervisor.run_job(job_id).await });

    Ok((
        StatusCode::OK,
        Json(SubmitResponse {
            job_id: job.id.to_string(),
            status: JobStatus::NotStarted,
        }),
    ))
}

#[derive(Debug, Serialize)]
pub struct JobView {
    pub job_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultView>,
}

#[derive(Debug, Serialize)]
pub struct ResultView {
    pub stdout: String,
    pub stderr: String,
    pub crashed: bool,
    pub timed_out: bool,
    pub peak_memory_mb: f64,
    pub peak_cpu_pct: f64,
    pub execution_ms: u64,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        let result = (job.status == JobStatus::Done).then(|| ResultView {
            stdout: String::from_utf8_lossy(&job.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&job.stderr).into_owned(),
            crashed: job.crashed,
            timed_out: job.timed_out,
            peak_memory_mb: job.peak_memory_mb,
            peak_cpu_pct: job.peak_cpu_pct,
            execution_ms: job.execution_ms,
        });
        Self {
            job_id: job.id.to_string(),
            status: job.status,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            result,
        }
    }
}

/// GET /api/job/{id} - Fetch one job, scoped to the caller
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Tenant(owner): Tenant,
    Path(id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    // A malformed id is indistinguishable from an unknown one.
    let id = Uuid::parse_str(&id).map_err(|_| ApiError::NotFound)?;
    let job = state.store.get(id, Some(&owner)).await?;
    Ok(Json(JobView::from(job)))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    20
}

#[derive(Debug, Serialize)]
pub struct JobsResponse {
    pub jobs: Vec<JobSummary>,
}

/// GET /api/jobs - List the caller's jobs, newest first
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Tenant(owner): Tenant,
    Query(params): Query<ListParams>,
) -> Result<Json<JobsResponse>, ApiError> {
    let limit = params.limit.min(100);
    let jobs = state.store.list(&owner, limit, params.offset).await?;
    Ok(Json(JobsResponse { jobs }))
}

/// GET /health - Liveness check, no auth
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": state.project_label,
    }))
}
