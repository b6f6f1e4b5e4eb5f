// Job polling HTTP routes

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use procmine_core::error::EngineError;
use procmine_worker::{JobRegistry, JobStatus};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::common::{ApiError, ApiResult, ListResponse};

/// App state
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<JobRegistry>,
}

#[derive(Debug, Deserialize)]
pub struct ListJobsParams {
    pub limit: Option<usize>,
}

/// Create job routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/jobs", get(list_jobs))
        .route("/jobs/:job_id", get(get_job))
        .route("/jobs/:job_id/cancel", axum::routing::post(cancel_job))
        .with_state(state)
}

/// GET /jobs - recent jobs, newest first
#[utoipa::path(
    get,
    path = "/api/0/jobs",
    params(("limit" = Option<usize>, Query, description = "Maximum rows, default 50")),
    responses(
        (status = 200, description = "Recent jobs")
    ),
    tag = "jobs"
)]
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<ListJobsParams>,
) -> ApiResult<Json<ListResponse<JobStatus>>> {
    Ok(Json(state.jobs.list(params.limit.unwrap_or(50).clamp(1, 500)).into()))
}

/// GET /jobs/:job_id
#[utoipa::path(
    get,
    path = "/api/0/jobs/{job_id}",
    params(("job_id" = Uuid, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Job state and progress"),
        (status = 404, description = "Job not found")
    ),
    tag = "jobs"
)]
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<JobStatus>> {
    state
        .jobs
        .get(job_id)
        .map(Json)
        .ok_or_else(|| ApiError(EngineError::not_found("job", job_id)))
}

/// POST /jobs/:job_id/cancel
///
/// The job aborts cleanly between stages; already-committed stages stay.
#[utoipa::path(
    post,
    path = "/api/0/jobs/{job_id}/cancel",
    params(("job_id" = Uuid, Path, description = "Job ID")),
    responses(
        (status = 202, description = "Cancellation requested"),
        (status = 404, description = "Job not found")
    ),
    tag = "jobs"
)]
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<axum::http::StatusCode> {
    if state.jobs.cancel(job_id) {
        Ok(axum::http::StatusCode::ACCEPTED)
    } else {
        Err(ApiError(EngineError::not_found("job", job_id)))
    }
}
