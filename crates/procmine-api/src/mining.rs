// Mining HTTP routes
//
// Small windows (< 10k events) answer synchronously; larger windows start
// an orchestrator job and return its id. Responses carry the other field
// as null so clients branch on one shape.

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use chrono::{DateTime, Utc};
use procmine_core::mining::{identify_variants, MinedPattern};
use procmine_storage::Database;
use procmine_worker::orchestrator::{
    case_summaries, cases_for_window, match_workflow_against_cases, mine_window,
    sequences_for_cases, AnalysisParams,
};
use procmine_worker::AnalysisOrchestrator;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::common::{ApiError, ApiResult};

/// Windows with at least this many events run as background jobs
const SYNC_EVENT_LIMIT: i64 = 10_000;

/// App state
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub orchestrator: Arc<AnalysisOrchestrator>,
}

/// Body of POST /mining/patterns
#[derive(Debug, Deserialize, ToSchema)]
pub struct MinePatternsRequest {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub bucket: Option<String>,
    pub min_support: Option<f64>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub max_gap_seconds: Option<f64>,
    pub contiguous: Option<bool>,
    /// Event data field to group activity labels by
    pub key: Option<String>,
}

/// Body of POST /mining/group-events
#[derive(Debug, Deserialize, ToSchema)]
pub struct GroupEventsRequest {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub bucket: Option<String>,
    pub max_gap_seconds: Option<f64>,
    pub key: Option<String>,
}

/// Body of POST /mining/discover-workflows
#[derive(Debug, Deserialize, ToSchema)]
pub struct DiscoverWorkflowsRequest {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub bucket: Option<String>,
    pub min_support: Option<f64>,
    pub min_occurrences: Option<usize>,
    pub similarity_threshold: Option<f64>,
    pub max_gap_seconds: Option<f64>,
    pub key: Option<String>,
}

/// Body of POST /mining/match-workflow
#[derive(Debug, Deserialize, ToSchema)]
pub struct MatchWorkflowRequest {
    pub workflow_id: Uuid,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub bucket: Option<String>,
    pub max_gap_seconds: Option<f64>,
    pub key: Option<String>,
}

/// Either an inline result or a job reference
#[derive(Debug, Serialize, ToSchema)]
pub struct MiningResponse {
    pub job_id: Option<Uuid>,
    pub result: Option<serde_json::Value>,
}

impl MiningResponse {
    fn inline(result: serde_json::Value) -> (StatusCode, Json<Self>) {
        (
            StatusCode::OK,
            Json(Self {
                job_id: None,
                result: Some(result),
            }),
        )
    }

    fn job(job_id: Uuid) -> (StatusCode, Json<Self>) {
        (
            StatusCode::ACCEPTED,
            Json(Self {
                job_id: Some(job_id),
                result: None,
            }),
        )
    }
}

/// Create mining routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/mining/patterns", post(mine_patterns_endpoint))
        .route("/mining/group-events", post(group_events))
        .route("/mining/discover-workflows", post(discover_workflows))
        .route("/mining/match-workflow", post(match_workflow))
        .with_state(state)
}

async fn window_is_small(
    db: &Database,
    bucket: Option<&str>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> ApiResult<bool> {
    Ok(db.count_events(bucket, start, end).await? < SYNC_EVENT_LIMIT)
}

/// POST /mining/patterns
#[utoipa::path(
    post,
    path = "/api/0/mining/patterns",
    request_body = MinePatternsRequest,
    responses(
        (status = 200, description = "Patterns mined inline", body = MiningResponse),
        (status = 202, description = "Window too large, job started", body = MiningResponse),
        (status = 409, description = "Another job is running")
    ),
    tag = "mining"
)]
pub async fn mine_patterns_endpoint(
    State(state): State<AppState>,
    Json(req): Json<MinePatternsRequest>,
) -> ApiResult<(StatusCode, Json<MiningResponse>)> {
    let mut params = AnalysisParams::window(req.start, req.end);
    params.bucket = req.bucket;
    params.label_key = req.key;
    if let Some(v) = req.min_support {
        params.min_support = v;
    }
    if let Some(v) = req.min_length {
        params.min_length = v.max(2);
    }
    if let Some(v) = req.max_length {
        params.max_length = v;
    }
    if let Some(v) = req.max_gap_seconds {
        params.max_gap_seconds = v;
    }
    if let Some(v) = req.contiguous {
        params.contiguous = v;
    }

    if window_is_small(&state.db, params.bucket.as_deref(), params.start, params.end).await? {
        let patterns: Vec<MinedPattern> = mine_window(&state.db, &params).await?;
        let variants = identify_variants(&patterns, params.min_variant_cases);
        return Ok(MiningResponse::inline(json!({
            "patterns": patterns,
            "variants": variants,
        })));
    }
    let job_id = state.orchestrator.trigger_mining(params)?;
    Ok(MiningResponse::job(job_id))
}

/// POST /mining/group-events
#[utoipa::path(
    post,
    path = "/api/0/mining/group-events",
    request_body = GroupEventsRequest,
    responses(
        (status = 200, description = "Cases built inline", body = MiningResponse),
        (status = 202, description = "Window too large, job started", body = MiningResponse),
        (status = 409, description = "Another job is running")
    ),
    tag = "mining"
)]
pub async fn group_events(
    State(state): State<AppState>,
    Json(req): Json<GroupEventsRequest>,
) -> ApiResult<(StatusCode, Json<MiningResponse>)> {
    let mut params = AnalysisParams::window(req.start, req.end);
    params.bucket = req.bucket;
    params.label_key = req.key;
    if let Some(v) = req.max_gap_seconds {
        params.max_gap_seconds = v;
    }

    if window_is_small(&state.db, params.bucket.as_deref(), params.start, params.end).await? {
        let cases = cases_for_window(&state.db, &params).await?;
        return Ok(MiningResponse::inline(json!({
            "cases": case_summaries(&cases, params.label_key.as_deref()),
        })));
    }
    let job_id = state.orchestrator.trigger_group_events(params)?;
    Ok(MiningResponse::job(job_id))
}

/// POST /mining/discover-workflows
#[utoipa::path(
    post,
    path = "/api/0/mining/discover-workflows",
    request_body = DiscoverWorkflowsRequest,
    responses(
        (status = 200, description = "Workflows discovered inline", body = MiningResponse),
        (status = 202, description = "Window too large, job started", body = MiningResponse),
        (status = 409, description = "Another job is running")
    ),
    tag = "mining"
)]
pub async fn discover_workflows(
    State(state): State<AppState>,
    Json(req): Json<DiscoverWorkflowsRequest>,
) -> ApiResult<(StatusCode, Json<MiningResponse>)> {
    let mut params = AnalysisParams::window(req.start, req.end);
    params.bucket = req.bucket;
    params.label_key = req.key;
    if let Some(v) = req.min_support {
        params.min_support = v;
    }
    if let Some(v) = req.min_occurrences {
        params.min_variant_cases = v;
    }
    if let Some(v) = req.similarity_threshold {
        params.similarity_threshold = v;
    }
    if let Some(v) = req.max_gap_seconds {
        params.max_gap_seconds = v;
    }

    if window_is_small(&state.db, params.bucket.as_deref(), params.start, params.end).await? {
        let cases = cases_for_window(&state.db, &params).await?;
        let (sequences, _) = sequences_for_cases(&cases, params.label_key.as_deref());
        let patterns = procmine_core::mining::mine_patterns(
            &sequences,
            &procmine_core::mining::MiningConfig {
                min_support: params.min_support,
                min_length: params.min_length,
                max_length: params.max_length,
                contiguous: params.contiguous,
            },
        );
        let variants = identify_variants(&patterns, params.min_variant_cases);
        let saved = procmine_worker::orchestrator::discover_and_save_workflows(
            &state.db,
            &variants,
            params.similarity_threshold,
        )
        .await?;
        return Ok(MiningResponse::inline(json!({
            "variants": variants.len(),
            "workflows": saved.iter().map(|w| json!({"id": w.id, "name": w.name})).collect::<Vec<_>>(),
        })));
    }
    let job_id = state.orchestrator.trigger_discovery(params)?;
    Ok(MiningResponse::job(job_id))
}

/// POST /mining/match-workflow
#[utoipa::path(
    post,
    path = "/api/0/mining/match-workflow",
    request_body = MatchWorkflowRequest,
    responses(
        (status = 200, description = "Matching ran inline", body = MiningResponse),
        (status = 202, description = "Window too large, job started", body = MiningResponse),
        (status = 404, description = "Workflow not found"),
        (status = 409, description = "Another job is running")
    ),
    tag = "mining"
)]
pub async fn match_workflow(
    State(state): State<AppState>,
    Json(req): Json<MatchWorkflowRequest>,
) -> ApiResult<(StatusCode, Json<MiningResponse>)> {
    let workflow = state
        .db
        .get_workflow(&req.workflow_id.to_string())
        .await?
        .ok_or_else(|| {
            ApiError(procmine_core::error::EngineError::not_found(
                "workflow",
                req.workflow_id,
            ))
        })?;

    let mut params = AnalysisParams::window(req.start, req.end);
    params.bucket = req.bucket;
    params.label_key = req.key;
    if let Some(v) = req.max_gap_seconds {
        params.max_gap_seconds = v;
    }

    if window_is_small(&state.db, params.bucket.as_deref(), params.start, params.end).await? {
        let cases = cases_for_window(&state.db, &params).await?;
        let (_, cases_steps) = sequences_for_cases(&cases, params.label_key.as_deref());
        let created = match_workflow_against_cases(&state.db, &workflow, &cases_steps).await?;
        return Ok(MiningResponse::inline(json!({
            "cases": cases.len(),
            "occurrences_created": created,
        })));
    }
    let job_id = state.orchestrator.trigger_match(params, req.workflow_id)?;
    Ok(MiningResponse::job(job_id))
}
