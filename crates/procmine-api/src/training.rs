// Training queue HTTP routes
//
// Low-confidence enrichment candidates wait here for a human verdict.
// Confirm materialises the object and link; correct materialises a fixed
// version and feeds the ontology learner; reject just closes the task.

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use procmine_core::error::EngineError;
use procmine_core::event::EventRef;
use procmine_core::objects::LinkProvenance;
use procmine_storage::{Database, ReviewTaskRow};
use procmine_worker::ontology::Correction;
use procmine_worker::OntologyService;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::common::{ApiError, ApiResult, ListResponse};

/// App state
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub ontology: Arc<OntologyService>,
}

/// A pending review task as served to clients
#[derive(Debug, Serialize, ToSchema)]
pub struct ReviewTask {
    pub id: Uuid,
    pub bucket_id: String,
    pub event_id: i64,
    pub object_type: String,
    pub identifier: String,
    pub identifier_key: Option<String>,
    pub confidence: f64,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl From<ReviewTaskRow> for ReviewTask {
    fn from(row: ReviewTaskRow) -> Self {
        Self {
            id: row.task_uuid(),
            bucket_id: row.bucket_id,
            event_id: row.event_id,
            object_type: row.object_type,
            identifier: row.identifier,
            identifier_key: row.identifier_key,
            confidence: row.confidence,
            status: row.status,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PendingParams {
    pub limit: Option<i64>,
}

/// Body of POST /training/:task_id/reject
#[derive(Debug, Deserialize, ToSchema)]
pub struct RejectRequest {
    pub reason: Option<String>,
}

/// Body of POST /training/:task_id/correct
#[derive(Debug, Deserialize, ToSchema)]
pub struct CorrectRequest {
    pub object_type: Option<String>,
    pub name: Option<String>,
    pub identifier_key: Option<String>,
}

/// Create training queue routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/training/pending", get(list_pending))
        .route("/training/:task_id/confirm", post(confirm_task))
        .route("/training/:task_id/reject", post(reject_task))
        .route("/training/:task_id/correct", post(correct_task))
        .with_state(state)
}

/// GET /training/pending
#[utoipa::path(
    get,
    path = "/api/0/training/pending",
    params(("limit" = Option<i64>, Query, description = "Maximum tasks, default 50")),
    responses(
        (status = 200, description = "Pending review tasks, oldest first", body = ListResponse<ReviewTask>)
    ),
    tag = "training"
)]
pub async fn list_pending(
    State(state): State<AppState>,
    Query(params): Query<PendingParams>,
) -> ApiResult<Json<ListResponse<ReviewTask>>> {
    let rows = state
        .db
        .list_pending_review_tasks(params.limit.unwrap_or(50).clamp(1, 500))
        .await?;
    Ok(Json(rows.into_iter().map(Into::into).collect::<Vec<ReviewTask>>().into()))
}

/// POST /training/:task_id/confirm - accept the candidate as-is
#[utoipa::path(
    post,
    path = "/api/0/training/{task_id}/confirm",
    params(("task_id" = Uuid, Path, description = "Review task ID")),
    responses(
        (status = 200, description = "Candidate confirmed and linked", body = ReviewTask),
        (status = 404, description = "No such pending task")
    ),
    tag = "training"
)]
pub async fn confirm_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> ApiResult<Json<ReviewTask>> {
    let task = pending_task(&state.db, task_id).await?;

    let data = match &task.identifier_key {
        Some(key) => {
            let mut map = serde_json::Map::new();
            map.insert(key.clone(), serde_json::Value::String(task.identifier.clone()));
            serde_json::Value::Object(map)
        }
        None => serde_json::json!({}),
    };
    let (object, _) = state
        .db
        .upsert_object(&task.object_type, &task.identifier, data, false)
        .await?;
    let object_id = Uuid::parse_str(&object.id).unwrap_or(Uuid::nil());
    let event = EventRef {
        bucket_id: task.bucket_id.clone(),
        event_id: task.event_id,
    };
    state
        .db
        .link_event_to_object(&event, object_id, &LinkProvenance::Manual, 1.0)
        .await?;
    // Reward the rule if one had already linked this event to the object
    state.ontology.confirm(&event, object_id).await?;

    let resolved = state
        .db
        .resolve_review_task(&task.id, "confirmed")
        .await?
        .ok_or_else(|| ApiError(EngineError::not_found("review_task", task_id)))?;
    Ok(Json(resolved.into()))
}

/// POST /training/:task_id/reject
#[utoipa::path(
    post,
    path = "/api/0/training/{task_id}/reject",
    params(("task_id" = Uuid, Path, description = "Review task ID")),
    request_body = RejectRequest,
    responses(
        (status = 200, description = "Candidate rejected", body = ReviewTask),
        (status = 404, description = "No such pending task")
    ),
    tag = "training"
)]
pub async fn reject_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Json(req): Json<RejectRequest>,
) -> ApiResult<Json<ReviewTask>> {
    let task = pending_task(&state.db, task_id).await?;
    if let Some(reason) = &req.reason {
        state
            .db
            .record_audit(
                "candidate_rejected",
                Some(&task.id),
                serde_json::json!({"reason": reason, "identifier": task.identifier}),
            )
            .await?;
    }
    let resolved = state
        .db
        .resolve_review_task(&task.id, "rejected")
        .await?
        .ok_or_else(|| ApiError(EngineError::not_found("review_task", task_id)))?;
    Ok(Json(resolved.into()))
}

/// POST /training/:task_id/correct - accept with changes
#[utoipa::path(
    post,
    path = "/api/0/training/{task_id}/correct",
    params(("task_id" = Uuid, Path, description = "Review task ID")),
    request_body = CorrectRequest,
    responses(
        (status = 200, description = "Corrected object created and linked", body = ReviewTask),
        (status = 404, description = "No such pending task")
    ),
    tag = "training"
)]
pub async fn correct_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Json(req): Json<CorrectRequest>,
) -> ApiResult<Json<ReviewTask>> {
    let task = pending_task(&state.db, task_id).await?;

    let corrected_type = req.object_type.clone().unwrap_or_else(|| task.object_type.clone());
    let corrected_name = req.name.clone().unwrap_or_else(|| task.identifier.clone());
    let key = req.identifier_key.clone().or_else(|| task.identifier_key.clone());
    let data = match &key {
        Some(key) => {
            let mut map = serde_json::Map::new();
            map.insert(key.clone(), serde_json::Value::String(corrected_name.clone()));
            serde_json::Value::Object(map)
        }
        None => serde_json::json!({}),
    };
    let (object, _) = state
        .db
        .upsert_object(&corrected_type, &corrected_name, data, false)
        .await?;
    let object_id = Uuid::parse_str(&object.id).unwrap_or(Uuid::nil());
    let event = EventRef {
        bucket_id: task.bucket_id.clone(),
        event_id: task.event_id,
    };

    // Route through the ontology so repeated corrections can learn a rule
    if let Some(original) = state
        .db
        .objects_for_event(&event)
        .await?
        .into_iter()
        .find(|o| o.object_type == task.object_type && o.name == task.identifier)
    {
        let original_id = Uuid::parse_str(&original.id).unwrap_or(Uuid::nil());
        state
            .ontology
            .correct(
                &event,
                original_id,
                Correction {
                    object_type: req.object_type,
                    name: req.name,
                    identifier_key: req.identifier_key,
                },
            )
            .await?;
    } else {
        state
            .db
            .link_event_to_object(&event, object_id, &LinkProvenance::Manual, 1.0)
            .await?;
    }

    let resolved = state
        .db
        .resolve_review_task(&task.id, "corrected")
        .await?
        .ok_or_else(|| ApiError(EngineError::not_found("review_task", task_id)))?;
    Ok(Json(resolved.into()))
}

async fn pending_task(db: &Database, task_id: Uuid) -> ApiResult<ReviewTaskRow> {
    let task = db
        .get_review_task(&task_id.to_string())
        .await?
        .ok_or_else(|| ApiError(EngineError::not_found("review_task", task_id)))?;
    if task.status != "pending" {
        return Err(ApiError(EngineError::precondition(format!(
            "review task already {}",
            task.status
        ))));
    }
    Ok(task)
}
