// Step HTTP routes

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use procmine_core::error::EngineError;
use procmine_core::event::EventRef;
use procmine_core::workflow::Step;
use procmine_storage::{CreateStep, Database, StepRow, UpdateStep};
use serde::Deserialize;
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::common::{ApiError, ApiResult, ListResponse};

/// App state
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
}

/// Request to promote a group of events into a step manually
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateStepRequest {
    pub name: String,
    pub event_refs: Vec<EventRef>,
    #[serde(default)]
    pub object_ids: Vec<Uuid>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration: f64,
    pub data: Option<serde_json::Value>,
}

/// Request to update a step
#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateStepRequest {
    pub name: Option<String>,
    pub data: Option<serde_json::Value>,
}

/// Request to attach an object
#[derive(Debug, Deserialize, ToSchema)]
pub struct AttachObjectRequest {
    pub object_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct ListStepsParams {
    pub limit: Option<i64>,
}

/// Create step routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/steps", get(list_steps).post(create_step))
        .route("/steps/:step_id", get(get_step).put(update_step).delete(delete_step))
        .route("/steps/:step_id/objects", post(attach_object))
        .route(
            "/steps/:step_id/objects/:object_id",
            axum::routing::delete(detach_object),
        )
        .with_state(state)
}

async fn assemble(db: &Database, row: StepRow) -> ApiResult<Step> {
    let event_refs = db.step_event_refs(&row.id).await?;
    let object_ids = db.step_object_ids(&row.id).await?;
    Ok(Step {
        id: row.step_uuid(),
        name: row.name.clone(),
        event_refs,
        object_ids: object_ids.into_iter().collect(),
        start: row.start_time,
        end: row.end_time,
        duration: row.duration,
        data: row.data_json(),
    })
}

/// GET /steps
#[utoipa::path(
    get,
    path = "/api/0/steps",
    params(("limit" = Option<i64>, Query, description = "Maximum rows, default 100")),
    responses(
        (status = 200, description = "Steps, newest first", body = ListResponse<Step>)
    ),
    tag = "steps"
)]
pub async fn list_steps(
    State(state): State<AppState>,
    Query(params): Query<ListStepsParams>,
) -> ApiResult<Json<ListResponse<Step>>> {
    let rows = state.db.list_steps(params.limit.unwrap_or(100).clamp(1, 1000)).await?;
    let mut steps = Vec::with_capacity(rows.len());
    for row in rows {
        steps.push(assemble(&state.db, row).await?);
    }
    Ok(Json(steps.into()))
}

/// POST /steps
#[utoipa::path(
    post,
    path = "/api/0/steps",
    request_body = CreateStepRequest,
    responses(
        (status = 201, description = "Step created", body = Step)
    ),
    tag = "steps"
)]
pub async fn create_step(
    State(state): State<AppState>,
    Json(req): Json<CreateStepRequest>,
) -> ApiResult<(StatusCode, Json<Step>)> {
    if req.name.trim().is_empty() {
        return Err(ApiError(EngineError::invalid("step name must not be empty")));
    }
    let row = state
        .db
        .create_step(CreateStep {
            name: req.name,
            event_refs: req.event_refs,
            object_ids: req.object_ids,
            start_time: req.start,
            end_time: req.end,
            duration: req.duration,
            data: req.data,
        })
        .await?;
    let step = assemble(&state.db, row).await?;
    Ok((StatusCode::CREATED, Json(step)))
}

/// GET /steps/:step_id
#[utoipa::path(
    get,
    path = "/api/0/steps/{step_id}",
    params(("step_id" = Uuid, Path, description = "Step ID")),
    responses(
        (status = 200, description = "Step found", body = Step),
        (status = 404, description = "Step not found")
    ),
    tag = "steps"
)]
pub async fn get_step(
    State(state): State<AppState>,
    Path(step_id): Path<Uuid>,
) -> ApiResult<Json<Step>> {
    let row = state
        .db
        .get_step(&step_id.to_string())
        .await?
        .ok_or_else(|| ApiError(EngineError::not_found("step", step_id)))?;
    Ok(Json(assemble(&state.db, row).await?))
}

/// PUT /steps/:step_id
#[utoipa::path(
    put,
    path = "/api/0/steps/{step_id}",
    params(("step_id" = Uuid, Path, description = "Step ID")),
    request_body = UpdateStepRequest,
    responses(
        (status = 200, description = "Step updated", body = Step),
        (status = 404, description = "Step not found")
    ),
    tag = "steps"
)]
pub async fn update_step(
    State(state): State<AppState>,
    Path(step_id): Path<Uuid>,
    Json(req): Json<UpdateStepRequest>,
) -> ApiResult<Json<Step>> {
    let row = state
        .db
        .update_step(
            &step_id.to_string(),
            UpdateStep {
                name: req.name,
                data: req.data,
            },
        )
        .await?
        .ok_or_else(|| ApiError(EngineError::not_found("step", step_id)))?;
    Ok(Json(assemble(&state.db, row).await?))
}

/// DELETE /steps/:step_id
#[utoipa::path(
    delete,
    path = "/api/0/steps/{step_id}",
    params(("step_id" = Uuid, Path, description = "Step ID")),
    responses(
        (status = 204, description = "Step deleted"),
        (status = 404, description = "Step not found")
    ),
    tag = "steps"
)]
pub async fn delete_step(
    State(state): State<AppState>,
    Path(step_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    if state.db.delete_step(&step_id.to_string()).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError(EngineError::not_found("step", step_id)))
    }
}

/// POST /steps/:step_id/objects
#[utoipa::path(
    post,
    path = "/api/0/steps/{step_id}/objects",
    params(("step_id" = Uuid, Path, description = "Step ID")),
    request_body = AttachObjectRequest,
    responses(
        (status = 204, description = "Object attached"),
        (status = 404, description = "Step or object not found")
    ),
    tag = "steps"
)]
pub async fn attach_object(
    State(state): State<AppState>,
    Path(step_id): Path<Uuid>,
    Json(req): Json<AttachObjectRequest>,
) -> ApiResult<StatusCode> {
    if state.db.get_step(&step_id.to_string()).await?.is_none() {
        return Err(ApiError(EngineError::not_found("step", step_id)));
    }
    state.db.add_step_object(&step_id.to_string(), req.object_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /steps/:step_id/objects/:object_id
#[utoipa::path(
    delete,
    path = "/api/0/steps/{step_id}/objects/{object_id}",
    params(
        ("step_id" = Uuid, Path, description = "Step ID"),
        ("object_id" = Uuid, Path, description = "Object ID")
    ),
    responses(
        (status = 204, description = "Object detached"),
        (status = 404, description = "Attachment not found")
    ),
    tag = "steps"
)]
pub async fn detach_object(
    State(state): State<AppState>,
    Path((step_id, object_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    if state.db.remove_step_object(&step_id.to_string(), object_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError(EngineError::not_found("step_object", object_id)))
    }
}
