// Business object HTTP routes

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use procmine_core::error::EngineError;
use procmine_core::event::WatchedEvent;
use procmine_core::objects::BusinessObject;
use procmine_storage::{Database, UpdateObject};
use serde::Deserialize;
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::common::{parse_time, ApiError, ApiResult, ListResponse};

const DEFAULT_LIMIT: i64 = 100;

/// App state
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
}

/// Filters for the object listing
#[derive(Debug, Deserialize)]
pub struct ListObjectsParams {
    #[serde(rename = "type")]
    pub object_type: Option<String>,
    pub q: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub limit: Option<i64>,
}

/// Request to create an object manually
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateObjectRequest {
    #[serde(rename = "type")]
    pub object_type: String,
    pub name: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Request to update an object
#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateObjectRequest {
    pub name: Option<String>,
    pub data: Option<serde_json::Value>,
}

/// Create object routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/objects", get(list_objects).post(create_object))
        .route(
            "/objects/:object_id",
            get(get_object).put(update_object).delete(delete_object),
        )
        .route("/objects/:object_id/events", get(object_events))
        .with_state(state)
}

/// GET /objects
#[utoipa::path(
    get,
    path = "/api/0/objects",
    params(
        ("type" = Option<String>, Query, description = "Filter by object type"),
        ("q" = Option<String>, Query, description = "Substring filter on name"),
        ("start" = Option<String>, Query, description = "RFC-3339 lower bound on updated time"),
        ("end" = Option<String>, Query, description = "RFC-3339 upper bound on updated time"),
        ("limit" = Option<i64>, Query, description = "Maximum rows, default 100")
    ),
    responses(
        (status = 200, description = "List of objects", body = ListResponse<BusinessObject>)
    ),
    tag = "objects"
)]
pub async fn list_objects(
    State(state): State<AppState>,
    Query(params): Query<ListObjectsParams>,
) -> ApiResult<Json<ListResponse<BusinessObject>>> {
    let start = parse_time(params.start.as_deref(), "start")?;
    let end = parse_time(params.end.as_deref(), "end")?;
    let rows = state
        .db
        .list_objects(
            params.object_type.as_deref(),
            params.q.as_deref(),
            start,
            end,
            params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, 1000),
        )
        .await?;
    Ok(Json(rows.into_iter().map(Into::into).collect::<Vec<BusinessObject>>().into()))
}

/// POST /objects
#[utoipa::path(
    post,
    path = "/api/0/objects",
    request_body = CreateObjectRequest,
    responses(
        (status = 201, description = "Object created or merged", body = BusinessObject),
        (status = 404, description = "Unknown object type")
    ),
    tag = "objects"
)]
pub async fn create_object(
    State(state): State<AppState>,
    Json(req): Json<CreateObjectRequest>,
) -> ApiResult<(StatusCode, Json<BusinessObject>)> {
    if req.name.trim().is_empty() {
        return Err(ApiError(EngineError::invalid("object name must not be empty")));
    }
    let (row, created) = state
        .db
        .upsert_object(&req.object_type, &req.name, req.data, false)
        .await?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(row.into())))
}

/// GET /objects/:object_id
#[utoipa::path(
    get,
    path = "/api/0/objects/{object_id}",
    params(("object_id" = Uuid, Path, description = "Object ID")),
    responses(
        (status = 200, description = "Object found", body = BusinessObject),
        (status = 404, description = "Object not found")
    ),
    tag = "objects"
)]
pub async fn get_object(
    State(state): State<AppState>,
    Path(object_id): Path<Uuid>,
) -> ApiResult<Json<BusinessObject>> {
    let row = state
        .db
        .get_object(&object_id.to_string())
        .await?
        .ok_or_else(|| ApiError(EngineError::not_found("object", object_id)))?;
    Ok(Json(row.into()))
}

/// PUT /objects/:object_id
#[utoipa::path(
    put,
    path = "/api/0/objects/{object_id}",
    params(("object_id" = Uuid, Path, description = "Object ID")),
    request_body = UpdateObjectRequest,
    responses(
        (status = 200, description = "Object updated", body = BusinessObject),
        (status = 404, description = "Object not found"),
        (status = 409, description = "Name collision within the type")
    ),
    tag = "objects"
)]
pub async fn update_object(
    State(state): State<AppState>,
    Path(object_id): Path<Uuid>,
    Json(req): Json<UpdateObjectRequest>,
) -> ApiResult<Json<BusinessObject>> {
    let row = state
        .db
        .update_object(
            &object_id.to_string(),
            UpdateObject {
                name: req.name,
                data: req.data,
            },
        )
        .await?
        .ok_or_else(|| ApiError(EngineError::not_found("object", object_id)))?;
    Ok(Json(row.into()))
}

/// DELETE /objects/:object_id
#[utoipa::path(
    delete,
    path = "/api/0/objects/{object_id}",
    params(("object_id" = Uuid, Path, description = "Object ID")),
    responses(
        (status = 204, description = "Object deleted, links cascade"),
        (status = 404, description = "Object not found")
    ),
    tag = "objects"
)]
pub async fn delete_object(
    State(state): State<AppState>,
    Path(object_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    if state.db.delete_object(&object_id.to_string()).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError(EngineError::not_found("object", object_id)))
    }
}

/// GET /objects/:object_id/events - events linked to an object
#[utoipa::path(
    get,
    path = "/api/0/objects/{object_id}/events",
    params(("object_id" = Uuid, Path, description = "Object ID")),
    responses(
        (status = 200, description = "Linked events, oldest first", body = ListResponse<WatchedEvent>),
        (status = 404, description = "Object not found")
    ),
    tag = "objects"
)]
pub async fn object_events(
    State(state): State<AppState>,
    Path(object_id): Path<Uuid>,
) -> ApiResult<Json<ListResponse<WatchedEvent>>> {
    if state.db.get_object(&object_id.to_string()).await?.is_none() {
        return Err(ApiError(EngineError::not_found("object", object_id)));
    }
    let rows = state.db.events_for_object(object_id, None, None).await?;
    Ok(Json(rows.into_iter().map(Into::into).collect::<Vec<WatchedEvent>>().into()))
}
