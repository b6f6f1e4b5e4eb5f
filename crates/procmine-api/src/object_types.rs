// Object type CRUD HTTP routes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use procmine_core::error::EngineError;
use procmine_core::objects::ObjectType;
use procmine_storage::{CreateObjectType, Database, UpdateObjectType};
use serde::Deserialize;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::common::{ApiError, ApiResult, ListResponse};

/// App state
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
}

/// Request to create an object type
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateObjectTypeRequest {
    pub name: String,
    pub display_name: String,
    pub schema: Option<serde_json::Value>,
    pub icon: Option<String>,
    pub color: Option<String>,
}

/// Request to update an object type
#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateObjectTypeRequest {
    pub display_name: Option<String>,
    pub schema: Option<serde_json::Value>,
    pub icon: Option<String>,
    pub color: Option<String>,
}

/// Create object type routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/object-types", get(list_object_types).post(create_object_type))
        .route(
            "/object-types/:type_id",
            get(get_object_type).put(update_object_type).delete(delete_object_type),
        )
        .with_state(state)
}

/// GET /object-types
#[utoipa::path(
    get,
    path = "/api/0/object-types",
    responses(
        (status = 200, description = "List of object types", body = ListResponse<ObjectType>)
    ),
    tag = "object-types"
)]
pub async fn list_object_types(State(state): State<AppState>) -> ApiResult<Json<ListResponse<ObjectType>>> {
    let rows = state.db.list_object_types().await?;
    Ok(Json(rows.into_iter().map(Into::into).collect::<Vec<ObjectType>>().into()))
}

/// POST /object-types
#[utoipa::path(
    post,
    path = "/api/0/object-types",
    request_body = CreateObjectTypeRequest,
    responses(
        (status = 201, description = "Object type created", body = ObjectType),
        (status = 409, description = "Name already taken")
    ),
    tag = "object-types"
)]
pub async fn create_object_type(
    State(state): State<AppState>,
    Json(req): Json<CreateObjectTypeRequest>,
) -> ApiResult<(StatusCode, Json<ObjectType>)> {
    if req.name.trim().is_empty() {
        return Err(ApiError(EngineError::invalid("object type name must not be empty")));
    }
    let row = state
        .db
        .create_object_type(CreateObjectType {
            name: req.name,
            display_name: req.display_name,
            schema: req.schema,
            icon: req.icon,
            color: req.color,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(row.into())))
}

/// GET /object-types/:type_id
#[utoipa::path(
    get,
    path = "/api/0/object-types/{type_id}",
    params(("type_id" = String, Path, description = "Object type ID")),
    responses(
        (status = 200, description = "Object type found", body = ObjectType),
        (status = 404, description = "Object type not found")
    ),
    tag = "object-types"
)]
pub async fn get_object_type(
    State(state): State<AppState>,
    Path(type_id): Path<String>,
) -> ApiResult<Json<ObjectType>> {
    let row = state
        .db
        .get_object_type(&type_id)
        .await?
        .ok_or_else(|| ApiError(EngineError::not_found("object_type", &type_id)))?;
    Ok(Json(row.into()))
}

/// PUT /object-types/:type_id
#[utoipa::path(
    put,
    path = "/api/0/object-types/{type_id}",
    params(("type_id" = String, Path, description = "Object type ID")),
    request_body = UpdateObjectTypeRequest,
    responses(
        (status = 200, description = "Object type updated", body = ObjectType),
        (status = 404, description = "Object type not found")
    ),
    tag = "object-types"
)]
pub async fn update_object_type(
    State(state): State<AppState>,
    Path(type_id): Path<String>,
    Json(req): Json<UpdateObjectTypeRequest>,
) -> ApiResult<Json<ObjectType>> {
    let row = state
        .db
        .update_object_type(
            &type_id,
            UpdateObjectType {
                display_name: req.display_name,
                schema: req.schema,
                icon: req.icon,
                color: req.color,
            },
        )
        .await?
        .ok_or_else(|| ApiError(EngineError::not_found("object_type", &type_id)))?;
    Ok(Json(row.into()))
}

/// DELETE /object-types/:type_id
#[utoipa::path(
    delete,
    path = "/api/0/object-types/{type_id}",
    params(("type_id" = String, Path, description = "Object type ID")),
    responses(
        (status = 204, description = "Object type deleted"),
        (status = 404, description = "Object type not found"),
        (status = 409, description = "Type still has objects")
    ),
    tag = "object-types"
)]
pub async fn delete_object_type(
    State(state): State<AppState>,
    Path(type_id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.db.delete_object_type(&type_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError(EngineError::not_found("object_type", &type_id)))
    }
}
