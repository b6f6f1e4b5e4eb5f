// Workflow and occurrence HTTP routes
//
// State changes go through the lifecycle validator: draft -> active ->
// archived, deleted terminal. Deleting a workflow removes exactly its
// occurrences and their step instances.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use procmine_core::error::EngineError;
use procmine_core::workflow::{Occurrence, OccurrenceStep, PatternDef, Workflow, WorkflowState};
use procmine_storage::{
    CreateWorkflow, Database, OccurrenceRow, UpdateWorkflow, WorkflowRow,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::common::{ApiError, ApiResult, ListResponse};

/// App state
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
}

/// Request to save a workflow
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateWorkflowRequest {
    pub name: String,
    pub description: Option<String>,
    pub pattern: PatternDef,
    #[serde(default)]
    pub step_ids: Vec<Uuid>,
    #[serde(default)]
    pub object_ids: Vec<Uuid>,
}

/// Request to update a workflow
#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateWorkflowRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub pattern: Option<PatternDef>,
    pub state: Option<WorkflowState>,
}

/// Request to attach an object
#[derive(Debug, Deserialize, ToSchema)]
pub struct AttachObjectRequest {
    pub object_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct ListWorkflowsParams {
    /// Archived workflows are excluded from default listings
    #[serde(default)]
    pub include_archived: bool,
}

/// Create workflow routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/workflows", get(list_workflows).post(create_workflow))
        .route(
            "/workflows/:workflow_id",
            get(get_workflow).put(update_workflow).delete(delete_workflow),
        )
        .route("/workflows/:workflow_id/objects", post(attach_object))
        .route(
            "/workflows/:workflow_id/objects/:object_id",
            axum::routing::delete(detach_object),
        )
        .route("/workflows/:workflow_id/occurrences", get(list_occurrences))
        .route(
            "/workflows/:workflow_id/occurrences/:occurrence_id",
            get(get_occurrence),
        )
        .with_state(state)
}

async fn assemble(db: &Database, row: WorkflowRow) -> ApiResult<Workflow> {
    let step_ids = db.workflow_step_ids(&row.id).await?;
    let object_ids = db.workflow_object_ids(&row.id).await?;
    Ok(Workflow {
        id: row.workflow_uuid(),
        name: row.name.clone(),
        description: row.description.clone(),
        pattern: row.pattern_def(),
        step_ids,
        object_ids,
        state: row.workflow_state(),
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

async fn assemble_occurrence(db: &Database, row: OccurrenceRow) -> ApiResult<Occurrence> {
    let steps = db.occurrence_steps(&row.id).await?;
    let mut object_ids: Vec<Uuid> = Vec::new();
    let mut occurrence_steps = Vec::with_capacity(steps.len());
    for step in steps {
        for object_id in db.step_object_ids(&step.step_id).await? {
            if !object_ids.contains(&object_id) {
                object_ids.push(object_id);
            }
        }
        occurrence_steps.push(OccurrenceStep {
            step_id: Uuid::parse_str(&step.step_id).unwrap_or(Uuid::nil()),
            position: step.position as i32,
        });
    }
    Ok(Occurrence {
        id: row.occurrence_uuid(),
        workflow_id: Uuid::parse_str(&row.workflow_id).unwrap_or(Uuid::nil()),
        steps: occurrence_steps,
        start: row.start_time,
        end: row.end_time,
        duration: row.duration,
        object_ids,
    })
}

/// GET /workflows
#[utoipa::path(
    get,
    path = "/api/0/workflows",
    params(("include_archived" = Option<bool>, Query, description = "Include archived workflows")),
    responses(
        (status = 200, description = "Saved workflows", body = ListResponse<Workflow>)
    ),
    tag = "workflows"
)]
pub async fn list_workflows(
    State(state): State<AppState>,
    Query(params): Query<ListWorkflowsParams>,
) -> ApiResult<Json<ListResponse<Workflow>>> {
    let rows = state.db.list_workflows(params.include_archived).await?;
    let mut workflows = Vec::with_capacity(rows.len());
    for row in rows {
        workflows.push(assemble(&state.db, row).await?);
    }
    Ok(Json(workflows.into()))
}

/// POST /workflows - save a workflow without mined data
#[utoipa::path(
    post,
    path = "/api/0/workflows",
    request_body = CreateWorkflowRequest,
    responses(
        (status = 201, description = "Workflow saved as draft", body = Workflow),
        (status = 400, description = "Pattern shorter than two steps")
    ),
    tag = "workflows"
)]
pub async fn create_workflow(
    State(state): State<AppState>,
    Json(req): Json<CreateWorkflowRequest>,
) -> ApiResult<(StatusCode, Json<Workflow>)> {
    req.pattern.validate()?;
    let row = state
        .db
        .create_workflow(CreateWorkflow {
            name: req.name,
            description: req.description,
            pattern: req.pattern,
            step_ids: req.step_ids,
            object_ids: req.object_ids,
            state: WorkflowState::Draft,
        })
        .await?;
    let workflow = assemble(&state.db, row).await?;
    Ok((StatusCode::CREATED, Json(workflow)))
}

/// GET /workflows/:workflow_id
#[utoipa::path(
    get,
    path = "/api/0/workflows/{workflow_id}",
    params(("workflow_id" = Uuid, Path, description = "Workflow ID")),
    responses(
        (status = 200, description = "Workflow found", body = Workflow),
        (status = 404, description = "Workflow not found")
    ),
    tag = "workflows"
)]
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
) -> ApiResult<Json<Workflow>> {
    let row = fetch(&state.db, workflow_id).await?;
    Ok(Json(assemble(&state.db, row).await?))
}

/// PUT /workflows/:workflow_id
#[utoipa::path(
    put,
    path = "/api/0/workflows/{workflow_id}",
    params(("workflow_id" = Uuid, Path, description = "Workflow ID")),
    request_body = UpdateWorkflowRequest,
    responses(
        (status = 200, description = "Workflow updated", body = Workflow),
        (status = 404, description = "Workflow not found"),
        (status = 409, description = "Lifecycle forbids the state change")
    ),
    tag = "workflows"
)]
pub async fn update_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
    Json(req): Json<UpdateWorkflowRequest>,
) -> ApiResult<Json<Workflow>> {
    let existing = fetch(&state.db, workflow_id).await?;
    if let Some(pattern) = &req.pattern {
        pattern.validate()?;
    }
    if let Some(next) = req.state {
        if next == WorkflowState::Deleted {
            return Err(ApiError(EngineError::invalid(
                "deletion is terminal; use DELETE /workflows/{id}",
            )));
        }
        let current = existing.workflow_state();
        if next != current {
            current.transition(next)?;
            state
                .db
                .record_audit(
                    "workflow_state",
                    Some(&existing.id),
                    json!({"from": current.as_str(), "to": next.as_str()}),
                )
                .await?;
        }
    }
    let row = state
        .db
        .update_workflow(
            &workflow_id.to_string(),
            UpdateWorkflow {
                name: req.name,
                description: req.description,
                pattern: req.pattern,
                state: req.state,
            },
        )
        .await?
        .ok_or_else(|| ApiError(EngineError::not_found("workflow", workflow_id)))?;
    Ok(Json(assemble(&state.db, row).await?))
}

/// DELETE /workflows/:workflow_id
#[utoipa::path(
    delete,
    path = "/api/0/workflows/{workflow_id}",
    params(("workflow_id" = Uuid, Path, description = "Workflow ID")),
    responses(
        (status = 204, description = "Workflow and occurrences deleted"),
        (status = 404, description = "Workflow not found")
    ),
    tag = "workflows"
)]
pub async fn delete_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    if state.db.delete_workflow(&workflow_id.to_string()).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError(EngineError::not_found("workflow", workflow_id)))
    }
}

/// POST /workflows/:workflow_id/objects
#[utoipa::path(
    post,
    path = "/api/0/workflows/{workflow_id}/objects",
    params(("workflow_id" = Uuid, Path, description = "Workflow ID")),
    request_body = AttachObjectRequest,
    responses(
        (status = 204, description = "Object attached"),
        (status = 404, description = "Workflow or object not found")
    ),
    tag = "workflows"
)]
pub async fn attach_object(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
    Json(req): Json<AttachObjectRequest>,
) -> ApiResult<StatusCode> {
    fetch(&state.db, workflow_id).await?;
    state
        .db
        .add_workflow_object(&workflow_id.to_string(), req.object_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /workflows/:workflow_id/objects/:object_id
#[utoipa::path(
    delete,
    path = "/api/0/workflows/{workflow_id}/objects/{object_id}",
    params(
        ("workflow_id" = Uuid, Path, description = "Workflow ID"),
        ("object_id" = Uuid, Path, description = "Object ID")
    ),
    responses(
        (status = 204, description = "Object detached"),
        (status = 404, description = "Attachment not found")
    ),
    tag = "workflows"
)]
pub async fn detach_object(
    State(state): State<AppState>,
    Path((workflow_id, object_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    if state
        .db
        .remove_workflow_object(&workflow_id.to_string(), object_id)
        .await?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError(EngineError::not_found("workflow_object", object_id)))
    }
}

/// GET /workflows/:workflow_id/occurrences
#[utoipa::path(
    get,
    path = "/api/0/workflows/{workflow_id}/occurrences",
    params(("workflow_id" = Uuid, Path, description = "Workflow ID")),
    responses(
        (status = 200, description = "Occurrences, oldest first", body = ListResponse<Occurrence>),
        (status = 404, description = "Workflow not found")
    ),
    tag = "workflows"
)]
pub async fn list_occurrences(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
) -> ApiResult<Json<ListResponse<Occurrence>>> {
    fetch(&state.db, workflow_id).await?;
    let rows = state.db.list_occurrences(&workflow_id.to_string()).await?;
    let mut occurrences = Vec::with_capacity(rows.len());
    for row in rows {
        occurrences.push(assemble_occurrence(&state.db, row).await?);
    }
    Ok(Json(occurrences.into()))
}

/// GET /workflows/:workflow_id/occurrences/:occurrence_id
#[utoipa::path(
    get,
    path = "/api/0/workflows/{workflow_id}/occurrences/{occurrence_id}",
    params(
        ("workflow_id" = Uuid, Path, description = "Workflow ID"),
        ("occurrence_id" = Uuid, Path, description = "Occurrence ID")
    ),
    responses(
        (status = 200, description = "Occurrence found", body = Occurrence),
        (status = 404, description = "Occurrence not found")
    ),
    tag = "workflows"
)]
pub async fn get_occurrence(
    State(state): State<AppState>,
    Path((workflow_id, occurrence_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Occurrence>> {
    let row = state
        .db
        .get_occurrence(&occurrence_id.to_string())
        .await?
        .filter(|o| o.workflow_id == workflow_id.to_string())
        .ok_or_else(|| ApiError(EngineError::not_found("occurrence", occurrence_id)))?;
    Ok(Json(assemble_occurrence(&state.db, row).await?))
}

async fn fetch(db: &Database, workflow_id: Uuid) -> ApiResult<WorkflowRow> {
    db.get_workflow(&workflow_id.to_string())
        .await?
        .ok_or_else(|| ApiError(EngineError::not_found("workflow", workflow_id)))
}
