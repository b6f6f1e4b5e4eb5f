// Audit log HTTP routes

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use procmine_storage::{AuditEventRow, Database};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use crate::common::{ApiResult, ListResponse};

/// App state
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
}

/// One audit entry
#[derive(Debug, Serialize, ToSchema)]
pub struct AuditEntry {
    pub id: String,
    pub kind: String,
    pub entity_id: Option<String>,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl From<AuditEventRow> for AuditEntry {
    fn from(row: AuditEventRow) -> Self {
        let detail = serde_json::from_str(&row.detail).unwrap_or(serde_json::Value::Null);
        Self {
            id: row.id,
            kind: row.kind,
            entity_id: row.entity_id,
            detail,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AuditParams {
    pub limit: Option<i64>,
}

/// Create audit routes
pub fn routes(state: AppState) -> Router {
    Router::new().route("/audit", get(list_audit)).with_state(state)
}

/// GET /audit - ontology and lifecycle audit trail, newest first
#[utoipa::path(
    get,
    path = "/api/0/audit",
    params(("limit" = Option<i64>, Query, description = "Maximum rows, default 100")),
    responses(
        (status = 200, description = "Audit entries", body = ListResponse<AuditEntry>)
    ),
    tag = "audit"
)]
pub async fn list_audit(
    State(state): State<AppState>,
    Query(params): Query<AuditParams>,
) -> ApiResult<Json<ListResponse<AuditEntry>>> {
    let rows = state
        .db
        .list_audit_events(params.limit.unwrap_or(100).clamp(1, 1000))
        .await?;
    Ok(Json(rows.into_iter().map(Into::into).collect::<Vec<AuditEntry>>().into()))
}
