// Extraction rule HTTP routes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use procmine_core::error::EngineError;
use procmine_core::rules::{CompiledRule, ExtractionRule, RuleProvenance};
use procmine_storage::{Database, UpdateRule};
use procmine_worker::orchestrator::AnalysisParams;
use procmine_worker::{AnalysisOrchestrator, OntologyService};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::common::{ApiError, ApiResult, ListResponse, TimeWindow};

/// App state
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub ontology: Arc<OntologyService>,
    pub orchestrator: Arc<AnalysisOrchestrator>,
}

/// Request to create a rule
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateRuleRequest {
    pub name: String,
    pub object_type: String,
    pub source_fields: Vec<String>,
    pub pattern: String,
    pub name_template: String,
    #[serde(default)]
    pub data_mapping: BTreeMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_enabled() -> bool {
    true
}

fn default_confidence() -> f64 {
    0.7
}

/// Request to update a rule
#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateRuleRequest {
    pub name: Option<String>,
    pub source_fields: Option<Vec<String>>,
    pub pattern: Option<String>,
    pub name_template: Option<String>,
    pub data_mapping: Option<BTreeMap<String, String>>,
    pub enabled: Option<bool>,
    pub priority: Option<i32>,
}

/// One sample for the dry-run endpoint
#[derive(Debug, Deserialize, ToSchema)]
pub struct RuleTestSample {
    pub title: Option<String>,
    pub url: Option<String>,
    pub ocr_text: Option<String>,
}

/// Body of POST /extraction-rules/:rule_id/test
#[derive(Debug, Deserialize, ToSchema)]
pub struct TestRuleRequest {
    pub samples: Vec<RuleTestSample>,
}

/// Dry-run result per sample
#[derive(Debug, Serialize, ToSchema)]
pub struct RuleTestResult {
    #[serde(rename = "match")]
    pub matched: bool,
    pub name: Option<String>,
    pub data: Option<serde_json::Value>,
}

/// Response of POST /extraction-rules/run
#[derive(Debug, Serialize, ToSchema)]
pub struct RunExtractionResponse {
    pub job_id: Uuid,
}

/// Create extraction rule routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/extraction-rules", get(list_rules).post(create_rule))
        .route("/extraction-rules/run", post(run_extraction))
        .route(
            "/extraction-rules/:rule_id",
            get(get_rule).put(update_rule).delete(delete_rule),
        )
        .route("/extraction-rules/:rule_id/test", post(test_rule))
        .with_state(state)
}

/// GET /extraction-rules
#[utoipa::path(
    get,
    path = "/api/0/extraction-rules",
    responses(
        (status = 200, description = "All rules, including disabled candidates", body = ListResponse<ExtractionRule>)
    ),
    tag = "extraction-rules"
)]
pub async fn list_rules(State(state): State<AppState>) -> ApiResult<Json<ListResponse<ExtractionRule>>> {
    let rows = state.db.list_rules(false).await?;
    Ok(Json(rows.into_iter().map(Into::into).collect::<Vec<ExtractionRule>>().into()))
}

/// POST /extraction-rules
#[utoipa::path(
    post,
    path = "/api/0/extraction-rules",
    request_body = CreateRuleRequest,
    responses(
        (status = 201, description = "Rule created", body = ExtractionRule),
        (status = 400, description = "Bad regex or template placeholder"),
        (status = 404, description = "Unknown object type")
    ),
    tag = "extraction-rules"
)]
pub async fn create_rule(
    State(state): State<AppState>,
    Json(req): Json<CreateRuleRequest>,
) -> ApiResult<(StatusCode, Json<ExtractionRule>)> {
    let now = Utc::now();
    let rule = ExtractionRule {
        id: Uuid::now_v7(),
        name: req.name,
        object_type: req.object_type,
        source_fields: req.source_fields,
        pattern: req.pattern,
        name_template: req.name_template,
        data_mapping: req.data_mapping,
        enabled: req.enabled,
        priority: req.priority,
        provenance: RuleProvenance::User,
        match_count: 0,
        confirm_count: 0,
        reject_count: 0,
        confidence: req.confidence.clamp(0.0, 1.0),
        created_at: now,
        updated_at: now,
    };
    // Compile up front so a bad rule never reaches the table
    let compiled = CompiledRule::compile(rule)?;
    let row = state.db.create_rule(&compiled.rule).await?;
    state.ontology.refresh_rules().await?;
    Ok((StatusCode::CREATED, Json(row.into())))
}

/// GET /extraction-rules/:rule_id
#[utoipa::path(
    get,
    path = "/api/0/extraction-rules/{rule_id}",
    params(("rule_id" = Uuid, Path, description = "Rule ID")),
    responses(
        (status = 200, description = "Rule found", body = ExtractionRule),
        (status = 404, description = "Rule not found")
    ),
    tag = "extraction-rules"
)]
pub async fn get_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<Uuid>,
) -> ApiResult<Json<ExtractionRule>> {
    let row = state
        .db
        .get_rule(&rule_id.to_string())
        .await?
        .ok_or_else(|| ApiError(EngineError::not_found("extraction_rule", rule_id)))?;
    Ok(Json(row.into()))
}

/// PUT /extraction-rules/:rule_id
///
/// Confirming a learned candidate is `{"enabled": true}`.
#[utoipa::path(
    put,
    path = "/api/0/extraction-rules/{rule_id}",
    params(("rule_id" = Uuid, Path, description = "Rule ID")),
    request_body = UpdateRuleRequest,
    responses(
        (status = 200, description = "Rule updated", body = ExtractionRule),
        (status = 400, description = "Updated rule no longer compiles"),
        (status = 404, description = "Rule not found")
    ),
    tag = "extraction-rules"
)]
pub async fn update_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<Uuid>,
    Json(req): Json<UpdateRuleRequest>,
) -> ApiResult<Json<ExtractionRule>> {
    let existing = state
        .db
        .get_rule(&rule_id.to_string())
        .await?
        .ok_or_else(|| ApiError(EngineError::not_found("extraction_rule", rule_id)))?;

    // Validate the merged rule before persisting
    let mut merged: ExtractionRule = existing.into();
    if let Some(name) = &req.name {
        merged.name = name.clone();
    }
    if let Some(fields) = &req.source_fields {
        merged.source_fields = fields.clone();
    }
    if let Some(pattern) = &req.pattern {
        merged.pattern = pattern.clone();
    }
    if let Some(template) = &req.name_template {
        merged.name_template = template.clone();
    }
    if let Some(mapping) = &req.data_mapping {
        merged.data_mapping = mapping.clone();
    }
    CompiledRule::compile(merged)?;

    let row = state
        .db
        .update_rule(
            &rule_id.to_string(),
            UpdateRule {
                name: req.name,
                source_fields: req.source_fields,
                pattern: req.pattern,
                name_template: req.name_template,
                data_mapping: req.data_mapping,
                enabled: req.enabled,
                priority: req.priority,
            },
        )
        .await?
        .ok_or_else(|| ApiError(EngineError::not_found("extraction_rule", rule_id)))?;
    state.ontology.refresh_rules().await?;
    Ok(Json(row.into()))
}

/// DELETE /extraction-rules/:rule_id
#[utoipa::path(
    delete,
    path = "/api/0/extraction-rules/{rule_id}",
    params(("rule_id" = Uuid, Path, description = "Rule ID")),
    responses(
        (status = 204, description = "Rule deleted"),
        (status = 404, description = "Rule not found")
    ),
    tag = "extraction-rules"
)]
pub async fn delete_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    if state.db.delete_rule(&rule_id.to_string()).await? {
        state.ontology.refresh_rules().await?;
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError(EngineError::not_found("extraction_rule", rule_id)))
    }
}

/// POST /extraction-rules/:rule_id/test - dry-run samples, no writes
#[utoipa::path(
    post,
    path = "/api/0/extraction-rules/{rule_id}/test",
    params(("rule_id" = Uuid, Path, description = "Rule ID")),
    request_body = TestRuleRequest,
    responses(
        (status = 200, description = "Per-sample match results", body = Vec<RuleTestResult>),
        (status = 404, description = "Rule not found")
    ),
    tag = "extraction-rules"
)]
pub async fn test_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<Uuid>,
    Json(req): Json<TestRuleRequest>,
) -> ApiResult<Json<Vec<RuleTestResult>>> {
    let row = state
        .db
        .get_rule(&rule_id.to_string())
        .await?
        .ok_or_else(|| ApiError(EngineError::not_found("extraction_rule", rule_id)))?;
    let compiled = CompiledRule::compile(row.into())?;

    let results = req
        .samples
        .iter()
        .map(|sample| {
            let event = procmine_core::event::WatchedEvent {
                bucket_id: "test".to_string(),
                id: 0,
                timestamp: Utc::now(),
                duration: 0.0,
                data: serde_json::json!({
                    "title": sample.title.clone().unwrap_or_default(),
                    "url": sample.url.clone().unwrap_or_default(),
                    "ocr_text": sample.ocr_text.clone().unwrap_or_default(),
                }),
            };
            let text = compiled.source_text(&event);
            match compiled.apply(&text).into_iter().next() {
                Some(m) => RuleTestResult {
                    matched: true,
                    name: Some(m.name),
                    data: Some(serde_json::Value::Object(m.data)),
                },
                None => RuleTestResult {
                    matched: false,
                    name: None,
                    data: None,
                },
            }
        })
        .collect();
    Ok(Json(results))
}

/// POST /extraction-rules/run - trigger an extraction job over a window
#[utoipa::path(
    post,
    path = "/api/0/extraction-rules/run",
    request_body = TimeWindow,
    responses(
        (status = 202, description = "Extraction job started", body = RunExtractionResponse),
        (status = 409, description = "Another job is running")
    ),
    tag = "extraction-rules"
)]
pub async fn run_extraction(
    State(state): State<AppState>,
    Json(req): Json<TimeWindow>,
) -> ApiResult<(StatusCode, Json<RunExtractionResponse>)> {
    let mut params = AnalysisParams::window(req.start, req.end);
    params.bucket = req.bucket;
    let job_id = state.orchestrator.trigger_extraction(params)?;
    Ok((StatusCode::ACCEPTED, Json(RunExtractionResponse { job_id })))
}
