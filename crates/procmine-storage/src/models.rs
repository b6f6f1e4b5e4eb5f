// Database models (internal, may differ from public DTOs)

use chrono::{DateTime, Utc};
use procmine_core::event::WatchedEvent;
use procmine_core::objects::{BusinessObject, ObjectType};
use procmine_core::rules::{ExtractionRule, RuleProvenance};
use procmine_core::workflow::{PatternDef, WorkflowState};
use sqlx::FromRow;
use uuid::Uuid;

fn parse_uuid(s: &str) -> Uuid {
    // Ids are written by this crate as hyphenated text; parsing only fails
    // on hand-edited store files
    Uuid::parse_str(s).unwrap_or(Uuid::nil())
}

fn parse_json(s: &str) -> serde_json::Value {
    serde_json::from_str(s).unwrap_or(serde_json::Value::Null)
}

// ============================================
// Events
// ============================================

/// Event row from database
#[derive(Debug, Clone, FromRow)]
pub struct EventRow {
    pub bucket_id: String,
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub duration: f64,
    pub data: String,
}

impl From<EventRow> for WatchedEvent {
    fn from(row: EventRow) -> Self {
        WatchedEvent {
            bucket_id: row.bucket_id,
            id: row.id,
            timestamp: row.timestamp,
            duration: row.duration,
            data: parse_json(&row.data),
        }
    }
}

/// Input for inserting watcher events
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub duration: f64,
    pub data: serde_json::Value,
}

/// Per-bucket summary for the buckets listing
#[derive(Debug, Clone, FromRow)]
pub struct BucketSummary {
    pub bucket_id: String,
    pub event_count: i64,
    pub last_timestamp: Option<DateTime<Utc>>,
}

// ============================================
// Object types and objects
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct ObjectTypeRow {
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub schema: Option<String>,
    pub icon: Option<String>,
    pub color: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ObjectTypeRow> for ObjectType {
    fn from(row: ObjectTypeRow) -> Self {
        ObjectType {
            id: parse_uuid(&row.id),
            name: row.name,
            display_name: row.display_name,
            schema: row.schema.as_deref().map(parse_json),
            icon: row.icon,
            color: row.color,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateObjectType {
    pub name: String,
    pub display_name: String,
    pub schema: Option<serde_json::Value>,
    pub icon: Option<String>,
    pub color: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateObjectType {
    pub display_name: Option<String>,
    pub schema: Option<serde_json::Value>,
    pub icon: Option<String>,
    pub color: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ObjectRow {
    pub id: String,
    pub object_type: String,
    pub name: String,
    pub data: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ObjectRow> for BusinessObject {
    fn from(row: ObjectRow) -> Self {
        BusinessObject {
            id: parse_uuid(&row.id),
            object_type: row.object_type,
            name: row.name,
            data: parse_json(&row.data),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpdateObject {
    pub name: Option<String>,
    pub data: Option<serde_json::Value>,
}

/// Event-object link row
#[derive(Debug, Clone, FromRow)]
pub struct EventObjectRow {
    pub bucket_id: String,
    pub event_id: i64,
    pub object_id: String,
    pub provenance: String,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

impl EventObjectRow {
    pub fn object_uuid(&self) -> Uuid {
        parse_uuid(&self.object_id)
    }
}

// ============================================
// Extraction rules
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct ExtractionRuleRow {
    pub id: String,
    pub name: String,
    pub object_type: String,
    pub source_fields: String,
    pub pattern: String,
    pub name_template: String,
    pub data_mapping: String,
    pub enabled: bool,
    pub priority: i64,
    pub provenance: String,
    pub match_count: i64,
    pub confirm_count: i64,
    pub reject_count: i64,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ExtractionRuleRow> for ExtractionRule {
    fn from(row: ExtractionRuleRow) -> Self {
        ExtractionRule {
            id: parse_uuid(&row.id),
            name: row.name,
            object_type: row.object_type,
            source_fields: serde_json::from_str(&row.source_fields).unwrap_or_default(),
            pattern: row.pattern,
            name_template: row.name_template,
            data_mapping: serde_json::from_str(&row.data_mapping).unwrap_or_default(),
            enabled: row.enabled,
            priority: row.priority as i32,
            provenance: RuleProvenance::parse(&row.provenance),
            match_count: row.match_count,
            confirm_count: row.confirm_count,
            reject_count: row.reject_count,
            confidence: row.confidence,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpdateRule {
    pub name: Option<String>,
    pub source_fields: Option<Vec<String>>,
    pub pattern: Option<String>,
    pub name_template: Option<String>,
    pub data_mapping: Option<std::collections::BTreeMap<String, String>>,
    pub enabled: Option<bool>,
    pub priority: Option<i32>,
}

// ============================================
// Steps, workflows, occurrences
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct StepRow {
    pub id: String,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration: f64,
    pub data: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StepRow {
    pub fn step_uuid(&self) -> Uuid {
        parse_uuid(&self.id)
    }

    pub fn data_json(&self) -> Option<serde_json::Value> {
        self.data.as_deref().map(parse_json)
    }
}

#[derive(Debug, Clone)]
pub struct CreateStep {
    pub name: String,
    pub event_refs: Vec<procmine_core::event::EventRef>,
    pub object_ids: Vec<Uuid>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration: f64,
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateStep {
    pub name: Option<String>,
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, FromRow)]
pub struct WorkflowRow {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub pattern: String,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRow {
    pub fn workflow_uuid(&self) -> Uuid {
        parse_uuid(&self.id)
    }

    pub fn workflow_state(&self) -> WorkflowState {
        WorkflowState::parse(&self.state).unwrap_or(WorkflowState::Draft)
    }

    pub fn pattern_def(&self) -> PatternDef {
        serde_json::from_str(&self.pattern).unwrap_or(PatternDef {
            steps: Vec::new(),
            max_gap: 1,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CreateWorkflow {
    pub name: String,
    pub description: Option<String>,
    pub pattern: PatternDef,
    pub step_ids: Vec<Uuid>,
    pub object_ids: Vec<Uuid>,
    pub state: WorkflowState,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateWorkflow {
    pub name: Option<String>,
    pub description: Option<String>,
    pub pattern: Option<PatternDef>,
    pub state: Option<WorkflowState>,
}

#[derive(Debug, Clone, FromRow)]
pub struct OccurrenceRow {
    pub id: String,
    pub workflow_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration: f64,
    pub created_at: DateTime<Utc>,
}

impl OccurrenceRow {
    pub fn occurrence_uuid(&self) -> Uuid {
        parse_uuid(&self.id)
    }
}

#[derive(Debug, Clone)]
pub struct CreateOccurrence {
    pub workflow_id: Uuid,
    /// (step id, pattern position)
    pub steps: Vec<(Uuid, i32)>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration: f64,
}

/// Occurrence step instance row
#[derive(Debug, Clone, FromRow)]
pub struct OccurrenceStepRow {
    pub occurrence_id: String,
    pub step_id: String,
    pub position: i64,
}

// ============================================
// Review tasks and audit
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct ReviewTaskRow {
    pub id: String,
    pub bucket_id: String,
    pub event_id: i64,
    pub object_type: String,
    pub identifier: String,
    pub identifier_key: Option<String>,
    pub confidence: f64,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ReviewTaskRow {
    pub fn task_uuid(&self) -> Uuid {
        parse_uuid(&self.id)
    }
}

#[derive(Debug, Clone)]
pub struct CreateReviewTask {
    pub bucket_id: String,
    pub event_id: i64,
    pub object_type: String,
    pub identifier: String,
    pub identifier_key: Option<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, FromRow)]
pub struct AuditEventRow {
    pub id: String,
    pub kind: String,
    pub entity_id: Option<String>,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}
