// Workflow, step and occurrence entities
//
// A workflow is a named, saved pattern template with a lifecycle; an
// occurrence is one concrete matching of that pattern against a case.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::event::EventRef;

/// Workflow lifecycle.
///
/// draft (created, never matched) -> active (at least one occurrence) ->
/// archived (explicit user action). deleted is terminal and cascade-deletes
/// occurrences. No other transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum WorkflowState {
    Draft,
    Active,
    Archived,
    Deleted,
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Draft => "draft",
            WorkflowState::Active => "active",
            WorkflowState::Archived => "archived",
            WorkflowState::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(WorkflowState::Draft),
            "active" => Some(WorkflowState::Active),
            "archived" => Some(WorkflowState::Archived),
            "deleted" => Some(WorkflowState::Deleted),
            _ => None,
        }
    }

    /// Whether the lifecycle permits `self -> to`
    pub fn can_transition(&self, to: WorkflowState) -> bool {
        use WorkflowState::*;
        matches!(
            (self, to),
            (Draft, Active) | (Active, Archived) | (Draft, Deleted) | (Active, Deleted) | (Archived, Deleted)
        )
    }

    /// Validate a transition, surfacing the taxonomy error on refusal
    pub fn transition(&self, to: WorkflowState) -> Result<WorkflowState> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(EngineError::precondition(format!(
                "workflow cannot move from {} to {}",
                self.as_str(),
                to.as_str()
            )))
        }
    }
}

/// One position of a workflow pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct PatternStep {
    pub label: String,
    /// Optional steps may be absent from a matching case
    #[serde(default)]
    pub optional: bool,
}

/// A workflow's pattern definition: ordered abstract activity labels with
/// an allowed gap between matched positions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct PatternDef {
    pub steps: Vec<PatternStep>,
    /// Labels tolerated between consecutive matched positions
    #[serde(default = "default_max_gap")]
    pub max_gap: usize,
}

fn default_max_gap() -> usize {
    1
}

impl PatternDef {
    /// Build a required-only pattern from plain labels
    pub fn from_labels(labels: Vec<String>, max_gap: usize) -> Self {
        Self {
            steps: labels
                .into_iter()
                .map(|label| PatternStep {
                    label,
                    optional: false,
                })
                .collect(),
            max_gap,
        }
    }

    /// Pattern length must be at least 2
    pub fn validate(&self) -> Result<()> {
        if self.steps.len() < 2 {
            return Err(EngineError::invalid("workflow pattern needs at least 2 steps"));
        }
        Ok(())
    }

    pub fn labels(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.label.clone()).collect()
    }
}

/// A labelled grouping of events behaving as one logical activity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Step {
    pub id: Uuid,
    pub name: String,
    pub event_refs: Vec<EventRef>,
    pub object_ids: BTreeSet<Uuid>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration: f64,
    /// Optional extras, e.g. canonical app
    pub data: Option<serde_json::Value>,
}

/// A saved process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub pattern: PatternDef,
    /// Ordered step template ids
    pub step_ids: Vec<Uuid>,
    pub object_ids: Vec<Uuid>,
    pub state: WorkflowState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A step instance inside an occurrence, with its pattern position
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct OccurrenceStep {
    pub step_id: Uuid,
    pub position: i32,
}

/// One concrete matching of a workflow against a case
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Occurrence {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub steps: Vec<OccurrenceStep>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration: f64,
    pub object_ids: Vec<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_allowed_edges() {
        use WorkflowState::*;
        assert!(Draft.can_transition(Active));
        assert!(Active.can_transition(Archived));
        assert!(Draft.can_transition(Deleted));
        assert!(Active.can_transition(Deleted));
        assert!(Archived.can_transition(Deleted));
    }

    #[test]
    fn test_lifecycle_forbidden_edges() {
        use WorkflowState::*;
        assert!(!Draft.can_transition(Archived));
        assert!(!Archived.can_transition(Active));
        assert!(!Active.can_transition(Draft));
        assert!(!Deleted.can_transition(Draft));
        assert!(!Deleted.can_transition(Active));
        let err = Archived.transition(Active).unwrap_err();
        assert_eq!(err.code(), "precondition_failed");
    }

    #[test]
    fn test_pattern_needs_two_steps() {
        let short = PatternDef::from_labels(vec!["A".to_string()], 1);
        assert_eq!(short.validate().unwrap_err().code(), "invalid_argument");
        let ok = PatternDef::from_labels(vec!["A".to_string(), "B".to_string()], 1);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            WorkflowState::Draft,
            WorkflowState::Active,
            WorkflowState::Archived,
            WorkflowState::Deleted,
        ] {
            assert_eq!(WorkflowState::parse(state.as_str()), Some(state));
        }
        assert_eq!(WorkflowState::parse("bogus"), None);
    }
}
