// Procmine core engine
//
// Pure process-mining logic: object extraction with a learning ontology,
// gap/object sessionisation, sequential pattern mining, workflow discovery
// and matching. No database access in this crate; callers feed events and
// links in and persist the results.

pub mod config;
pub mod discovery;
pub mod error;
pub mod event;
pub mod extractor;
pub mod llm;
pub mod matching;
pub mod mining;
pub mod objects;
pub mod rules;
pub mod sessionize;
pub mod workflow;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use event::{EventRef, WatchedEvent};
pub use objects::{BusinessObject, ObjectType, DEFAULT_OBJECT_TYPES};
pub use rules::{CompiledRule, ExtractionRule, RuleProvenance};
pub use workflow::{Occurrence, Step, Workflow, WorkflowState};
