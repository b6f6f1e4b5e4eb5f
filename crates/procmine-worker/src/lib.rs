// Procmine background processing
//
// Two long-lived concerns live here: the bounded LLM enrichment queue with
// its worker pool, and the single-flight analysis orchestrator with its
// job registry. The HTTP layer triggers both and polls job state.

pub mod cache;
pub mod enrichment;
pub mod jobs;
pub mod ontology;
pub mod orchestrator;
pub mod retry;
pub mod workers;

pub use enrichment::{EnrichmentQueue, EnrichmentTask, QueueMetrics, TaskPriority};
pub use jobs::{JobKind, JobRegistry, JobState, JobStatus};
pub use ontology::OntologyService;
pub use orchestrator::{AnalysisOrchestrator, AnalysisParams};
pub use workers::spawn_enrichment_workers;
