// Job registry
//
// In-memory registry of analysis/mining jobs. Only one job runs at a time;
// terminal results are retained for the process lifetime so clients can
// poll GET /jobs/{id} after completion.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use procmine_core::error::{EngineError, Result};
use serde::Serialize;
use uuid::Uuid;

/// Lifecycle of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Done,
    Failed,
}

/// What a job does, for listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Analysis,
    Extraction,
    MinePatterns,
    GroupEvents,
    DiscoverWorkflows,
    MatchWorkflow,
}

/// Snapshot of one job
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub id: Uuid,
    pub kind: JobKind,
    pub state: JobState,
    /// 0..1
    pub progress: f64,
    pub error: Option<String>,
    /// Result payload for completed jobs
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

struct JobEntry {
    status: JobStatus,
    cancel: Arc<AtomicBool>,
}

/// Registry plus the single-flight guard
#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<Uuid, JobEntry>>,
    running: Mutex<Option<Uuid>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new job and claim the single running slot.
    ///
    /// Returns the job id and its cancel flag, or `job_in_progress` with
    /// the in-flight id.
    pub fn begin(&self, kind: JobKind) -> Result<(Uuid, Arc<AtomicBool>)> {
        let mut running = self.running.lock().expect("registry poisoned");
        if let Some(active) = *running {
            return Err(EngineError::JobInProgress(active));
        }
        let id = Uuid::now_v7();
        let cancel = Arc::new(AtomicBool::new(false));
        let now = Utc::now();
        self.jobs.lock().expect("registry poisoned").insert(
            id,
            JobEntry {
                status: JobStatus {
                    id,
                    kind,
                    state: JobState::Running,
                    progress: 0.0,
                    error: None,
                    result: None,
                    created_at: now,
                    updated_at: now,
                },
                cancel: cancel.clone(),
            },
        );
        *running = Some(id);
        Ok((id, cancel))
    }

    pub fn set_progress(&self, id: Uuid, progress: f64) {
        if let Some(entry) = self.jobs.lock().expect("registry poisoned").get_mut(&id) {
            entry.status.progress = progress.clamp(0.0, 1.0);
            entry.status.updated_at = Utc::now();
        }
    }

    /// Mark done and release the running slot
    pub fn finish(&self, id: Uuid, result: serde_json::Value) {
        self.complete(id, JobState::Done, None, Some(result));
    }

    /// Mark failed and release the running slot
    pub fn fail(&self, id: Uuid, error: String) {
        self.complete(id, JobState::Failed, Some(error), None);
    }

    fn complete(&self, id: Uuid, state: JobState, error: Option<String>, result: Option<serde_json::Value>) {
        if let Some(entry) = self.jobs.lock().expect("registry poisoned").get_mut(&id) {
            entry.status.state = state;
            entry.status.error = error;
            entry.status.result = result;
            if state == JobState::Done {
                entry.status.progress = 1.0;
            }
            entry.status.updated_at = Utc::now();
        }
        let mut running = self.running.lock().expect("registry poisoned");
        if *running == Some(id) {
            *running = None;
        }
    }

    /// Request cancellation; the job observes the flag between chunks
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.jobs.lock().expect("registry poisoned").get(&id) {
            Some(entry) => {
                entry.cancel.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: Uuid) -> Option<JobStatus> {
        self.jobs
            .lock()
            .expect("registry poisoned")
            .get(&id)
            .map(|e| e.status.clone())
    }

    pub fn running_job(&self) -> Option<Uuid> {
        *self.running.lock().expect("registry poisoned")
    }

    /// Recent jobs, newest first
    pub fn list(&self, limit: usize) -> Vec<JobStatus> {
        let jobs = self.jobs.lock().expect("registry poisoned");
        let mut all: Vec<JobStatus> = jobs.values().map(|e| e.status.clone()).collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        all.truncate(limit);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_flight() {
        let registry = JobRegistry::new();
        let (first, _cancel) = registry.begin(JobKind::Analysis).unwrap();

        let err = registry.begin(JobKind::MinePatterns).unwrap_err();
        match err {
            EngineError::JobInProgress(active) => assert_eq!(active, first),
            other => panic!("expected job_in_progress, got {other:?}"),
        }

        registry.finish(first, serde_json::json!({"ok": true}));
        assert!(registry.begin(JobKind::MinePatterns).is_ok());
    }

    #[test]
    fn test_terminal_states_retained() {
        let registry = JobRegistry::new();
        let (id, _) = registry.begin(JobKind::Extraction).unwrap();
        registry.fail(id, "boom".to_string());

        let status = registry.get(id).unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.error.as_deref(), Some("boom"));
        assert!(registry.running_job().is_none());
    }

    #[test]
    fn test_cancel_sets_flag() {
        let registry = JobRegistry::new();
        let (id, cancel) = registry.begin(JobKind::Analysis).unwrap();
        assert!(!cancel.load(Ordering::SeqCst));
        assert!(registry.cancel(id));
        assert!(cancel.load(Ordering::SeqCst));
        assert!(!registry.cancel(Uuid::now_v7()));
    }

    #[test]
    fn test_progress_clamped() {
        let registry = JobRegistry::new();
        let (id, _) = registry.begin(JobKind::Analysis).unwrap();
        registry.set_progress(id, 1.5);
        assert_eq!(registry.get(id).unwrap().progress, 1.0);
    }
}
