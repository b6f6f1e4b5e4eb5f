// Analysis orchestrator
//
// Runs the on-demand pipeline: snapshot events -> extract -> build cases ->
// mine -> reconcile with saved workflows. One job at a time; each stage
// commits its own writes, and a cancel request aborts between chunks
// without touching the stage in progress.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use procmine_core::error::Result;
use procmine_core::event::{AfkInterval, WatchedEvent};
use procmine_core::matching::{match_case, PatternMatch};
use procmine_core::mining::{identify_variants, mine_patterns, CaseSequence, MinedPattern, MiningConfig};
use procmine_core::sessionize::{build_cases, synthesize_steps_with, Case, CaseEvent, SessionizeConfig, StepDraft};
use procmine_core::workflow::{PatternDef, WorkflowState};
use procmine_storage::{CreateOccurrence, CreateStep, CreateWorkflow, Database, WorkflowRow};
use serde_json::json;
use uuid::Uuid;

use crate::enrichment::{EnrichmentQueue, TaskPriority};
use crate::jobs::{JobKind, JobRegistry};
use crate::ontology::OntologyService;
use crate::workers::enqueue_event;

/// Events per extraction chunk between cancel checks
const EXTRACTION_CHUNK: usize = 500;

/// Parameters of one analysis or mining run
#[derive(Debug, Clone)]
pub struct AnalysisParams {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub bucket: Option<String>,
    pub max_gap_seconds: f64,
    pub min_support: f64,
    pub min_length: usize,
    pub max_length: usize,
    pub contiguous: bool,
    /// Distinct cases required before a pattern is a variant
    pub min_variant_cases: usize,
    pub similarity_threshold: f64,
    /// Event data field overriding the activity-label derivation
    pub label_key: Option<String>,
}

impl AnalysisParams {
    pub fn window(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            bucket: None,
            max_gap_seconds: 120.0,
            min_support: 0.1,
            min_length: 2,
            max_length: 10,
            contiguous: true,
            min_variant_cases: 3,
            similarity_threshold: 0.8,
            label_key: None,
        }
    }

    fn mining_config(&self) -> MiningConfig {
        MiningConfig {
            min_support: self.min_support,
            min_length: self.min_length,
            max_length: self.max_length,
            contiguous: self.contiguous,
        }
    }

    fn sessionize_config(&self) -> SessionizeConfig {
        SessionizeConfig {
            max_gap_seconds: self.max_gap_seconds,
            label_key: self.label_key.clone(),
            ..Default::default()
        }
    }
}

/// AFK intervals derived from AFK-watcher buckets: events whose bucket name
/// contains "afk" and whose status field reads "afk"
pub fn afk_intervals(events: &[WatchedEvent]) -> Vec<AfkInterval> {
    events
        .iter()
        .filter(|e| e.bucket_id.contains("afk") && e.field_text("status") == "afk")
        .map(|e| AfkInterval {
            start: e.timestamp,
            end: e.end(),
        })
        .collect()
}

/// Load the window's events with their object links; AFK-bucket events are
/// split out as cut intervals rather than joining cases.
pub async fn collect_case_events(
    db: &Database,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    bucket: Option<&str>,
) -> Result<(Vec<CaseEvent>, Vec<AfkInterval>)> {
    let events: Vec<WatchedEvent> = db
        .read_events(bucket, start, end)
        .await?
        .into_iter()
        .map(Into::into)
        .collect();
    let afk = afk_intervals(&events);

    let links = db.links_for_range(start, end).await?;
    let case_events = events
        .into_iter()
        .filter(|e| !e.bucket_id.contains("afk"))
        .map(|event| {
            let objects = links
                .iter()
                .filter(|l| l.bucket_id == event.bucket_id && l.event_id == event.id)
                .map(|l| l.object_uuid())
                .collect();
            CaseEvent { event, objects }
        })
        .collect();
    Ok((case_events, afk))
}

/// Cases for a window, applying gap, AFK and object-coherence rules
pub async fn cases_for_window(db: &Database, params: &AnalysisParams) -> Result<Vec<Case>> {
    let (events, afk) = collect_case_events(db, params.start, params.end, params.bucket.as_deref()).await?;
    Ok(build_cases(events, &params.sessionize_config(), &afk))
}

/// Reduce cases to label sequences for the miner
pub fn sequences_for_cases(
    cases: &[Case],
    label_key: Option<&str>,
) -> (Vec<CaseSequence>, Vec<Vec<StepDraft>>) {
    let mut sequences = Vec::with_capacity(cases.len());
    let mut steps = Vec::with_capacity(cases.len());
    for case in cases {
        let drafts = synthesize_steps_with(case, label_key);
        sequences.push(CaseSequence {
            case_id: case.id,
            labels: drafts.iter().map(|s| s.label.clone()).collect(),
            durations: drafts.iter().map(|s| s.duration).collect(),
        });
        steps.push(drafts);
    }
    (sequences, steps)
}

/// Mine patterns over a window (used directly by the synchronous API path)
pub async fn mine_window(db: &Database, params: &AnalysisParams) -> Result<Vec<MinedPattern>> {
    let cases = cases_for_window(db, params).await?;
    let (sequences, _) = sequences_for_cases(&cases, params.label_key.as_deref());
    Ok(mine_patterns(&sequences, &params.mining_config()))
}

/// JSON summaries of cases for the group-events endpoint
pub fn case_summaries(cases: &[Case], label_key: Option<&str>) -> Vec<serde_json::Value> {
    cases
        .iter()
        .map(|case| {
            let drafts = synthesize_steps_with(case, label_key);
            json!({
                "id": case.id,
                "start": case.start(),
                "end": case.end(),
                "duration": case.duration(),
                "event_count": case.events.len(),
                "object_ids": case.object_ids(),
                "labels": drafts.iter().map(|s| s.label.clone()).collect::<Vec<_>>(),
            })
        })
        .collect()
}

/// Persist one pattern match as steps plus an occurrence
pub async fn persist_occurrence(
    db: &Database,
    workflow_id: Uuid,
    drafts: &[StepDraft],
    matched: &PatternMatch,
) -> Result<procmine_storage::OccurrenceRow> {
    let mut step_ids = Vec::with_capacity(matched.span.len());
    for &idx in &matched.span {
        let draft = &drafts[idx];
        let row = db
            .create_step(CreateStep {
                name: draft.label.clone(),
                event_refs: draft.event_refs.clone(),
                object_ids: draft.object_ids.iter().copied().collect(),
                start_time: draft.start,
                end_time: draft.end,
                duration: draft.duration,
                data: None,
            })
            .await?;
        step_ids.push(row.step_uuid());
    }
    let first = &drafts[*matched.span.first().expect("match has a span")];
    let last = &drafts[*matched.span.last().expect("match has a span")];
    let duration: f64 = matched.span.iter().map(|&i| drafts[i].duration).sum();
    db.create_occurrence(CreateOccurrence {
        workflow_id,
        steps: step_ids
            .into_iter()
            .enumerate()
            .map(|(position, id)| (id, position as i32))
            .collect(),
        start_time: first.start,
        end_time: last.end,
        duration,
    })
    .await
}

/// Match one saved workflow against prepared cases, persisting occurrences.
/// Returns how many were created.
pub async fn match_workflow_against_cases(
    db: &Database,
    workflow: &WorkflowRow,
    cases_steps: &[Vec<StepDraft>],
) -> Result<u64> {
    let pattern = workflow.pattern_def();
    if pattern.validate().is_err() {
        return Ok(0);
    }
    let workflow_id = workflow.workflow_uuid();
    let mut created = 0u64;
    for drafts in cases_steps {
        let labels: Vec<String> = drafts.iter().map(|s| s.label.clone()).collect();
        for matched in match_case(&labels, &pattern) {
            persist_occurrence(db, workflow_id, drafts, &matched).await?;
            created += 1;
        }
    }
    if created > 0 && workflow.workflow_state() == WorkflowState::Draft {
        db.update_workflow(
            &workflow.id,
            procmine_storage::UpdateWorkflow {
                state: Some(WorkflowState::Active),
                ..Default::default()
            },
        )
        .await?;
        db.record_audit(
            "workflow_state",
            Some(&workflow.id),
            json!({"from": "draft", "to": "active"}),
        )
        .await?;
    }
    Ok(created)
}

/// Cluster variants into candidate workflows and save the new ones as
/// drafts. Workflows whose exact pattern already exists are skipped.
pub async fn discover_and_save_workflows(
    db: &Database,
    variants: &[MinedPattern],
    similarity_threshold: f64,
) -> Result<Vec<WorkflowRow>> {
    let discovered = procmine_core::discovery::discover_workflows(variants, similarity_threshold);
    let existing = db.list_workflows(true).await?;
    let existing_patterns: Vec<Vec<String>> =
        existing.iter().map(|w| w.pattern_def().labels()).collect();

    let mut saved = Vec::new();
    for candidate in discovered {
        if candidate.pattern.len() < 2 {
            continue;
        }
        if existing_patterns.contains(&candidate.pattern) {
            continue;
        }
        let row = db
            .create_workflow(CreateWorkflow {
                name: candidate.name.clone(),
                description: Some(format!(
                    "discovered from {} variant(s)",
                    candidate.variant_indices.len()
                )),
                pattern: PatternDef::from_labels(candidate.pattern.clone(), 1),
                step_ids: vec![],
                object_ids: vec![],
                state: WorkflowState::Draft,
            })
            .await?;
        db.record_audit("workflow_discovered", Some(&row.id), json!({"pattern": candidate.pattern}))
            .await?;
        saved.push(row);
    }
    Ok(saved)
}

/// Coordinates the single on-demand analysis job
pub struct AnalysisOrchestrator {
    db: Database,
    jobs: Arc<JobRegistry>,
    ontology: Arc<OntologyService>,
    /// Re-analysis feeds enrichment at high priority when workers run
    queue: Option<Arc<EnrichmentQueue>>,
}

impl AnalysisOrchestrator {
    pub fn new(db: Database, jobs: Arc<JobRegistry>, ontology: Arc<OntologyService>) -> Self {
        Self {
            db,
            jobs,
            ontology,
            queue: None,
        }
    }

    /// Attach the enrichment queue so extraction stages enqueue rich events
    pub fn with_enrichment_queue(mut self, queue: Arc<EnrichmentQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn jobs(&self) -> Arc<JobRegistry> {
        self.jobs.clone()
    }

    /// Start the full analysis pipeline; returns the job id immediately or
    /// `job_in_progress` with the in-flight id.
    pub fn trigger_analysis(&self, params: AnalysisParams) -> Result<Uuid> {
        self.spawn(JobKind::Analysis, params, AnalysisScope::Full)
    }

    /// Start extraction only (POST /extraction-rules/run)
    pub fn trigger_extraction(&self, params: AnalysisParams) -> Result<Uuid> {
        self.spawn(JobKind::Extraction, params, AnalysisScope::ExtractionOnly)
    }

    /// Start a mining-only job for windows too large to answer inline
    pub fn trigger_mining(&self, params: AnalysisParams) -> Result<Uuid> {
        self.spawn(JobKind::MinePatterns, params, AnalysisScope::MiningOnly)
    }

    /// Start a case-building job
    pub fn trigger_group_events(&self, params: AnalysisParams) -> Result<Uuid> {
        self.spawn(JobKind::GroupEvents, params, AnalysisScope::GroupEvents)
    }

    /// Start a discovery job that saves new draft workflows
    pub fn trigger_discovery(&self, params: AnalysisParams) -> Result<Uuid> {
        self.spawn(JobKind::DiscoverWorkflows, params, AnalysisScope::Discover)
    }

    /// Start a matching job for one saved workflow
    pub fn trigger_match(&self, params: AnalysisParams, workflow_id: Uuid) -> Result<Uuid> {
        self.spawn(
            JobKind::MatchWorkflow,
            params,
            AnalysisScope::MatchWorkflow(workflow_id),
        )
    }

    fn spawn(&self, kind: JobKind, params: AnalysisParams, scope: AnalysisScope) -> Result<Uuid> {
        let (job_id, cancel) = self.jobs.begin(kind)?;
        let db = self.db.clone();
        let jobs = self.jobs.clone();
        let ontology = self.ontology.clone();
        let queue = self.queue.clone();
        tokio::spawn(async move {
            match run_pipeline(&db, &ontology, &jobs, queue, job_id, cancel, params, scope).await {
                Ok(result) => jobs.finish(job_id, result),
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "analysis job failed");
                    jobs.fail(job_id, e.to_string());
                }
            }
        });
        Ok(job_id)
    }
}

/// What part of the pipeline a job runs
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AnalysisScope {
    Full,
    ExtractionOnly,
    GroupEvents,
    MiningOnly,
    Discover,
    MatchWorkflow(Uuid),
}

impl AnalysisScope {
    fn runs_extraction(&self) -> bool {
        matches!(self, AnalysisScope::Full | AnalysisScope::ExtractionOnly)
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_pipeline(
    db: &Database,
    ontology: &OntologyService,
    jobs: &JobRegistry,
    queue: Option<Arc<EnrichmentQueue>>,
    job_id: Uuid,
    cancel: Arc<AtomicBool>,
    params: AnalysisParams,
    scope: AnalysisScope,
) -> Result<serde_json::Value> {
    let cancelled = || cancel.load(Ordering::SeqCst);
    let partial = |stage: &str, detail: serde_json::Value| {
        json!({"cancelled_at": stage, "partial": detail})
    };

    // Stage 1: snapshot the window
    let events: Vec<WatchedEvent> = db
        .read_events(params.bucket.as_deref(), params.start, params.end)
        .await?
        .into_iter()
        .map(Into::into)
        .collect();
    jobs.set_progress(job_id, 0.1);
    tracing::info!(job_id = %job_id, events = events.len(), "analysis window loaded");

    // Stage 2: extraction over the snapshot, chunked with cancel checks
    let mut scanned = 0u64;
    let mut links_written = 0u64;
    if scope.runs_extraction() {
        for chunk in events.chunks(EXTRACTION_CHUNK) {
            if cancelled() {
                return Ok(partial("extract", json!({"events_scanned": scanned})));
            }
            let stats = ontology.extract_and_persist(chunk).await?;
            scanned += stats.events_scanned;
            links_written += stats.links_written;
            if let Some(queue) = &queue {
                for event in chunk {
                    enqueue_event(queue, event, TaskPriority::High);
                }
            }
            let ratio = scanned as f64 / events.len().max(1) as f64;
            jobs.set_progress(job_id, 0.1 + 0.3 * ratio);
        }
    }
    if scope == AnalysisScope::ExtractionOnly {
        return Ok(json!({"events_scanned": scanned, "links_written": links_written}));
    }
    if cancelled() {
        return Ok(partial("extract", json!({"events_scanned": scanned})));
    }

    // Stage 3: sessionise
    let cases = cases_for_window(db, &params).await?;
    let (sequences, cases_steps) = sequences_for_cases(&cases, params.label_key.as_deref());
    jobs.set_progress(job_id, 0.6);
    if scope == AnalysisScope::GroupEvents {
        return Ok(json!({"cases": case_summaries(&cases, params.label_key.as_deref())}));
    }
    if let AnalysisScope::MatchWorkflow(workflow_id) = scope {
        let workflow = db
            .get_workflow(&workflow_id.to_string())
            .await?
            .ok_or_else(|| procmine_core::error::EngineError::not_found("workflow", workflow_id))?;
        let created = match_workflow_against_cases(db, &workflow, &cases_steps).await?;
        return Ok(json!({"cases": cases.len(), "occurrences_created": created}));
    }
    if cancelled() {
        return Ok(partial("cases", json!({"cases": cases.len()})));
    }

    // Stage 4: mine
    let patterns = mine_patterns(&sequences, &params.mining_config());
    let variants = identify_variants(&patterns, params.min_variant_cases);
    jobs.set_progress(job_id, 0.8);
    if scope == AnalysisScope::MiningOnly {
        return Ok(json!({
            "cases": cases.len(),
            "patterns": patterns,
            "variants": variants,
        }));
    }
    if scope == AnalysisScope::Discover {
        let saved = discover_and_save_workflows(db, &variants, params.similarity_threshold).await?;
        return Ok(json!({
            "cases": cases.len(),
            "variants": variants.len(),
            "workflows": saved.iter().map(|w| json!({"id": w.id, "name": w.name})).collect::<Vec<_>>(),
        }));
    }
    if cancelled() {
        return Ok(partial("mine", json!({"patterns": patterns.len()})));
    }

    // Stage 5: reconcile saved workflows with the new cases
    let mut occurrences_created = 0u64;
    for workflow in db.list_workflows(false).await? {
        if cancelled() {
            return Ok(partial("reconcile", json!({"occurrences_created": occurrences_created})));
        }
        occurrences_created += match_workflow_against_cases(db, &workflow, &cases_steps).await?;
    }

    Ok(json!({
        "events": events.len(),
        "events_scanned": scanned,
        "links_written": links_written,
        "cases": cases.len(),
        "patterns": patterns.len(),
        "variants": variants,
        "occurrences_created": occurrences_created,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use procmine_storage::NewEvent;
    use serde_json::json;

    fn ts(seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 6, 10, 0, 0).unwrap() + chrono::Duration::seconds(seconds)
    }

    fn ev(id: i64, seconds: i64, app: &str, title: &str) -> NewEvent {
        NewEvent {
            id,
            timestamp: ts(seconds),
            duration: 5.0,
            data: json!({"app": app, "title": title}),
        }
    }

    async fn seeded_db() -> Database {
        let db = Database::open_in_memory().await.unwrap();
        procmine_storage::seed::seed_defaults(&db).await.unwrap();
        db
    }

    #[tokio::test]
    async fn test_afk_intervals_from_status_events() {
        let events = vec![
            WatchedEvent {
                bucket_id: "aw-watcher-afk_host".to_string(),
                id: 1,
                timestamp: ts(0),
                duration: 90.0,
                data: json!({"status": "afk"}),
            },
            WatchedEvent {
                bucket_id: "aw-watcher-afk_host".to_string(),
                id: 2,
                timestamp: ts(90),
                duration: 30.0,
                data: json!({"status": "not-afk"}),
            },
        ];
        let intervals = afk_intervals(&events);
        assert_eq!(intervals.len(), 1);
        assert!((intervals[0].seconds() - 90.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_full_pipeline_end_to_end() {
        let db = seeded_db().await;
        // Three repetitions of erp -> mail separated by large gaps
        let mut events = Vec::new();
        let mut id = 1;
        for round in 0..3 {
            let base = round * 1000;
            events.push(ev(id, base, "erp", "Purchase Order PO-2024-001234 - ERP"));
            id += 1;
            events.push(ev(id, base + 30, "mail", "Outlook"));
            id += 1;
        }
        db.insert_events("win", &events).await.unwrap();

        let ontology = Arc::new(OntologyService::new(db.clone()).await.unwrap());
        let jobs = Arc::new(JobRegistry::new());
        let orchestrator = AnalysisOrchestrator::new(db.clone(), jobs.clone(), ontology.clone());

        let mut params = AnalysisParams::window(ts(-10), ts(5000));
        params.min_support = 0.5;
        params.min_variant_cases = 3;
        let job_id = orchestrator.trigger_analysis(params).unwrap();

        // Poll until the background task settles
        for _ in 0..200 {
            if let Some(status) = jobs.get(job_id) {
                if status.state != crate::jobs::JobState::Running {
                    break;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let status = jobs.get(job_id).unwrap();
        assert_eq!(status.state, crate::jobs::JobState::Done, "error: {:?}", status.error);

        let result = status.result.unwrap();
        assert_eq!(result["cases"], json!(3));
        // Extraction found the PO object in each round
        let objects = db.list_objects(Some("purchase_order"), None, None, None, 10).await.unwrap();
        assert_eq!(objects.len(), 1);
        // The erp -> mail pattern was mined as a variant
        let variants = result["variants"].as_array().unwrap();
        assert!(variants.iter().any(|v| v["labels"] == json!(["erp", "mail"])));
    }

    #[tokio::test]
    async fn test_second_trigger_while_running_is_rejected() {
        let db = seeded_db().await;
        let ontology = Arc::new(OntologyService::new(db.clone()).await.unwrap());
        let jobs = Arc::new(JobRegistry::new());
        let orchestrator = AnalysisOrchestrator::new(db.clone(), jobs.clone(), ontology);

        let (first, _cancel) = jobs.begin(JobKind::Analysis).unwrap();
        let err = orchestrator
            .trigger_analysis(AnalysisParams::window(ts(0), ts(100)))
            .unwrap_err();
        assert_eq!(err.code(), "job_in_progress");
        jobs.finish(first, json!({}));
    }

    #[tokio::test]
    async fn test_discover_saves_draft_workflows_once() {
        let db = seeded_db().await;
        let variants = vec![MinedPattern {
            labels: vec!["erp".to_string(), "mail".to_string()],
            case_indices: vec![0, 1, 2],
            support: 0.75,
            avg_duration: 40.0,
        }];
        let saved = discover_and_save_workflows(&db, &variants, 0.8).await.unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].state, "draft");
        assert_eq!(saved[0].name, "process-0");

        // Same pattern again: nothing new
        let saved = discover_and_save_workflows(&db, &variants, 0.8).await.unwrap();
        assert!(saved.is_empty());
    }

    #[tokio::test]
    async fn test_matching_promotes_draft_and_persists_occurrence() {
        let db = seeded_db().await;
        db.insert_events(
            "win",
            &[
                ev(1, 0, "erp", "po work"),
                ev(2, 30, "mail", "send"),
                ev(3, 60, "erp", "confirm"),
            ],
        )
        .await
        .unwrap();

        let workflow = db
            .create_workflow(CreateWorkflow {
                name: "po round trip".to_string(),
                description: None,
                pattern: PatternDef::from_labels(
                    vec!["erp".to_string(), "mail".to_string(), "erp".to_string()],
                    1,
                ),
                step_ids: vec![],
                object_ids: vec![],
                state: WorkflowState::Draft,
            })
            .await
            .unwrap();

        let params = AnalysisParams::window(ts(-10), ts(500));
        let cases = cases_for_window(&db, &params).await.unwrap();
        let (_, cases_steps) = sequences_for_cases(&cases, None);
        let created = match_workflow_against_cases(&db, &workflow, &cases_steps).await.unwrap();
        assert_eq!(created, 1);

        let refreshed = db.get_workflow(&workflow.id).await.unwrap().unwrap();
        assert_eq!(refreshed.state, "active");
        let occurrences = db.list_occurrences(&workflow.id).await.unwrap();
        assert_eq!(occurrences.len(), 1);
        let steps = db.occurrence_steps(&occurrences[0].id).await.unwrap();
        assert_eq!(steps.len(), 3);
    }
}
