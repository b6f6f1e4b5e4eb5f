// Object extraction and ontology feedback
//
// The extraction pass is pure: rules x events -> candidate bindings plus
// per-rule counter deltas. The caller upserts objects and links and writes
// the deltas back. Ontology feedback (confirm / reject / correct) is the
// same shape: pure decisions here, persistence at the call site.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use uuid::Uuid;

use crate::event::WatchedEvent;
use crate::rules::{CompiledRule, ExtractionRule};

/// Confirm feedback moves confidence toward 1 by this fraction of the gap
pub const CONFIRM_ALPHA: f64 = 0.1;
/// Reject feedback removes this fraction of the current confidence
pub const REJECT_BETA: f64 = 0.2;
/// Confidence ceiling; a rule never becomes certain
pub const CONFIDENCE_CAP: f64 = 0.99;
/// Demote a rule when confirm/(confirm+reject) falls below this ratio
pub const DEMOTION_RATIO: f64 = 0.25;
/// ... with at least this many feedback samples
pub const DEMOTION_MIN_SAMPLES: i64 = 10;
/// Corrections of the same (rule, corrected type) before proposing a rule
pub const LEARN_CORRECTION_THRESHOLD: usize = 3;

/// One object binding produced by the extraction pass
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateBinding {
    pub rule_id: Uuid,
    pub object_type: String,
    pub name: String,
    pub data: Value,
    pub confidence: f64,
}

/// Result of extracting a batch of events
#[derive(Debug, Default)]
pub struct ExtractionPass {
    /// (event index in input batch, binding)
    pub bindings: Vec<(usize, CandidateBinding)>,
    /// Match-counter increments per rule
    pub match_deltas: HashMap<Uuid, i64>,
}

/// Apply every enabled rule to every event.
///
/// Rules must arrive sorted `priority DESC, id ASC`; higher-priority rules
/// bind first but never inhibit later rules, so one event may carry objects
/// of several types.
pub fn extract_events(rules: &[CompiledRule], events: &[WatchedEvent]) -> ExtractionPass {
    let mut pass = ExtractionPass::default();
    for (idx, event) in events.iter().enumerate() {
        for rule in rules {
            let text = rule.source_text(event);
            let matches = rule.apply(&text);
            if matches.is_empty() {
                continue;
            }
            *pass.match_deltas.entry(rule.rule.id).or_insert(0) += matches.len() as i64;
            for m in matches {
                pass.bindings.push((
                    idx,
                    CandidateBinding {
                        rule_id: rule.rule.id,
                        object_type: rule.rule.object_type.clone(),
                        name: m.name,
                        data: Value::Object(m.data),
                        confidence: rule.rule.confidence,
                    },
                ));
            }
        }
    }
    pass
}

/// New confidence after a user confirmation
pub fn apply_confirm(confidence: f64) -> f64 {
    (confidence + CONFIRM_ALPHA * (1.0 - confidence)).min(CONFIDENCE_CAP)
}

/// New confidence after a user rejection
pub fn apply_reject(confidence: f64) -> f64 {
    (confidence - REJECT_BETA * confidence).max(0.0)
}

/// Whether feedback totals demote (disable) the rule
pub fn should_demote(confirm_count: i64, reject_count: i64) -> bool {
    let samples = confirm_count + reject_count;
    if samples < DEMOTION_MIN_SAMPLES {
        return false;
    }
    (confirm_count as f64 / samples as f64) < DEMOTION_RATIO
}

/// Versioned snapshot of the enabled, compiled rule set.
///
/// Rules that fail to compile are skipped with a warning and reported so the
/// caller can quarantine them; a single bad rule never takes extraction down.
#[derive(Debug)]
pub struct RuleSet {
    pub version: u64,
    pub rules: Vec<CompiledRule>,
    pub quarantined: Vec<Uuid>,
}

impl RuleSet {
    fn build(version: u64, mut rules: Vec<ExtractionRule>) -> Self {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        let mut compiled = Vec::with_capacity(rules.len());
        let mut quarantined = Vec::new();
        for rule in rules.into_iter().filter(|r| r.enabled) {
            let id = rule.id;
            match CompiledRule::compile(rule) {
                Ok(c) => compiled.push(c),
                Err(e) => {
                    tracing::warn!(rule_id = %id, error = %e, "quarantining rule that failed to compile");
                    quarantined.push(id);
                }
            }
        }
        Self {
            version,
            rules: compiled,
            quarantined,
        }
    }
}

/// Shared cache of the active rule set.
///
/// Mutations to the rules table bump the version and replace the snapshot
/// pointer atomically; readers hold their `Arc` for the duration of one
/// extraction pass.
#[derive(Debug)]
pub struct RuleCache {
    snapshot: RwLock<Arc<RuleSet>>,
    version: AtomicU64,
}

impl RuleCache {
    pub fn new(rules: Vec<ExtractionRule>) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(RuleSet::build(1, rules))),
            version: AtomicU64::new(1),
        }
    }

    /// Current snapshot
    pub fn load(&self) -> Arc<RuleSet> {
        self.snapshot.read().expect("rule cache poisoned").clone()
    }

    /// Replace the snapshot with a freshly loaded rule list
    pub fn replace(&self, rules: Vec<ExtractionRule>) -> Arc<RuleSet> {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let fresh = Arc::new(RuleSet::build(version, rules));
        *self.snapshot.write().expect("rule cache poisoned") = fresh.clone();
        fresh
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}

/// Tracks corrections per (original rule, corrected type); reaching the
/// threshold proposes a learned rule from the latest sample text.
#[derive(Debug, Default)]
pub struct CorrectionTracker {
    counts: HashMap<(Uuid, String), Vec<String>>,
}

impl CorrectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one correction; returns the sample texts when the threshold
    /// is reached (and resets that counter).
    pub fn record(
        &mut self,
        original_rule: Uuid,
        corrected_type: &str,
        sample_text: &str,
    ) -> Option<Vec<String>> {
        let samples = self
            .counts
            .entry((original_rule, corrected_type.to_string()))
            .or_default();
        samples.push(sample_text.to_string());
        if samples.len() >= LEARN_CORRECTION_THRESHOLD {
            let out = std::mem::take(samples);
            self.counts.remove(&(original_rule, corrected_type.to_string()));
            return Some(out);
        }
        None
    }
}
