// Case building
//
// Turns a time-ordered event window into candidate process instances:
// gap-based sessionisation, AFK cuts, object-coherence sub-cases, and
// step synthesis (collapsing consecutive same-label events).

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::event::{AfkInterval, EventRef, WatchedEvent};

/// Sessionisation parameters
#[derive(Debug, Clone)]
pub struct SessionizeConfig {
    /// Cut a case boundary when the inter-event gap exceeds this
    pub max_gap_seconds: f64,
    /// Cut across any AFK interval at least this long
    pub afk_cut_seconds: f64,
    /// Prefer this event data field as the activity label
    pub label_key: Option<String>,
}

impl Default for SessionizeConfig {
    fn default() -> Self {
        Self {
            max_gap_seconds: 120.0,
            afk_cut_seconds: 60.0,
            label_key: None,
        }
    }
}

/// An event together with the object ids linked to it
#[derive(Debug, Clone)]
pub struct CaseEvent {
    pub event: WatchedEvent,
    pub objects: Vec<Uuid>,
}

/// A candidate process instance: a bounded, temporally-coherent event run.
///
/// Cases have stable identity only for the duration of one analysis run.
#[derive(Debug, Clone)]
pub struct Case {
    pub id: Uuid,
    pub events: Vec<CaseEvent>,
}

impl Case {
    fn new(events: Vec<CaseEvent>) -> Self {
        Self {
            id: Uuid::now_v7(),
            events,
        }
    }

    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.events.first().map(|e| e.event.timestamp)
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.events.last().map(|e| e.event.end())
    }

    /// Sum of event durations (foreground time, not end - start)
    pub fn duration(&self) -> f64 {
        self.events.iter().map(|e| e.event.duration).sum()
    }

    /// Union of object ids across the case's events
    pub fn object_ids(&self) -> BTreeSet<Uuid> {
        self.events.iter().flat_map(|e| e.objects.iter().copied()).collect()
    }
}

/// A labelled grouping of consecutive same-activity events within a case
#[derive(Debug, Clone, PartialEq)]
pub struct StepDraft {
    pub label: String,
    pub event_refs: Vec<EventRef>,
    pub object_ids: BTreeSet<Uuid>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Sum of member durations, consistent with the watcher convention
    pub duration: f64,
}

/// Partition a sorted event run at gaps larger than `max_gap_seconds` and
/// across qualifying AFK intervals.
///
/// Concatenating the returned partitions in order reproduces the input.
pub fn split_by_gaps(
    events: Vec<CaseEvent>,
    config: &SessionizeConfig,
    afk: &[AfkInterval],
) -> Vec<Vec<CaseEvent>> {
    let mut out: Vec<Vec<CaseEvent>> = Vec::new();
    let mut current: Vec<CaseEvent> = Vec::new();

    for event in events {
        if let Some(prev) = current.last() {
            let prev_end = prev.event.end();
            let next_start = event.event.timestamp;
            let gap = (next_start - prev_end).num_milliseconds() as f64 / 1000.0;
            let afk_cut = afk.iter().any(|interval| {
                interval.seconds() >= config.afk_cut_seconds
                    && interval.start < next_start
                    && interval.end > prev_end
            });
            if gap > config.max_gap_seconds || afk_cut {
                out.push(std::mem::take(&mut current));
            }
        }
        current.push(event);
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Derive object-coherent sub-cases from a gap case.
///
/// For each object id present, the ordered subsequence of events linked to
/// it forms a sub-case when it has at least two events and differs from the
/// parent. Sub-cases may overlap; the same window can exhibit both a
/// per-object and a per-session process.
pub fn object_subcases(events: &[CaseEvent]) -> Vec<Vec<CaseEvent>> {
    let mut subcases: Vec<Vec<CaseEvent>> = Vec::new();
    let mut seen: BTreeSet<Vec<(String, i64)>> = BTreeSet::new();

    let all_ids: BTreeSet<Uuid> = events.iter().flat_map(|e| e.objects.iter().copied()).collect();
    for object_id in all_ids {
        let subset: Vec<CaseEvent> = events
            .iter()
            .filter(|e| e.objects.contains(&object_id))
            .cloned()
            .collect();
        if subset.len() < 2 || subset.len() == events.len() {
            continue;
        }
        let key: Vec<(String, i64)> = subset
            .iter()
            .map(|e| (e.event.bucket_id.clone(), e.event.id))
            .collect();
        if seen.insert(key) {
            subcases.push(subset);
        }
    }
    subcases
}

/// Build the full case set for an analysis window: gap cases plus their
/// object-coherent sub-cases.
pub fn build_cases(
    events: Vec<CaseEvent>,
    config: &SessionizeConfig,
    afk: &[AfkInterval],
) -> Vec<Case> {
    let mut cases = Vec::new();
    for partition in split_by_gaps(events, config, afk) {
        let subcases = object_subcases(&partition);
        cases.push(Case::new(partition));
        cases.extend(subcases.into_iter().map(Case::new));
    }
    cases
}

/// Collapse consecutive events sharing an activity label into steps.
/// A configured label key takes precedence over the standard derivation.
pub fn synthesize_steps_with(case: &Case, label_key: Option<&str>) -> Vec<StepDraft> {
    let mut steps: Vec<StepDraft> = Vec::new();
    for event in &case.events {
        let label = label_key
            .map(|key| event.event.field_text(key))
            .filter(|text| !text.is_empty())
            .map(|text| text.to_string())
            .unwrap_or_else(|| event.event.activity_label());
        match steps.last_mut() {
            Some(step) if step.label == label => {
                step.event_refs.push(event.event.event_ref());
                step.object_ids.extend(event.objects.iter().copied());
                step.end = event.event.end();
                step.duration += event.event.duration;
            }
            _ => steps.push(StepDraft {
                label,
                event_refs: vec![event.event.event_ref()],
                object_ids: event.objects.iter().copied().collect(),
                start: event.event.timestamp,
                end: event.event.end(),
                duration: event.event.duration,
            }),
        }
    }
    steps
}

/// Step synthesis with the standard label derivation
pub fn synthesize_steps(case: &Case) -> Vec<StepDraft> {
    synthesize_steps_with(case, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 6, 10, 0, 0).unwrap() + chrono::Duration::seconds(seconds)
    }

    fn ev(id: i64, t: i64, app: &str) -> CaseEvent {
        CaseEvent {
            event: WatchedEvent {
                bucket_id: "win".to_string(),
                id,
                timestamp: at(t),
                duration: 5.0,
                data: json!({ "app": app }),
            },
            objects: vec![],
        }
    }

    fn ev_obj(id: i64, t: i64, app: &str, objects: Vec<Uuid>) -> CaseEvent {
        CaseEvent {
            objects,
            ..ev(id, t, app)
        }
    }

    #[test]
    fn test_gap_sessionisation_scenario() {
        // t = 0, 60, 119, 400, 460; duration 5; max_gap 120
        let events = vec![ev(1, 0, "erp"), ev(2, 60, "erp"), ev(3, 119, "erp"), ev(4, 400, "erp"), ev(5, 460, "erp")];
        let cases = split_by_gaps(events, &SessionizeConfig::default(), &[]);
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].iter().map(|e| e.event.id).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(cases[1].iter().map(|e| e.event.id).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[test]
    fn test_concatenated_partitions_reproduce_input() {
        let events: Vec<CaseEvent> = (0..20).map(|i| ev(i, i * 90, "erp")).collect();
        let ids: Vec<i64> = events.iter().map(|e| e.event.id).collect();
        let cases = split_by_gaps(
            events,
            &SessionizeConfig {
                max_gap_seconds: 100.0,
                ..Default::default()
            },
            &[],
        );
        let rejoined: Vec<i64> = cases.iter().flatten().map(|e| e.event.id).collect();
        assert_eq!(rejoined, ids);
        // Every intra-case gap <= max_gap, every boundary gap > max_gap
        for case in &cases {
            for pair in case.windows(2) {
                let gap = (pair[1].event.timestamp - pair[0].event.end()).num_seconds();
                assert!(gap <= 100);
            }
        }
    }

    #[test]
    fn test_afk_interval_cuts_case() {
        let events = vec![ev(1, 0, "erp"), ev(2, 100, "erp")];
        let afk = [AfkInterval { start: at(10), end: at(80) }];
        let cases = split_by_gaps(events, &SessionizeConfig::default(), &afk);
        assert_eq!(cases.len(), 2);
    }

    #[test]
    fn test_short_afk_interval_does_not_cut() {
        let events = vec![ev(1, 0, "erp"), ev(2, 100, "erp")];
        let afk = [AfkInterval { start: at(10), end: at(40) }];
        let cases = split_by_gaps(events, &SessionizeConfig::default(), &afk);
        assert_eq!(cases.len(), 1);
    }

    #[test]
    fn test_zero_duration_events_kept() {
        let mut e = ev(1, 0, "erp");
        e.event.duration = 0.0;
        let cases = split_by_gaps(vec![e, ev(2, 30, "erp")], &SessionizeConfig::default(), &[]);
        assert_eq!(cases[0].len(), 2);
    }

    #[test]
    fn test_object_subcases_share_an_id() {
        let po = Uuid::now_v7();
        let invoice = Uuid::now_v7();
        let events = vec![
            ev_obj(1, 0, "erp", vec![po]),
            ev_obj(2, 10, "mail", vec![invoice]),
            ev_obj(3, 20, "erp", vec![po]),
            ev_obj(4, 30, "mail", vec![invoice]),
        ];
        let subcases = object_subcases(&events);
        assert_eq!(subcases.len(), 2);
        for sub in &subcases {
            assert_eq!(sub.len(), 2);
        }
    }

    #[test]
    fn test_single_event_subcase_dropped() {
        let po = Uuid::now_v7();
        let events = vec![ev_obj(1, 0, "erp", vec![po]), ev(2, 10, "mail")];
        assert!(object_subcases(&events).is_empty());
    }

    #[test]
    fn test_build_cases_keeps_gap_case_and_subcases() {
        let po = Uuid::now_v7();
        let events = vec![
            ev_obj(1, 0, "erp", vec![po]),
            ev(2, 10, "mail"),
            ev_obj(3, 20, "erp", vec![po]),
        ];
        let cases = build_cases(events, &SessionizeConfig::default(), &[]);
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].events.len(), 3);
        assert_eq!(cases[1].events.len(), 2);
    }

    #[test]
    fn test_step_synthesis_collapses_consecutive_labels() {
        let case = Case::new(vec![ev(1, 0, "erp"), ev(2, 10, "erp"), ev(3, 20, "mail"), ev(4, 30, "erp")]);
        let steps = synthesize_steps(&case);
        let labels: Vec<&str> = steps.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["erp", "mail", "erp"]);
        assert_eq!(steps[0].event_refs.len(), 2);
        assert_eq!(steps[0].duration, 10.0);
        assert_eq!(steps[0].start, at(0));
        assert_eq!(steps[0].end, at(15));
    }

    #[test]
    fn test_label_key_override() {
        let mut first = ev(1, 0, "erp");
        first.event.data = serde_json::json!({"app": "erp", "project": "alpha"});
        let mut second = ev(2, 10, "erp");
        second.event.data = serde_json::json!({"app": "erp", "project": "beta"});
        let case = Case::new(vec![first, second]);

        assert_eq!(synthesize_steps(&case).len(), 1);
        let by_project = synthesize_steps_with(&case, Some("project"));
        assert_eq!(by_project.len(), 2);
        assert_eq!(by_project[0].label, "alpha");
    }
}
