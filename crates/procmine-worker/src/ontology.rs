// Ontology service
//
// Couples the pure extraction pass to the store: applies rules to events,
// persists objects and links, and routes user feedback (confirm / reject /
// correct) back into rule counters, confidences and learned-rule proposals.

use std::sync::{Arc, Mutex};

use procmine_core::error::{EngineError, Result};
use procmine_core::event::{EventRef, WatchedEvent};
use procmine_core::extractor::{
    apply_confirm, apply_reject, extract_events, should_demote, CorrectionTracker, RuleCache,
    RuleSet,
};
use procmine_core::objects::LinkProvenance;
use procmine_core::rules::propose_learned_rule;
use procmine_storage::Database;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

/// Outcome of one extraction pass
#[derive(Debug, Default, Clone, Serialize)]
pub struct ExtractionStats {
    pub events_scanned: u64,
    pub bindings: u64,
    pub objects_created: u64,
    pub links_written: u64,
    pub rules_quarantined: u64,
}

/// Requested changes for a Correct feedback
#[derive(Debug, Clone, Default)]
pub struct Correction {
    pub object_type: Option<String>,
    pub name: Option<String>,
    pub identifier_key: Option<String>,
}

pub struct OntologyService {
    db: Database,
    rule_cache: Arc<RuleCache>,
    corrections: Mutex<CorrectionTracker>,
}

impl OntologyService {
    /// Load enabled rules from the store into the versioned cache
    pub async fn new(db: Database) -> Result<Self> {
        let rules = db
            .list_rules(true)
            .await?
            .into_iter()
            .map(Into::into)
            .collect();
        Ok(Self {
            db,
            rule_cache: Arc::new(RuleCache::new(rules)),
            corrections: Mutex::new(CorrectionTracker::new()),
        })
    }

    pub fn rule_cache(&self) -> Arc<RuleCache> {
        self.rule_cache.clone()
    }

    /// Reload the cache after any rules-table mutation
    pub async fn refresh_rules(&self) -> Result<Arc<RuleSet>> {
        let rules = self
            .db
            .list_rules(true)
            .await?
            .into_iter()
            .map(Into::into)
            .collect();
        Ok(self.rule_cache.replace(rules))
    }

    /// Run the rule set over a batch of events and persist the results.
    ///
    /// Idempotent: re-running over the same events upserts the same objects
    /// and leaves the link set unchanged.
    pub async fn extract_and_persist(&self, events: &[WatchedEvent]) -> Result<ExtractionStats> {
        let snapshot = self.rule_cache.load();
        let mut stats = ExtractionStats {
            events_scanned: events.len() as u64,
            ..Default::default()
        };

        for &rule_id in &snapshot.quarantined {
            self.db.quarantine_rule(rule_id).await?;
            self.db
                .record_audit(
                    "rule_quarantined",
                    Some(&rule_id.to_string()),
                    json!({"reason": "regex failed to compile"}),
                )
                .await?;
            stats.rules_quarantined += 1;
        }

        let pass = extract_events(&snapshot.rules, events);
        stats.bindings = pass.bindings.len() as u64;

        for (event_idx, binding) in &pass.bindings {
            let event = &events[*event_idx];
            let (object, created) = self
                .db
                .upsert_object(&binding.object_type, &binding.name, binding.data.clone(), false)
                .await?;
            if created {
                stats.objects_created += 1;
            }
            let object_id = Uuid::parse_str(&object.id).unwrap_or(Uuid::nil());
            self.db
                .link_event_to_object(
                    &event.event_ref(),
                    object_id,
                    &LinkProvenance::Rule(binding.rule_id),
                    binding.confidence,
                )
                .await?;
            stats.links_written += 1;
        }

        for (rule_id, delta) in &pass.match_deltas {
            self.db.bump_rule_match_count(*rule_id, *delta).await?;
        }

        if stats.rules_quarantined > 0 {
            self.refresh_rules().await?;
        }
        Ok(stats)
    }

    /// Confirm feedback: the link is right; reward its rule
    pub async fn confirm(&self, event: &EventRef, object_id: Uuid) -> Result<()> {
        let Some(rule_id) = self.link_rule(event, object_id).await? else {
            return Ok(());
        };
        let Some(rule) = self.db.get_rule(&rule_id.to_string()).await? else {
            return Ok(());
        };
        let confidence = apply_confirm(rule.confidence);
        self.db
            .apply_rule_feedback(rule_id, 1, 0, confidence, false)
            .await?;
        self.refresh_rules().await?;
        Ok(())
    }

    /// Reject feedback: the link is wrong; drop it, penalise its rule and
    /// possibly demote
    pub async fn reject(&self, event: &EventRef, object_id: Uuid, reason: Option<&str>) -> Result<()> {
        let rule = self.link_rule(event, object_id).await?;
        self.db.unlink_event_from_object(event, object_id).await?;
        if let Some(rule_id) = rule {
            self.penalise_rule(rule_id).await?;
        }
        if let Some(reason) = reason {
            self.db
                .record_audit(
                    "link_rejected",
                    Some(&object_id.to_string()),
                    json!({"bucket": event.bucket_id, "event": event.event_id, "reason": reason}),
                )
                .await?;
        }
        Ok(())
    }

    /// Correct feedback: replace the link with a corrected object; repeated
    /// corrections of one rule propose a learned rule
    pub async fn correct(
        &self,
        event: &EventRef,
        object_id: Uuid,
        correction: Correction,
    ) -> Result<procmine_storage::ObjectRow> {
        let original = self
            .db
            .get_object(&object_id.to_string())
            .await?
            .ok_or_else(|| EngineError::not_found("object", object_id))?;
        let original_rule = self.link_rule(event, object_id).await?;

        self.db.unlink_event_from_object(event, object_id).await?;

        let corrected_type = correction.object_type.unwrap_or_else(|| original.object_type.clone());
        let corrected_name = correction.name.unwrap_or_else(|| original.name.clone());
        let data = match &correction.identifier_key {
            Some(key) => {
                let mut map = serde_json::Map::new();
                map.insert(key.clone(), serde_json::Value::String(corrected_name.clone()));
                serde_json::Value::Object(map)
            }
            None => json!({}),
        };
        let (corrected, _) = self
            .db
            .upsert_object(&corrected_type, &corrected_name, data, false)
            .await?;
        let corrected_id = Uuid::parse_str(&corrected.id).unwrap_or(Uuid::nil());
        self.db
            .link_event_to_object(event, corrected_id, &LinkProvenance::Manual, 1.0)
            .await?;

        if let Some(rule_id) = original_rule {
            let proposed = {
                let mut tracker = self.corrections.lock().expect("correction tracker poisoned");
                tracker.record(rule_id, &corrected_type, &corrected_name)
            };
            if let Some(samples) = proposed {
                let sample = samples.last().expect("threshold implies samples").clone();
                let rule = propose_learned_rule(
                    &corrected_type,
                    &sample,
                    vec!["title".to_string(), "url".to_string(), "ocr_text".to_string()],
                    chrono::Utc::now(),
                );
                let rule_row = self.db.create_rule(&rule).await?;
                self.db
                    .record_audit(
                        "rule_proposed",
                        Some(&rule_row.id),
                        json!({
                            "from_rule": rule_id.to_string(),
                            "object_type": corrected_type,
                            "samples": samples,
                        }),
                    )
                    .await?;
            }
        }
        Ok(corrected)
    }

    /// Reject feedback routed at a rule: penalise confidence and demote
    /// when the confirm ratio collapses
    pub async fn penalise_rule(&self, rule_id: Uuid) -> Result<()> {
        let Some(rule) = self.db.get_rule(&rule_id.to_string()).await? else {
            return Ok(());
        };
        let confidence = apply_reject(rule.confidence);
        let demote = should_demote(rule.confirm_count, rule.reject_count + 1) && rule.enabled;
        self.db
            .apply_rule_feedback(rule_id, 0, 1, confidence, demote)
            .await?;
        if demote {
            self.db
                .record_audit(
                    "rule_demoted",
                    Some(&rule_id.to_string()),
                    json!({
                        "confirms": rule.confirm_count,
                        "rejects": rule.reject_count + 1,
                    }),
                )
                .await?;
            tracing::info!(rule_id = %rule_id, "rule demoted by feedback");
        }
        self.refresh_rules().await?;
        Ok(())
    }

    /// The rule behind the (event, object) link, if rule-derived
    async fn link_rule(&self, event: &EventRef, object_id: Uuid) -> Result<Option<Uuid>> {
        let links = self.db.links_for_event(event).await?;
        Ok(links
            .iter()
            .find(|l| l.object_uuid() == object_id)
            .and_then(|l| LinkProvenance::decode(&l.provenance).rule_id()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use procmine_storage::NewEvent;

    async fn seeded_db() -> Database {
        let db = Database::open_in_memory().await.unwrap();
        procmine_storage::seed::seed_defaults(&db).await.unwrap();
        db
    }

    fn po_event(id: i64, title: &str) -> WatchedEvent {
        WatchedEvent {
            bucket_id: "win".to_string(),
            id,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 6, 10, 0, 0).unwrap(),
            duration: 5.0,
            data: json!({ "title": title }),
        }
    }

    async fn extract_one(service: &OntologyService, db: &Database, id: i64, title: &str) -> Uuid {
        db.insert_events(
            "win",
            &[NewEvent {
                id,
                timestamp: Utc.with_ymd_and_hms(2024, 1, 6, 10, 0, 0).unwrap(),
                duration: 5.0,
                data: json!({ "title": title }),
            }],
        )
        .await
        .unwrap();
        service.extract_and_persist(&[po_event(id, title)]).await.unwrap();
        let objects = db
            .objects_for_event(&EventRef {
                bucket_id: "win".to_string(),
                event_id: id,
            })
            .await
            .unwrap();
        Uuid::parse_str(&objects[0].id).unwrap()
    }

    #[tokio::test]
    async fn test_extraction_persists_object_link_and_counters() {
        let db = seeded_db().await;
        let service = OntologyService::new(db.clone()).await.unwrap();

        let stats = service
            .extract_and_persist(&[po_event(1, "Purchase Order PO-2024-001234 - ERP")])
            .await
            .unwrap();
        assert_eq!(stats.bindings, 1);
        assert_eq!(stats.objects_created, 1);

        // Second run over the same event: same object, same link set
        let stats = service
            .extract_and_persist(&[po_event(1, "Purchase Order PO-2024-001234 - ERP")])
            .await
            .unwrap();
        assert_eq!(stats.objects_created, 0);

        let objects = db.list_objects(Some("purchase_order"), None, None, None, 10).await.unwrap();
        assert_eq!(objects.len(), 1);

        let rule = db
            .list_rules(true)
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.object_type == "purchase_order")
            .unwrap();
        assert_eq!(rule.match_count, 2);
    }

    #[tokio::test]
    async fn test_ten_confirms_reach_080() {
        let db = seeded_db().await;
        let service = OntologyService::new(db.clone()).await.unwrap();
        // Bring the seed rule down to the scenario's starting point
        let rule = db
            .list_rules(true)
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.object_type == "purchase_order")
            .unwrap();
        let rule_id = Uuid::parse_str(&rule.id).unwrap();
        db.apply_rule_feedback(rule_id, 0, 0, 0.5, false).await.unwrap();
        service.refresh_rules().await.unwrap();

        let object_id = extract_one(&service, &db, 1, "Purchase Order PO-2024-001234").await;
        let event = EventRef {
            bucket_id: "win".to_string(),
            event_id: 1,
        };
        for _ in 0..10 {
            service.confirm(&event, object_id).await.unwrap();
        }
        let refreshed = db.get_rule(&rule.id).await.unwrap().unwrap();
        assert!(refreshed.confidence >= 0.80, "confidence {}", refreshed.confidence);
        assert_eq!(refreshed.confirm_count, 10);
    }

    #[tokio::test]
    async fn test_thirty_rejects_demote_with_audit() {
        let db = seeded_db().await;
        let service = OntologyService::new(db.clone()).await.unwrap();
        let rule = db
            .list_rules(true)
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.object_type == "purchase_order")
            .unwrap();
        let rule_id = Uuid::parse_str(&rule.id).unwrap();

        for _ in 0..30 {
            service.penalise_rule(rule_id).await.unwrap();
        }
        let refreshed = db.get_rule(&rule.id).await.unwrap().unwrap();
        assert!(!refreshed.enabled, "rule demoted");
        assert_eq!(refreshed.reject_count, 30);

        let audit = db.list_audit_events(100).await.unwrap();
        assert!(audit.iter().any(|a| a.kind == "rule_demoted"));
        // The demoted rule is out of the active snapshot
        assert!(service.rule_cache().load().rules.iter().all(|r| r.rule.id != rule_id));
    }

    #[tokio::test]
    async fn test_three_corrections_propose_learned_rule() {
        let db = seeded_db().await;
        let service = OntologyService::new(db.clone()).await.unwrap();

        for (id, title) in [
            (1, "Purchase Order PO-2024-000001"),
            (2, "Purchase Order PO-2024-000002"),
            (3, "Purchase Order PO-2024-000003"),
        ] {
            let object_id = extract_one(&service, &db, id, title).await;
            let event = EventRef {
                bucket_id: "win".to_string(),
                event_id: id,
            };
            service
                .correct(
                    &event,
                    object_id,
                    Correction {
                        object_type: Some("order".to_string()),
                        name: None,
                        identifier_key: Some("order_number".to_string()),
                    },
                )
                .await
                .unwrap();
        }

        let learned: Vec<_> = db
            .list_rules(false)
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.provenance == "learned")
            .collect();
        assert_eq!(learned.len(), 1);
        assert!(!learned[0].enabled, "candidate starts disabled");
        assert_eq!(learned[0].object_type, "order");
        assert!((learned[0].confidence - 0.5).abs() < 1e-9);

        let audit = db.list_audit_events(100).await.unwrap();
        assert!(audit.iter().any(|a| a.kind == "rule_proposed"));
    }

    #[tokio::test]
    async fn test_correct_replaces_link() {
        let db = seeded_db().await;
        let service = OntologyService::new(db.clone()).await.unwrap();
        let object_id = extract_one(&service, &db, 1, "Purchase Order PO-2024-001234").await;
        let event = EventRef {
            bucket_id: "win".to_string(),
            event_id: 1,
        };

        let corrected = service
            .correct(
                &event,
                object_id,
                Correction {
                    object_type: Some("order".to_string()),
                    name: Some("SO-99".to_string()),
                    identifier_key: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(corrected.object_type, "order");
        assert_eq!(corrected.name, "SO-99");

        let linked = db.objects_for_event(&event).await.unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].name, "SO-99");
        let links = db.links_for_event(&event).await.unwrap();
        assert_eq!(links[0].provenance, "manual");
    }
}
