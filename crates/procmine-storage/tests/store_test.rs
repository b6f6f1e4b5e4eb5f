// Store contract tests against an in-memory SQLite database
// Run with: cargo test -p procmine-storage

use chrono::{TimeZone, Utc};
use procmine_core::event::EventRef;
use procmine_core::objects::LinkProvenance;
use procmine_core::workflow::{PatternDef, WorkflowState};
use procmine_storage::{seed, CreateOccurrence, CreateStep, CreateWorkflow, Database, NewEvent};
use serde_json::json;
use uuid::Uuid;

async fn test_db() -> Database {
    let db = Database::open_in_memory().await.expect("open in-memory store");
    seed::seed_defaults(&db).await.expect("seed defaults");
    db
}

fn ts(seconds: i64) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 6, 10, 0, 0).unwrap() + chrono::Duration::seconds(seconds)
}

fn new_event(id: i64, seconds: i64, title: &str) -> NewEvent {
    NewEvent {
        id,
        timestamp: ts(seconds),
        duration: 5.0,
        data: json!({ "title": title, "app": "erp" }),
    }
}

#[tokio::test]
async fn test_event_insert_is_append_only() {
    let db = test_db().await;
    let inserted = db
        .insert_events("win", &[new_event(1, 0, "a"), new_event(2, 10, "b")])
        .await
        .unwrap();
    assert_eq!(inserted, 2);

    // Re-inserting the same ids changes nothing
    let inserted = db
        .insert_events("win", &[new_event(1, 0, "a-modified")])
        .await
        .unwrap();
    assert_eq!(inserted, 0);
    let rows = db.read_events(Some("win"), ts(-10), ts(100)).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows[0].data.contains("\"a\""));
}

#[tokio::test]
async fn test_read_events_ordering_is_stable() {
    let db = test_db().await;
    // Same timestamp in two buckets plus an id tie inside one bucket
    db.insert_events("win", &[new_event(2, 0, "x"), new_event(1, 0, "y")])
        .await
        .unwrap();
    db.insert_events("afk", &[new_event(1, 0, "z")]).await.unwrap();

    let rows = db.read_events(None, ts(-10), ts(10)).await.unwrap();
    let keys: Vec<(String, i64)> = rows.into_iter().map(|r| (r.bucket_id, r.id)).collect();
    assert_eq!(
        keys,
        vec![
            ("afk".to_string(), 1),
            ("win".to_string(), 1),
            ("win".to_string(), 2),
        ]
    );
}

#[tokio::test]
async fn test_upsert_object_dedupes_on_type_and_name() {
    let db = test_db().await;
    let (first, created) = db
        .upsert_object("purchase_order", "PO-2024-001234", json!({"po_number": "001234"}), false)
        .await
        .unwrap();
    assert!(created);

    let (second, created) = db
        .upsert_object("purchase_order", "PO-2024-001234", json!({"status": "approved"}), false)
        .await
        .unwrap();
    assert!(!created);
    assert_eq!(first.id, second.id);

    // Merge added the new key and preserved the old one
    let data: serde_json::Value = serde_json::from_str(&second.data).unwrap();
    assert_eq!(data["po_number"], json!("001234"));
    assert_eq!(data["status"], json!("approved"));
}

#[tokio::test]
async fn test_upsert_replace_flag_overwrites_existing_keys() {
    let db = test_db().await;
    db.upsert_object("invoice", "INV-9", json!({"amount": "100"}), false)
        .await
        .unwrap();
    let (row, _) = db
        .upsert_object("invoice", "INV-9", json!({"amount": "250"}), true)
        .await
        .unwrap();
    let data: serde_json::Value = serde_json::from_str(&row.data).unwrap();
    assert_eq!(data["amount"], json!("250"));
}

#[tokio::test]
async fn test_upsert_unknown_type_is_not_found() {
    let db = test_db().await;
    let err = db
        .upsert_object("starship", "NCC-1701", json!({}), false)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "not_found");
}

#[tokio::test]
async fn test_link_is_idempotent_and_cascades_with_object() {
    let db = test_db().await;
    db.insert_events("win", &[new_event(1, 0, "PO-2024-001234")])
        .await
        .unwrap();
    let (object, _) = db
        .upsert_object("purchase_order", "PO-2024-001234", json!({}), false)
        .await
        .unwrap();
    let object_id = Uuid::parse_str(&object.id).unwrap();
    let event = EventRef { bucket_id: "win".to_string(), event_id: 1 };

    let rule_id = Uuid::now_v7();
    db.link_event_to_object(&event, object_id, &LinkProvenance::Rule(rule_id), 0.9)
        .await
        .unwrap();
    db.link_event_to_object(&event, object_id, &LinkProvenance::Manual, 1.0)
        .await
        .unwrap();

    let links = db.links_for_event(&event).await.unwrap();
    assert_eq!(links.len(), 1, "triple is unique");
    assert_eq!(links[0].provenance, "manual", "last writer recorded");

    db.delete_object(&object.id).await.unwrap();
    assert!(db.links_for_event(&event).await.unwrap().is_empty(), "links cascade");
}

#[tokio::test]
async fn test_events_for_object_respects_range() {
    let db = test_db().await;
    db.insert_events("win", &[new_event(1, 0, "a"), new_event(2, 500, "b")])
        .await
        .unwrap();
    let (object, _) = db.upsert_object("task", "T-1", json!({}), false).await.unwrap();
    let object_id = Uuid::parse_str(&object.id).unwrap();
    for event_id in [1, 2] {
        db.link_event_to_object(
            &EventRef { bucket_id: "win".to_string(), event_id },
            object_id,
            &LinkProvenance::Manual,
            1.0,
        )
        .await
        .unwrap();
    }
    let all = db.events_for_object(object_id, None, None).await.unwrap();
    assert_eq!(all.len(), 2);
    let early = db
        .events_for_object(object_id, Some(ts(-10)), Some(ts(100)))
        .await
        .unwrap();
    assert_eq!(early.len(), 1);
    assert_eq!(early[0].id, 1);
}

#[tokio::test]
async fn test_delete_object_type_in_use_is_forbidden() {
    let db = test_db().await;
    let object_type = db.get_object_type_by_name("invoice").await.unwrap().unwrap();
    db.upsert_object("invoice", "INV-1", json!({}), false).await.unwrap();

    let err = db.delete_object_type(&object_type.id).await.unwrap_err();
    assert_eq!(err.code(), "precondition_failed");
}

#[tokio::test]
async fn test_workflow_delete_cascades_occurrences_only() {
    let db = test_db().await;
    let step = db
        .create_step(CreateStep {
            name: "erp".to_string(),
            event_refs: vec![],
            object_ids: vec![],
            start_time: ts(0),
            end_time: ts(10),
            duration: 10.0,
            data: None,
        })
        .await
        .unwrap();

    let workflow = db
        .create_workflow(CreateWorkflow {
            name: "process-0".to_string(),
            description: None,
            pattern: PatternDef::from_labels(vec!["erp".to_string(), "mail".to_string()], 1),
            step_ids: vec![step.step_uuid()],
            object_ids: vec![],
            state: WorkflowState::Draft,
        })
        .await
        .unwrap();

    let occurrence = db
        .create_occurrence(CreateOccurrence {
            workflow_id: workflow.workflow_uuid(),
            steps: vec![(step.step_uuid(), 0)],
            start_time: ts(0),
            end_time: ts(10),
            duration: 10.0,
        })
        .await
        .unwrap();

    assert!(db.delete_workflow(&workflow.id).await.unwrap());
    assert!(db.get_occurrence(&occurrence.id).await.unwrap().is_none());
    assert!(db.occurrence_steps(&occurrence.id).await.unwrap().is_empty());
    // The step itself survives; only the occurrence graph is removed
    assert!(db.get_step(&step.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_review_task_resolution_is_single_shot() {
    let db = test_db().await;
    let task = db
        .create_review_task(procmine_storage::CreateReviewTask {
            bucket_id: "win".to_string(),
            event_id: 1,
            object_type: "invoice".to_string(),
            identifier: "INV-77".to_string(),
            identifier_key: Some("invoice_number".to_string()),
            confidence: 0.6,
        })
        .await
        .unwrap();

    let pending = db.list_pending_review_tasks(10).await.unwrap();
    assert_eq!(pending.len(), 1);

    let resolved = db.resolve_review_task(&task.id, "confirmed").await.unwrap();
    assert!(resolved.is_some());
    assert!(db.list_pending_review_tasks(10).await.unwrap().is_empty());

    // A second resolution finds nothing pending
    assert!(db.resolve_review_task(&task.id, "rejected").await.unwrap().is_none());
}

#[tokio::test]
async fn test_rule_feedback_and_audit() {
    let db = test_db().await;
    let rules = db.list_rules(true).await.unwrap();
    let rule = &rules[0];
    let rule_id = Uuid::parse_str(&rule.id).unwrap();

    db.apply_rule_feedback(rule_id, 0, 10, 0.05, true).await.unwrap();
    db.record_audit("rule_demoted", Some(&rule.id), json!({"reason": "feedback"}))
        .await
        .unwrap();

    let refreshed = db.get_rule(&rule.id).await.unwrap().unwrap();
    assert!(!refreshed.enabled);
    assert_eq!(refreshed.reject_count, 10);

    let audit = db.list_audit_events(10).await.unwrap();
    assert_eq!(audit[0].kind, "rule_demoted");
}
