// Integration tests for the Procmine API
// Run with a server listening on 127.0.0.1:5620:
//   cargo test --test integration_test -- --ignored

use serde_json::{json, Value};

const API_BASE_URL: &str = "http://127.0.0.1:5620";

fn api(path: &str) -> String {
    format!("{API_BASE_URL}/api/0{path}")
}

#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_extraction_round_trip() {
    let client = reqwest::Client::new();

    // Health check first
    let health = client
        .get(format!("{API_BASE_URL}/health"))
        .send()
        .await
        .expect("server not reachable");
    assert_eq!(health.status(), 200);

    // Ingest one purchase-order event
    let ingest = client
        .post(api("/buckets/it-win/events"))
        .json(&json!({
            "events": [{
                "id": 1,
                "timestamp": "2024-01-06T10:30:00Z",
                "duration": 5.0,
                "data": {"title": "Purchase Order PO-2024-001234 - ERP", "app": "erp"}
            }]
        }))
        .send()
        .await
        .expect("ingest failed");
    assert_eq!(ingest.status(), 200);
    let body: Value = ingest.json().await.unwrap();
    assert!(body["links_written"].as_u64().unwrap() >= 1, "seed rule links the PO");

    // The object exists exactly once
    let objects: Value = client
        .get(api("/objects?type=purchase_order&q=PO-2024-001234"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(objects["data"].as_array().unwrap().len(), 1);
    let object_id = objects["data"][0]["id"].as_str().unwrap().to_string();

    // The event lists the object
    let linked: Value = client
        .get(api("/buckets/it-win/events/1/objects"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(linked["data"]
        .as_array()
        .unwrap()
        .iter()
        .any(|o| o["id"] == json!(object_id)));

    // Re-linking is idempotent
    let relink = client
        .post(api("/buckets/it-win/events/1/objects"))
        .json(&json!({"object_id": object_id}))
        .send()
        .await
        .unwrap();
    assert_eq!(relink.status(), 204);
}

#[tokio::test]
#[ignore]
async fn test_error_envelope_shape() {
    let client = reqwest::Client::new();
    let missing = client
        .get(api("/workflows/00000000-0000-0000-0000-000000000000"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
    let body: Value = missing.json().await.unwrap();
    assert_eq!(body["error"]["code"], json!("not_found"));
    assert!(body["error"]["message"].is_string());
}

#[tokio::test]
#[ignore]
async fn test_rule_dry_run() {
    let client = reqwest::Client::new();
    let rules: Value = client
        .get(api("/extraction-rules"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let po_rule = rules["data"]
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["object_type"] == json!("purchase_order"))
        .expect("seed rule present")
        .clone();

    let results: Value = client
        .post(api(&format!("/extraction-rules/{}/test", po_rule["id"].as_str().unwrap())))
        .json(&json!({
            "samples": [
                {"title": "Purchase Order PO-2024-001234"},
                {"title": "lunch menu"}
            ]
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(results[0]["match"], json!(true));
    assert_eq!(results[0]["name"], json!("PO-2024-001234"));
    assert_eq!(results[1]["match"], json!(false));
}

#[tokio::test]
#[ignore]
async fn test_workflow_lifecycle_over_http() {
    let client = reqwest::Client::new();
    let created: Value = client
        .post(api("/workflows"))
        .json(&json!({
            "name": "it lifecycle",
            "pattern": {"steps": [{"label": "A"}, {"label": "B"}], "max_gap": 1}
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["state"], json!("draft"));

    // draft -> archived is not a legal edge
    let bad = client
        .put(api(&format!("/workflows/{id}")))
        .json(&json!({"state": "archived"}))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), 409);

    // draft -> active -> archived is
    for next in ["active", "archived"] {
        let ok = client
            .put(api(&format!("/workflows/{id}")))
            .json(&json!({"state": next}))
            .send()
            .await
            .unwrap();
        assert_eq!(ok.status(), 200, "transition to {next}");
    }

    let gone = client
        .delete(api(&format!("/workflows/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), 204);
}
