// Enrichment worker pool
//
// Each worker holds at most one outstanding provider call. Transient
// failures retry with backoff; anything else drops the task and bumps a
// counter. Dropping is the default recovery: enrichment must never block
// or slow the ingest path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use procmine_core::event::WatchedEvent;
use procmine_core::llm::{
    analysis_prompt, CandidateObject, EnrichmentProvider, EnrichmentRequest,
    AUTO_LINK_THRESHOLD, LOW_CONFIDENCE_THRESHOLD,
};
use procmine_core::objects::LinkProvenance;
use procmine_storage::{CreateReviewTask, Database};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cache::{content_fingerprint, EnrichmentCache};
use crate::enrichment::{EnrichmentQueue, EnrichmentTask, TaskPriority};
use crate::retry::RetryPolicy;

/// Per-call provider deadline
pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);
/// OCR text shorter than this is left to the regex rules
const MIN_OCR_LEN: usize = 120;

/// Build and enqueue an enrichment task when the event carries content the
/// textual rules cannot cover. Never blocks.
pub fn enqueue_event(queue: &EnrichmentQueue, event: &WatchedEvent, priority: TaskPriority) {
    let ocr = event.field_text("ocr_text");
    let screenshot = event.field_text("screenshot");
    if screenshot.is_empty() && ocr.len() < MIN_OCR_LEN {
        return;
    }
    let context = format!("{} {}", event.field_text("title"), ocr);
    let image = if screenshot.is_empty() {
        None
    } else {
        Some(screenshot.to_string())
    };
    let task = EnrichmentTask {
        event: event.event_ref(),
        fingerprint: content_fingerprint(&context, image.as_deref()),
        priority,
        request: EnrichmentRequest {
            prompt: analysis_prompt(context.trim()),
            image_base64: image,
        },
        deadline: None,
    };
    queue.try_enqueue(task);
}

/// Spawn the fixed worker pool
pub fn spawn_enrichment_workers(
    count: usize,
    queue: Arc<EnrichmentQueue>,
    cache: Arc<EnrichmentCache>,
    provider: Arc<dyn EnrichmentProvider>,
    db: Database,
) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|worker| {
            let queue = queue.clone();
            let cache = cache.clone();
            let provider = provider.clone();
            let db = db.clone();
            tokio::spawn(async move {
                tracing::debug!(worker, "enrichment worker started");
                worker_loop(queue, cache, provider, db).await;
                tracing::debug!(worker, "enrichment worker stopped");
            })
        })
        .collect()
}

async fn worker_loop(
    queue: Arc<EnrichmentQueue>,
    cache: Arc<EnrichmentCache>,
    provider: Arc<dyn EnrichmentProvider>,
    db: Database,
) {
    let policy = RetryPolicy::default();
    while let Some(task) = queue.pop().await {
        process_task(&queue, &cache, provider.as_ref(), &db, &policy, task).await;
    }
}

async fn process_task(
    queue: &EnrichmentQueue,
    cache: &EnrichmentCache,
    provider: &dyn EnrichmentProvider,
    db: &Database,
    policy: &RetryPolicy,
    task: EnrichmentTask,
) {
    use std::sync::atomic::Ordering;

    if let Some(deadline) = task.deadline {
        if Instant::now() > deadline {
            queue.metrics.dropped_total.fetch_add(1, Ordering::Relaxed);
            return;
        }
    }

    if cache.get(&task.fingerprint).is_some() {
        queue.metrics.cache_hits_total.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let mut retries = 0u32;
    let items = loop {
        let outcome = tokio::time::timeout(PROVIDER_TIMEOUT, provider.analyze(&task.request)).await;
        let error = match outcome {
            Ok(Ok(items)) => break items,
            Ok(Err(e)) => e,
            Err(_elapsed) => procmine_core::llm::ProviderError::Timeout,
        };
        if error.is_retryable() && policy.has_retries_remaining(retries) {
            retries += 1;
            tokio::time::sleep(policy.delay_for_retry(retries)).await;
            continue;
        }
        tracing::warn!(
            event = %task.event.event_id,
            bucket = %task.event.bucket_id,
            error = %error,
            "dropping enrichment task"
        );
        queue.metrics.provider_failures_total.fetch_add(1, Ordering::Relaxed);
        return;
    };

    cache.put(task.fingerprint.clone(), items.clone());
    if let Err(e) = apply_candidates(db, &task, &items).await {
        tracing::warn!(error = %e, "failed to persist enrichment results");
        queue.metrics.provider_failures_total.fetch_add(1, Ordering::Relaxed);
        return;
    }
    queue.metrics.completed_total.fetch_add(1, Ordering::Relaxed);
}

/// Persist provider candidates: auto-link confident ones, queue the rest
/// for review, discard the noise floor
pub async fn apply_candidates(
    db: &Database,
    task: &EnrichmentTask,
    items: &[CandidateObject],
) -> procmine_core::Result<()> {
    for item in items {
        if item.confidence < LOW_CONFIDENCE_THRESHOLD {
            continue;
        }
        if db.get_object_type_by_name(&item.object_type).await?.is_none() {
            tracing::debug!(object_type = %item.object_type, "provider suggested unknown type, skipping");
            continue;
        }
        if item.confidence >= AUTO_LINK_THRESHOLD {
            let data = match &item.identifier_key {
                Some(key) => {
                    let mut map = serde_json::Map::new();
                    map.insert(key.clone(), serde_json::Value::String(item.identifier.clone()));
                    serde_json::Value::Object(map)
                }
                None => serde_json::json!({}),
            };
            let (object, _) = db
                .upsert_object(&item.object_type, &item.identifier, data, false)
                .await?;
            let object_id = Uuid::parse_str(&object.id).unwrap_or(Uuid::nil());
            db.link_event_to_object(&task.event, object_id, &LinkProvenance::Llm, item.confidence)
                .await?;
        } else {
            db.create_review_task(CreateReviewTask {
                bucket_id: task.event.bucket_id.clone(),
                event_id: task.event.event_id,
                object_type: item.object_type.clone(),
                identifier: item.identifier.clone(),
                identifier_key: item.identifier_key.clone(),
                confidence: item.confidence,
            })
            .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use procmine_core::event::EventRef;
    use procmine_core::llm::ProviderError;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StaticProvider {
        items: Vec<CandidateObject>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl EnrichmentProvider for StaticProvider {
        async fn analyze(&self, _request: &EnrichmentRequest) -> Result<Vec<CandidateObject>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.items.clone())
        }

        fn name(&self) -> &str {
            "static"
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl EnrichmentProvider for FailingProvider {
        async fn analyze(&self, _request: &EnrichmentRequest) -> Result<Vec<CandidateObject>, ProviderError> {
            Err(ProviderError::Permanent("bad request".to_string()))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    fn candidate(object_type: &str, identifier: &str, confidence: f64) -> CandidateObject {
        CandidateObject {
            object_type: object_type.to_string(),
            identifier: identifier.to_string(),
            identifier_key: None,
            confidence,
        }
    }

    fn task(event_id: i64) -> EnrichmentTask {
        EnrichmentTask {
            event: EventRef {
                bucket_id: "win".to_string(),
                event_id,
            },
            fingerprint: format!("fp-{event_id}"),
            priority: TaskPriority::Normal,
            request: EnrichmentRequest {
                prompt: "p".to_string(),
                image_base64: None,
            },
            deadline: None,
        }
    }

    async fn test_db() -> Database {
        let db = Database::open_in_memory().await.unwrap();
        procmine_storage::seed::seed_defaults(&db).await.unwrap();
        db
    }

    #[tokio::test]
    async fn test_confident_candidate_auto_links() {
        let db = test_db().await;
        let task = task(1);
        apply_candidates(&db, &task, &[candidate("invoice", "INV-9", 0.92)])
            .await
            .unwrap();
        let objects = db.objects_for_event(&task.event).await.unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].name, "INV-9");
        assert!(db.list_pending_review_tasks(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_uncertain_candidate_queues_review() {
        let db = test_db().await;
        apply_candidates(&db, &task(1), &[candidate("invoice", "INV-9", 0.6)])
            .await
            .unwrap();
        let pending = db.list_pending_review_tasks(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].identifier, "INV-9");
        assert!(db.objects_for_event(&task(1).event).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_noise_floor_and_unknown_types_discarded() {
        let db = test_db().await;
        apply_candidates(
            &db,
            &task(1),
            &[candidate("invoice", "INV-9", 0.3), candidate("starship", "NCC-1701", 0.95)],
        )
        .await
        .unwrap();
        assert!(db.objects_for_event(&task(1).event).await.unwrap().is_empty());
        assert!(db.list_pending_review_tasks(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cache_hit_skips_provider() {
        let db = test_db().await;
        let queue = EnrichmentQueue::new(8);
        let cache = EnrichmentCache::with_defaults();
        let provider = StaticProvider {
            items: vec![candidate("invoice", "INV-9", 0.9)],
            calls: AtomicU32::new(0),
        };
        let policy = RetryPolicy::default();

        process_task(&queue, &cache, &provider, &db, &policy, task(1)).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        // Same fingerprint: no second provider call
        process_task(&queue, &cache, &provider, &db, &policy, task(1)).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.metrics.snapshot().cache_hits_total, 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_drops_without_retry() {
        let db = test_db().await;
        let queue = EnrichmentQueue::new(8);
        let cache = EnrichmentCache::with_defaults();
        let policy = RetryPolicy::default();

        process_task(&queue, &cache, &FailingProvider, &db, &policy, task(1)).await;
        let metrics = queue.metrics.snapshot();
        assert_eq!(metrics.provider_failures_total, 1);
        assert_eq!(metrics.completed_total, 0);
    }

    #[tokio::test]
    async fn test_enqueue_event_requires_rich_content() {
        let queue = EnrichmentQueue::new(8);
        let plain = WatchedEvent {
            bucket_id: "win".to_string(),
            id: 1,
            timestamp: Utc::now(),
            duration: 5.0,
            data: json!({"title": "Inbox"}),
        };
        enqueue_event(&queue, &plain, TaskPriority::Normal);
        assert_eq!(queue.depth(), 0);

        let rich = WatchedEvent {
            bucket_id: "win".to_string(),
            id: 2,
            timestamp: Utc::now(),
            duration: 5.0,
            data: json!({"title": "ERP", "ocr_text": "x".repeat(200)}),
        };
        enqueue_event(&queue, &rich, TaskPriority::Normal);
        assert_eq!(queue.depth(), 1);
    }
}
