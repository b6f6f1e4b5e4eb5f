// Bounded enrichment queue
//
// FIFO with two priority lanes. Producers never block: when the queue is
// full the oldest unstarted task is discarded and counted. Workers drain
// high-priority tasks first.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use procmine_core::event::EventRef;
use procmine_core::llm::EnrichmentRequest;
use tokio::sync::Notify;

pub const DEFAULT_CAPACITY: usize = 256;

/// Task priority lane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPriority {
    High,
    Normal,
}

/// One enrichment unit of work
#[derive(Debug, Clone)]
pub struct EnrichmentTask {
    pub event: EventRef,
    pub fingerprint: String,
    pub priority: TaskPriority,
    pub request: EnrichmentRequest,
    /// Deadline of the enqueuing caller; expired tasks are skipped
    pub deadline: Option<Instant>,
}

/// Health counters, exposed on /health
#[derive(Debug, Default)]
pub struct QueueMetrics {
    pub enqueued_total: AtomicU64,
    pub dropped_total: AtomicU64,
    pub completed_total: AtomicU64,
    pub provider_failures_total: AtomicU64,
    pub cache_hits_total: AtomicU64,
}

impl QueueMetrics {
    pub fn snapshot(&self) -> QueueMetricsSnapshot {
        QueueMetricsSnapshot {
            enqueued_total: self.enqueued_total.load(Ordering::Relaxed),
            dropped_total: self.dropped_total.load(Ordering::Relaxed),
            completed_total: self.completed_total.load(Ordering::Relaxed),
            provider_failures_total: self.provider_failures_total.load(Ordering::Relaxed),
            cache_hits_total: self.cache_hits_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct QueueMetricsSnapshot {
    pub enqueued_total: u64,
    pub dropped_total: u64,
    pub completed_total: u64,
    pub provider_failures_total: u64,
    pub cache_hits_total: u64,
}

struct Lanes {
    high: VecDeque<EnrichmentTask>,
    normal: VecDeque<EnrichmentTask>,
}

impl Lanes {
    fn len(&self) -> usize {
        self.high.len() + self.normal.len()
    }

    /// Discard the oldest unstarted task, preferring the normal lane
    fn drop_oldest(&mut self) -> bool {
        if self.normal.pop_front().is_some() {
            return true;
        }
        self.high.pop_front().is_some()
    }
}

/// Bounded two-lane FIFO of enrichment tasks
pub struct EnrichmentQueue {
    lanes: Mutex<Lanes>,
    capacity: usize,
    notify: Notify,
    shutdown: AtomicBool,
    pub metrics: QueueMetrics,
}

impl EnrichmentQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            lanes: Mutex::new(Lanes {
                high: VecDeque::new(),
                normal: VecDeque::new(),
            }),
            capacity: capacity.max(1),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            metrics: QueueMetrics::default(),
        }
    }

    /// Enqueue without blocking; a full queue evicts the oldest task
    pub fn try_enqueue(&self, task: EnrichmentTask) {
        {
            let mut lanes = self.lanes.lock().expect("queue poisoned");
            match task.priority {
                TaskPriority::High => lanes.high.push_back(task),
                TaskPriority::Normal => lanes.normal.push_back(task),
            }
            while lanes.len() > self.capacity {
                if lanes.drop_oldest() {
                    self.metrics.dropped_total.fetch_add(1, Ordering::Relaxed);
                } else {
                    break;
                }
            }
        }
        self.metrics.enqueued_total.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
    }

    /// Next task, high lane first; returns None after shutdown drains
    pub async fn pop(&self) -> Option<EnrichmentTask> {
        loop {
            {
                let mut lanes = self.lanes.lock().expect("queue poisoned");
                if let Some(task) = lanes.high.pop_front().or_else(|| lanes.normal.pop_front()) {
                    return Some(task);
                }
            }
            if self.shutdown.load(Ordering::SeqCst) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Wake workers so they observe shutdown and exit
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn depth(&self) -> usize {
        self.lanes.lock().expect("queue poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(event_id: i64, priority: TaskPriority) -> EnrichmentTask {
        EnrichmentTask {
            event: EventRef {
                bucket_id: "win".to_string(),
                event_id,
            },
            fingerprint: format!("fp-{event_id}"),
            priority,
            request: EnrichmentRequest {
                prompt: "p".to_string(),
                image_base64: None,
            },
            deadline: None,
        }
    }

    #[tokio::test]
    async fn test_fifo_within_lane() {
        let queue = EnrichmentQueue::new(8);
        queue.try_enqueue(task(1, TaskPriority::Normal));
        queue.try_enqueue(task(2, TaskPriority::Normal));
        assert_eq!(queue.pop().await.unwrap().event.event_id, 1);
        assert_eq!(queue.pop().await.unwrap().event.event_id, 2);
    }

    #[tokio::test]
    async fn test_high_priority_drains_first() {
        let queue = EnrichmentQueue::new(8);
        queue.try_enqueue(task(1, TaskPriority::Normal));
        queue.try_enqueue(task(2, TaskPriority::High));
        assert_eq!(queue.pop().await.unwrap().event.event_id, 2);
        assert_eq!(queue.pop().await.unwrap().event.event_id, 1);
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_and_counts() {
        let queue = EnrichmentQueue::new(2);
        queue.try_enqueue(task(1, TaskPriority::Normal));
        queue.try_enqueue(task(2, TaskPriority::Normal));
        queue.try_enqueue(task(3, TaskPriority::Normal));
        assert_eq!(queue.depth(), 2);
        assert_eq!(queue.metrics.snapshot().dropped_total, 1);
        assert_eq!(queue.pop().await.unwrap().event.event_id, 2, "oldest was discarded");
    }

    #[tokio::test]
    async fn test_overflow_prefers_dropping_normal_lane() {
        let queue = EnrichmentQueue::new(2);
        queue.try_enqueue(task(1, TaskPriority::High));
        queue.try_enqueue(task(2, TaskPriority::Normal));
        queue.try_enqueue(task(3, TaskPriority::High));
        let first = queue.pop().await.unwrap();
        let second = queue.pop().await.unwrap();
        assert_eq!(first.event.event_id, 1);
        assert_eq!(second.event.event_id, 3);
        assert_eq!(queue.metrics.snapshot().dropped_total, 1);
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_pop() {
        let queue = std::sync::Arc::new(EnrichmentQueue::new(2));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.shutdown();
        assert!(waiter.await.unwrap().is_none());
    }
}
