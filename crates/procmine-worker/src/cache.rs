// Enrichment result cache
//
// Bounded LRU keyed by content fingerprint with a TTL; eviction is safe to
// lose, a miss just re-runs the provider call.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use procmine_core::llm::CandidateObject;
use sha2::{Digest, Sha256};

pub const DEFAULT_CAPACITY: usize = 4096;
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Fingerprint of the analyzable content of an event
pub fn content_fingerprint(text: &str, image_base64: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    if let Some(image) = image_base64 {
        hasher.update(image.as_bytes());
    }
    hex::encode(hasher.finalize())
}

struct CacheEntry {
    items: Vec<CandidateObject>,
    stored_at: Instant,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// Recency order, least recent at the front
    order: VecDeque<String>,
}

/// Bounded LRU/TTL cache of provider results
pub struct EnrichmentCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    ttl: Duration,
}

impl EnrichmentCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
            ttl,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }

    pub fn get(&self, fingerprint: &str) -> Option<Vec<CandidateObject>> {
        let mut inner = self.inner.lock().expect("cache poisoned");
        let expired = match inner.entries.get(fingerprint) {
            Some(entry) => entry.stored_at.elapsed() > self.ttl,
            None => return None,
        };
        if expired {
            inner.entries.remove(fingerprint);
            inner.order.retain(|k| k != fingerprint);
            return None;
        }
        // Refresh recency
        inner.order.retain(|k| k != fingerprint);
        inner.order.push_back(fingerprint.to_string());
        inner.entries.get(fingerprint).map(|e| e.items.clone())
    }

    pub fn put(&self, fingerprint: String, items: Vec<CandidateObject>) {
        let mut inner = self.inner.lock().expect("cache poisoned");
        if inner.entries.insert(
            fingerprint.clone(),
            CacheEntry {
                items,
                stored_at: Instant::now(),
            },
        )
        .is_none()
        {
            inner.order.push_back(fingerprint);
        } else {
            inner.order.retain(|k| k != &fingerprint);
            inner.order.push_back(fingerprint);
        }
        while inner.entries.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
