// Enrichment provider capability
//
// Providers analyze screenshot or OCR text content and return candidate
// business objects. The engine stays provider-agnostic behind this trait;
// concrete drivers live in their own crates.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Auto-link candidates at or above this confidence
pub const AUTO_LINK_THRESHOLD: f64 = 0.8;
/// Discard candidates below this confidence
pub const LOW_CONFIDENCE_THRESHOLD: f64 = 0.5;
/// Consecutive primary failures within the window before failing over
const FAILOVER_STRIKES: u32 = 3;
/// Failure window, and the quiet period before returning to the primary
const FAILOVER_WINDOW: Duration = Duration::from_secs(60);

/// A request to analyze one event's visual or textual content
#[derive(Debug, Clone)]
pub struct EnrichmentRequest {
    pub prompt: String,
    /// Base64-encoded screenshot, when the event carries one
    pub image_base64: Option<String>,
}

/// A candidate business object returned by a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct CandidateObject {
    pub object_type: String,
    pub identifier: String,
    #[serde(default)]
    pub identifier_key: Option<String>,
    pub confidence: f64,
}

/// Provider failure classification; drives the retry policy
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// 429, 5xx, network failures: retry with backoff
    #[error("transient provider error: {0}")]
    Transient(String),
    /// Other 4xx: drop immediately
    #[error("permanent provider error: {0}")]
    Permanent(String),
    /// Response did not parse against the prompt schema
    #[error("malformed provider response: {0}")]
    Malformed(String),
    /// Call exceeded its deadline: retry as transient
    #[error("provider call timed out")]
    Timeout,
}

impl ProviderError {
    /// Whether the retry policy applies
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transient(_) | ProviderError::Timeout)
    }
}

/// Capability interface for enrichment providers
#[async_trait]
pub trait EnrichmentProvider: Send + Sync {
    async fn analyze(&self, request: &EnrichmentRequest) -> Result<Vec<CandidateObject>, ProviderError>;

    /// Short provider name for logs and health output
    fn name(&self) -> &str;
}

/// Fixed prompt schema shared by all providers
pub fn analysis_prompt(context_text: &str) -> String {
    format!(
        "You are analyzing a snapshot of a user's work screen. Identify business objects \
         (orders, invoices, purchase orders, customers, products, shipments, tasks) visible in \
         the content below. Respond with a JSON array only, no prose, where each element is \
         {{\"object_type\": string, \"identifier\": string, \"identifier_key\": string|null, \
         \"confidence\": number between 0 and 1}}.\n\nContent:\n{context_text}"
    )
}

/// Parse a provider's raw text into candidate items.
///
/// Tolerates a fenced code block around the array; anything else that is
/// not a JSON array of objects is malformed.
pub fn parse_candidates(raw: &str) -> Result<Vec<CandidateObject>, ProviderError> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.trim_end_matches("```").trim())
        .unwrap_or(trimmed);
    serde_json::from_str::<Vec<CandidateObject>>(body)
        .map_err(|e| ProviderError::Malformed(e.to_string()))
}

#[derive(Debug, Default)]
struct FailoverState {
    /// Consecutive transient/timeout primary failures and when the run began
    strikes: u32,
    first_strike: Option<Instant>,
    /// When set, requests go to the fallback until the window elapses
    failed_over_at: Option<Instant>,
}

/// Primary/fallback provider pair.
///
/// Circuit-breaker shape: three consecutive transient or timeout primary
/// failures within the window open the circuit and route calls to the
/// fallback; after the window the primary is tried again (half-open) and a
/// success closes the circuit.
pub struct FailoverProvider {
    primary: Box<dyn EnrichmentProvider>,
    fallback: Option<Box<dyn EnrichmentProvider>>,
    state: Mutex<FailoverState>,
}

impl FailoverProvider {
    pub fn new(primary: Box<dyn EnrichmentProvider>, fallback: Option<Box<dyn EnrichmentProvider>>) -> Self {
        Self {
            primary,
            fallback,
            state: Mutex::new(FailoverState::default()),
        }
    }

    fn use_fallback(&self, now: Instant) -> bool {
        if self.fallback.is_none() {
            return false;
        }
        let mut state = self.state.lock().expect("failover state poisoned");
        match state.failed_over_at {
            None => false,
            Some(opened) => {
                if now.duration_since(opened) >= FAILOVER_WINDOW {
                    // Half-open: let the next call probe the primary; one
                    // more failure reopens immediately
                    state.failed_over_at = None;
                    state.strikes = FAILOVER_STRIKES - 1;
                    state.first_strike = Some(now);
                    false
                } else {
                    true
                }
            }
        }
    }

    fn record_primary_failure(&self, error: &ProviderError, now: Instant) {
        if !error.is_retryable() {
            return;
        }
        let mut state = self.state.lock().expect("failover state poisoned");
        match state.first_strike {
            Some(first) if now.duration_since(first) <= FAILOVER_WINDOW => {
                state.strikes += 1;
            }
            _ => {
                // First failure of a fresh window; stale counts from an
                // expired window do not carry over
                state.strikes = 1;
                state.first_strike = Some(now);
            }
        }
        if state.strikes >= FAILOVER_STRIKES {
            tracing::warn!(provider = self.primary.name(), "failing over to fallback provider");
            state.failed_over_at = Some(now);
        }
    }

    fn record_primary_success(&self) {
        let mut state = self.state.lock().expect("failover state poisoned");
        state.strikes = 0;
        state.first_strike = None;
        state.failed_over_at = None;
    }
}

#[async_trait]
impl EnrichmentProvider for FailoverProvider {
    async fn analyze(&self, request: &EnrichmentRequest) -> Result<Vec<CandidateObject>, ProviderError> {
        let now = Instant::now();
        if self.use_fallback(now) {
            if let Some(fallback) = &self.fallback {
                return fallback.analyze(request).await;
            }
        }
        match self.primary.analyze(request).await {
            Ok(items) => {
                self.record_primary_success();
                Ok(items)
            }
            Err(e) => {
                self.record_primary_failure(&e, now);
                Err(e)
            }
        }
    }

    fn name(&self) -> &str {
        self.primary.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedProvider {
        name: &'static str,
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl EnrichmentProvider for ScriptedProvider {
        async fn analyze(&self, _request: &EnrichmentRequest) -> Result<Vec<CandidateObject>, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(ProviderError::Transient("scripted".to_string()))
            } else {
                Ok(vec![])
            }
        }

        fn name(&self) -> &str {
            self.name
        }
    }

    #[test]
    fn test_parse_candidates() {
        let raw = r#"[{"object_type": "invoice", "identifier": "INV-9", "identifier_key": "invoice_number", "confidence": 0.9}]"#;
        let items = parse_candidates(raw).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].object_type, "invoice");
        assert_eq!(items[0].identifier, "INV-9");
    }

    #[test]
    fn test_parse_candidates_tolerates_fences() {
        let raw = "```json\n[{\"object_type\": \"order\", \"identifier\": \"SO-1\", \"confidence\": 0.6}]\n```";
        let items = parse_candidates(raw).unwrap();
        assert_eq!(items[0].identifier, "SO-1");
        assert_eq!(items[0].identifier_key, None);
    }

    #[test]
    fn test_parse_candidates_rejects_prose() {
        let err = parse_candidates("I found an invoice INV-9").unwrap_err();
        assert!(matches!(err, ProviderError::Malformed(_)));
    }

    #[test]
    fn test_error_classification() {
        assert!(ProviderError::Transient("x".into()).is_retryable());
        assert!(ProviderError::Timeout.is_retryable());
        assert!(!ProviderError::Permanent("x".into()).is_retryable());
        assert!(!ProviderError::Malformed("x".into()).is_retryable());
    }

    #[tokio::test]
    async fn test_failover_after_three_strikes() {
        let provider = FailoverProvider::new(
            Box::new(ScriptedProvider { name: "primary", calls: AtomicU32::new(0), fail_first: u32::MAX }),
            Some(Box::new(ScriptedProvider { name: "fallback", calls: AtomicU32::new(0), fail_first: 0 })),
        );
        let request = EnrichmentRequest { prompt: "p".into(), image_base64: None };
        for _ in 0..3 {
            assert!(provider.analyze(&request).await.is_err());
        }
        // Fourth call rides the fallback and succeeds
        assert!(provider.analyze(&request).await.is_ok());
    }

    #[test]
    fn test_expired_window_strikes_do_not_carry_over() {
        let provider = FailoverProvider::new(
            Box::new(ScriptedProvider { name: "primary", calls: AtomicU32::new(0), fail_first: u32::MAX }),
            Some(Box::new(ScriptedProvider { name: "fallback", calls: AtomicU32::new(0), fail_first: 0 })),
        );
        let now = Instant::now();
        {
            // Two strikes from a window that has already expired
            let mut state = provider.state.lock().unwrap();
            state.strikes = 2;
            state.first_strike = Some(now - FAILOVER_WINDOW - Duration::from_secs(1));
        }

        let error = ProviderError::Transient("scripted".to_string());
        provider.record_primary_failure(&error, now);
        {
            let state = provider.state.lock().unwrap();
            assert_eq!(state.strikes, 1, "fresh window starts at strike one");
            assert!(state.failed_over_at.is_none());
        }

        // Two more failures inside the new window are needed to open
        provider.record_primary_failure(&error, now + Duration::from_secs(1));
        assert!(provider.state.lock().unwrap().failed_over_at.is_none());
        provider.record_primary_failure(&error, now + Duration::from_secs(2));
        assert!(provider.state.lock().unwrap().failed_over_at.is_some());
    }

    #[tokio::test]
    async fn test_no_failover_without_fallback() {
        let provider = FailoverProvider::new(
            Box::new(ScriptedProvider { name: "primary", calls: AtomicU32::new(0), fail_first: 2 }),
            None,
        );
        let request = EnrichmentRequest { prompt: "p".into(), image_base64: None };
        assert!(provider.analyze(&request).await.is_err());
        assert!(provider.analyze(&request).await.is_err());
        assert!(provider.analyze(&request).await.is_ok());
    }
}
