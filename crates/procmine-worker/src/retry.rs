// Retry policy for provider calls
//
// Exponential backoff with jitter to avoid thundering herd.

use std::time::Duration;

use rand::Rng;

/// Backoff configuration for transient provider failures
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub factor: f64,
    /// Fractional jitter, e.g. 0.2 for +-20%
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            factor: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry (1-based)
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let base = self.base_delay.as_secs_f64() * self.factor.powi(retry as i32 - 1);
        let jittered = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let range = base * self.jitter;
            (base + rng.gen_range(-range..range)).max(0.0)
        } else {
            base
        };
        Duration::from_secs_f64(jittered)
    }

    pub fn has_retries_remaining(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(500));
        assert_eq!(policy.factor, 2.0);
    }

    #[test]
    fn test_exponential_growth_without_jitter() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(2000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let delay = policy.delay_for_retry(1).as_secs_f64();
            assert!((0.4..=0.6).contains(&delay), "delay {delay} outside +-20%");
        }
    }

    #[test]
    fn test_retry_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.has_retries_remaining(0));
        assert!(policy.has_retries_remaining(2));
        assert!(!policy.has_retries_remaining(3));
    }
}
