//! Retry policy with exponential backoff and full jitter.
//!
//! Applied uniformly by the executor around every stage invocation. Only
//! errors that report themselves retryable get another attempt.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::StageError;

/// Backoff parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    /// Full jitter: sleep a uniform random duration up to the computed delay.
    pub jitter: bool,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: true,
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: std::env::var("RETRY_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_attempts)
                .max(1),
            base_delay: std::env::var("RETRY_BASE_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: std::env::var("RETRY_MAX_DELAY_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_delay),
            ..defaults
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Upper bound of the delay after failed attempt `attempt` (1-based).
    pub fn ceiling_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling_for_attempt(attempt);
        if !self.jitter || ceiling.is_zero() {
            return ceiling;
        }
        let millis = ceiling.as_millis().min(u64::MAX as u128) as u64;
        Duration::from_millis(rand::rng().random_range(0..=millis))
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or runs out of attempts.
    pub async fn run<F, Fut, T>(&self, operation_name: &str, mut operation: F) -> Result<T, StageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        "{} attempt {}/{} failed, retrying in {:?}: {}",
                        operation_name, attempt, self.max_attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    debug!("{} failed after {} attempt(s): {}", operation_name, attempt, e);
                    return Err(e);
                }
            }
        }
    }
}

/// Suppresses log spam from a background loop failing repeatedly.
#[derive(Debug, Default)]
pub struct FailureTracker {
    consecutive_failures: u32,
    max_logged_failures: u32,
    suppressed: bool,
}

impl FailureTracker {
    pub fn new(max_logged_failures: u32) -> Self {
        Self {
            consecutive_failures: 0,
            max_logged_failures,
            suppressed: false,
        }
    }

    pub fn record_success(&mut self) {
        if self.consecutive_failures > 0 && self.suppressed {
            debug!(
                "Operation recovered after {} consecutive failures",
                self.consecutive_failures
            );
        }
        self.consecutive_failures = 0;
        self.suppressed = false;
    }

    /// Returns `true` if this failure should be logged.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;

        if self.consecutive_failures <= self.max_logged_failures {
            true
        } else if self.consecutive_failures == self.max_logged_failures + 1 {
            self.suppressed = true;
            warn!(
                "Suppressing further failure logs after {} consecutive failures",
                self.max_logged_failures
            );
            false
        } else {
            false
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgen_providers::ProviderError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_ceiling_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.ceiling_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.ceiling_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.ceiling_for_attempt(3), Duration::from_secs(8));
        assert_eq!(policy.ceiling_for_attempt(20), Duration::from_secs(300));
    }

    #[test]
    fn test_full_jitter_stays_under_ceiling() {
        let policy = RetryPolicy::default();
        for attempt in 1..6 {
            let delay = policy.delay_for_attempt(attempt);
            assert!(delay <= policy.ceiling_for_attempt(attempt));
        }
        let exact = policy.with_jitter(false);
        assert_eq!(exact.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let policy = RetryPolicy::default().with_base_delay(Duration::from_millis(1));
        let calls = AtomicU32::new(0);

        let result = policy
            .run("render", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(StageError::Provider(ProviderError::Unavailable("503".into())))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let policy = RetryPolicy::default().with_base_delay(Duration::from_millis(1));
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = policy
            .run("render", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StageError::Provider(ProviderError::Unavailable("503".into()))) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let policy = RetryPolicy::default().with_base_delay(Duration::from_millis(1));
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = policy
            .run("audio", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StageError::precondition("no rendered video")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_tracker_suppression() {
        let mut tracker = FailureTracker::new(2);
        assert!(tracker.record_failure());
        assert!(tracker.record_failure());
        assert!(!tracker.record_failure());
        assert!(!tracker.record_failure());

        tracker.record_success();
        assert_eq!(tracker.failure_count(), 0);
        assert!(tracker.record_failure());
    }
}
