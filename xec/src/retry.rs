//! # Retry Policy
//!
//! Retries a fallible async operation with exponential backoff (§4.9), grounded on
//! the pack's `retry::RetryConfig`/`execute_with_retry`, extended with an
//! `is_retryable` predicate hook and an `on_retry` observer callback.
//!
//! A `retry`-wrapped [`crate::handle::ProcessHandle`] consults the cache only on the
//! outer call: once inside the retry loop, a cached command still runs the real
//! adapter every attempt (§4 Open Questions, outer-only resolution).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::Error;

/// Backoff shape applied between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// `initial_delay * backoff_factor ^ attempt`, capped at `max_delay`.
    #[default]
    ExponentialBackoff,
    /// `initial_delay` for every attempt.
    FixedDelay,
    /// No delay between attempts.
    Immediate,
}

/// A predicate deciding whether a given error should trigger another attempt.
pub type RetryPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Called before each retry sleep with the 1-indexed attempt number (§8 scenario 4:
/// `(1, result, ~10ms)`, `(2, result, ~20ms)`) and the error that triggered it.
pub type RetryObserver = Arc<dyn Fn(u32, &Error) + Send + Sync>;

/// Configuration for [`retry`].
#[derive(Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub policy: RetryPolicy,
    /// §3 Retry Plan's `jitterFraction`: sample a uniform fraction within
    /// `[-jitter_fraction, +jitter_fraction] * delay` and add it to the computed
    /// backoff. `0.0` (the default) disables jitter entirely.
    pub jitter_fraction: f64,
    is_retryable: Option<RetryPredicate>,
    on_retry: Option<RetryObserver>,
}

impl std::fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_retries", &self.max_retries)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_factor", &self.backoff_factor)
            .field("policy", &self.policy)
            .field("jitter_fraction", &self.jitter_fraction)
            .field("is_retryable", &self.is_retryable.is_some())
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            policy: RetryPolicy::ExponentialBackoff,
            jitter_fraction: 0.0,
            is_retryable: None,
            on_retry: None,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the jitter fraction (§3 Retry Plan's `jitterFraction`). `0.0` disables
    /// jitter; `0.5` samples within `±50%` of the computed delay, etc.
    pub fn jitter_fraction(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction;
        self
    }

    /// Overrides the default retryable-error classification ([`Error::is_retryable_default`]).
    pub fn is_retryable(mut self, predicate: impl Fn(&Error) -> bool + Send + Sync + 'static) -> Self {
        self.is_retryable = Some(Arc::new(predicate));
        self
    }

    /// Registers a callback invoked before each retry sleep.
    pub fn on_retry(mut self, observer: impl Fn(u32, &Error) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(observer));
        self
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = match self.policy {
            RetryPolicy::ExponentialBackoff => {
                let multiplier = self.backoff_factor.powi(attempt as i32);
                let delay_ms = self.initial_delay.as_millis() as f64 * multiplier;
                Duration::from_millis(delay_ms as u64)
            }
            RetryPolicy::FixedDelay => self.initial_delay,
            RetryPolicy::Immediate => Duration::ZERO,
        };
        std::cmp::min(delay, self.max_delay)
    }

    fn delay_for_attempt_with_jitter(&self, attempt: u32) -> Duration {
        let base_delay = self.delay_for_attempt(attempt);
        if self.jitter_fraction <= 0.0 {
            return base_delay;
        }
        let base_ms = base_delay.as_millis() as f64;
        let jitter_range = base_ms * self.jitter_fraction;
        let jitter = rand::rng().random_range(-jitter_range..jitter_range);
        Duration::from_millis((base_ms + jitter).max(0.0) as u64)
    }

    fn should_retry(&self, error: &Error) -> bool {
        match &self.is_retryable {
            Some(predicate) => predicate(error),
            None => error.is_retryable_default(),
        }
    }
}

/// Runs `operation` until it succeeds, exhausts `config.max_retries`, or produces an
/// error `config` classifies as non-retryable — whichever comes first.
pub async fn retry<F, Fut, T>(config: &RetryConfig, operation: F) -> Result<T, Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let total_attempts = 1 + config.max_retries;
    let mut last_error = None;

    for attempt in 0..total_attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !config.should_retry(&err) {
                    return Err(err);
                }
                let retries_remaining = total_attempts.saturating_sub(attempt + 1);
                if retries_remaining == 0 {
                    last_error = Some(err);
                    break;
                }
                if let Some(observer) = &config.on_retry {
                    observer(attempt + 1, &err);
                }
                let delay = if config.jitter_fraction > 0.0 {
                    config.delay_for_attempt_with_jitter(attempt)
                } else {
                    config.delay_for_attempt(attempt)
                };
                tracing::debug!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
                tokio::time::sleep(delay).await;
                last_error = Some(err);
            }
        }
    }

    Err(last_error.expect("loop always runs at least one attempt"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retrying_when_first_attempt_works() {
        let config = RetryConfig::new();
        let calls = AtomicU32::new(0);
        let result = retry(&config, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Error>(42)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_up_to_max_then_returns_last_error() {
        let config = RetryConfig::new()
            .max_retries(2)
            .initial_delay(Duration::from_millis(1))
            .is_retryable(|_| true);
        let calls = AtomicU32::new(0);
        let result: Result<(), Error> = retry(&config, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Timeout {
                command: "flaky".to_string(),
                timeout_ms: 1,
            })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_fails_fast() {
        let config = RetryConfig::new().max_retries(5).is_retryable(|_| false);
        let calls = AtomicU32::new(0);
        let result: Result<(), Error> = retry(&config, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::AdapterFailure {
                adapter: "local".to_string(),
                operation: "execute".to_string(),
                reason: "bad config".to_string(),
            })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn jitter_fraction_bounds_the_sampled_delay() {
        let config = RetryConfig::new()
            .initial_delay(Duration::from_millis(100))
            .policy(RetryPolicy::FixedDelay)
            .jitter_fraction(0.25);
        for attempt in 0..20 {
            let delay = config.delay_for_attempt_with_jitter(attempt);
            let ms = delay.as_millis() as f64;
            assert!((75.0..=125.0).contains(&ms), "delay {ms}ms outside ±25% of 100ms");
        }
    }

    #[test]
    fn zero_jitter_fraction_disables_jitter() {
        let config = RetryConfig::new()
            .initial_delay(Duration::from_millis(100))
            .policy(RetryPolicy::FixedDelay)
            .jitter_fraction(0.0);
        assert_eq!(config.delay_for_attempt_with_jitter(0), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn on_retry_observer_sees_every_retry() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let observed = seen.clone();
        let config = RetryConfig::new()
            .max_retries(2)
            .initial_delay(Duration::from_millis(1))
            .is_retryable(|_| true)
            .on_retry(move |attempt, _| observed.lock().unwrap().push(attempt));
        let _: Result<(), Error> = retry(&config, || async {
            Err(Error::Timeout {
                command: "flaky".to_string(),
                timeout_ms: 1,
            })
        })
        .await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }
}
