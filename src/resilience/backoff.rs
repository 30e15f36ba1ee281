//! Exponential backoff with jitter.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::BackoffConfig;

/// Calculate the exponential backoff delay for `attempt`, without jitter.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let delay_ms = base_ms.saturating_mul(exponential_base);
    Duration::from_millis(delay_ms.min(max_ms))
}

/// Add 0 to 10% of `delay` as jitter.
pub fn with_jitter(delay: Duration) -> Duration {
    let delay_ms = delay.as_millis() as u64;
    let jitter_range = delay_ms / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };
    Duration::from_millis(delay_ms + jitter)
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
}

impl From<&BackoffConfig> for BackoffPolicy {
    fn from(config: &BackoffConfig) -> Self {
        Self {
            base_ms: config.base_ms,
            max_ms: config.max_ms,
        }
    }
}

/// Connection failure bookkeeping for one backend.
///
/// The delay never shrinks while failures keep coming; a success resets it.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    failed: bool,
    failures: u32,
    delay: Duration,
    last_failure: Option<Instant>,
    next_attempt: Option<Instant>,
}

impl RetryState {
    pub fn record_failure(&mut self, policy: BackoffPolicy, now: Instant) {
        self.failures = self.failures.saturating_add(1);
        let delay = calculate_backoff(self.failures, policy.base_ms, policy.max_ms);
        self.delay = self.delay.max(delay);
        self.failed = true;
        self.last_failure = Some(now);
        self.next_attempt = Some(now + with_jitter(self.delay));
    }

    pub fn record_success(&mut self) {
        *self = Self::default();
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.last_failure
    }

    /// Whether a new attempt may start at `now`.
    pub fn ready(&self, now: Instant) -> bool {
        self.next_attempt.map_or(true, |at| now >= at)
    }
}
