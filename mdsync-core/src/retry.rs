//! Retry decisions for tasks that failed with a transient I/O error.

use std::time::Duration;

/// Retry policy for idempotent tasks.
///
/// Only idempotent tasks are ever retried; everything else halts the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for the exponential part of the delay.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Create a new retry policy.
    pub fn new(max_retries: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
        }
    }

    /// A policy that never retries.
    pub fn never() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// Decide whether a task may run again after `failed_attempts` failures.
    pub fn should_retry(&self, idempotent: bool, failed_attempts: u32) -> bool {
        idempotent && failed_attempts <= self.max_retries
    }

    /// Exponential delay before retry `attempt` (1-based), without jitter.
    ///
    /// Formula: min(max_backoff, initial_backoff * 2^(attempt - 1))
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Delay before retry `attempt` with up to 50% random jitter added.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let max_jitter_ms = (base.as_millis() as u64) / 2;
        if max_jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(random_u64() % (max_jitter_ms + 1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500), Duration::from_secs(30))
    }
}

/// Generate a random u64 for jitter.
fn random_u64() -> u64 {
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes).expect("getrandom failed");
    u64::from_le_bytes(bytes)
}
