//! Retry policy and backoff schedule

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Additional attempts after the first one
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Wait before the first retry
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(5);

/// Upper bound of any single wait
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Timeout of a single request attempt
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bounded retry policy with capped exponential backoff.
///
/// Durations are stored in milliseconds so the policy can be written in the
/// agent's YAML file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// First backoff, doubled on every retry
    pub initial_backoff_ms: u64,

    /// Cap applied to each backoff
    pub max_backoff_ms: u64,

    /// Timeout of one attempt
    pub attempt_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF.as_millis() as u64,
            max_backoff_ms: DEFAULT_MAX_BACKOFF.as_millis() as u64,
            attempt_timeout_ms: DEFAULT_ATTEMPT_TIMEOUT.as_millis() as u64,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff_ms = initial.as_millis() as u64;
        self.max_backoff_ms = max.as_millis() as u64;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Wait before retry number `retry` (zero-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.min(20);
        self.initial_backoff()
            .saturating_mul(factor)
            .min(self.max_backoff())
    }

    /// Every wait the policy would apply if all retries were used
    pub fn schedule(&self) -> Vec<Duration> {
        (0..self.max_retries).map(|n| self.backoff(n)).collect()
    }

    /// Whether the status code should be retried
    pub fn is_retryable_status(status: u16) -> bool {
        status == 429 || (500..=599).contains(&status)
    }
}
