//! Bounded exponential backoff with jitter

use std::time::Duration;

use crate::config::SubmissionConfig;

/// Retry schedule shared by transmission and issuance retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Attempt ceiling, counting the first try
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
            max,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    ///
    /// `min(base * 2^(attempt-1), max)` plus up to 10% jitter, never above `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        let shift = attempt.saturating_sub(1).min(32);
        let delay = base_ms.saturating_mul(1u64 << shift).min(max_ms);

        let jitter = delay / 10;
        let jittered = delay + rand::random::<u64>() % jitter.max(1);
        Duration::from_millis(jittered.min(max_ms))
    }

    /// Whether another attempt is allowed after `attempts` tries
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&SubmissionConfig::default())
    }
}

impl From<&SubmissionConfig> for BackoffPolicy {
    fn from(config: &SubmissionConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
        )
    }
}
