/// Retry policy for transient fetch failures
use std::time::Duration;

use crate::types::SyncSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            base,
            cap,
        }
    }

    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self::new(
            settings.max_attempts,
            Duration::from_millis(settings.backoff_base_ms),
            Duration::from_millis(settings.backoff_cap_ms),
        )
    }

    /// Delay after the `attempt`-th failure (1-based): base × 2^(attempt-1),
    /// capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.base.saturating_mul(1 << exponent).min(self.cap)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
