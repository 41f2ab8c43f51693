use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential reconnection backoff: `delay = initial * multiplier^(attempt - 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct ReconnectionBackoffPolicy {
    pub backoff_ms_initial: u64,
    pub backoff_multiplier: u32,
    /// Reconnect attempts allowed before giving up, `0` disables reconnection.
    pub max_attempts: u32,
    /// Upper bound applied to any single delay.
    pub backoff_ms_max: u64,
}

impl Default for ReconnectionBackoffPolicy {
    fn default() -> Self {
        Self {
            backoff_ms_initial: 1_000,
            backoff_multiplier: 2,
            max_attempts: 5,
            backoff_ms_max: 60_000,
        }
    }
}

impl ReconnectionBackoffPolicy {
    /// Delay before reconnect `attempt` (1-based), `None` once the attempt cap is exceeded.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }

        let factor = u64::from(self.backoff_multiplier.max(1)).saturating_pow(attempt - 1);
        let millis = self
            .backoff_ms_initial
            .saturating_mul(factor)
            .min(self.backoff_ms_max);

        Some(Duration::from_millis(millis))
    }
}
