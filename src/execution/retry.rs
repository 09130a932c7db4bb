use std::time::Duration;

use crate::shared::config::EngineConfig;

/// Hard ceiling on attempts for a retryable step.
pub const MAX_ATTEMPTS: u32 = 3;

/// Exponential backoff: `base_delay`, then doubling, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Attempts a step gets: one if it is not retryable, else `min(3, max_attempts)`.
    pub fn attempts(&self, retryable: bool) -> u32 {
        if retryable {
            self.max_attempts.clamp(1, MAX_ATTEMPTS)
        } else {
            1
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` is the 1-based attempt that failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}
