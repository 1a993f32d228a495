//! # Retry Policy
//!
//! Exponential backoff between reconciliation passes and the ceiling after
//! which a write is dead-lettered.

use crate::shared::LayerConfig;
use std::time::Duration;

/// Retry ceiling and backoff bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed attempts allowed; one more moves the write to dead letters
    pub ceiling: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            ceiling: crate::shared::config::DEFAULT_RETRY_CEILING,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300), // 5 minutes
        }
    }
}

impl RetryPolicy {
    pub fn new(ceiling: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            ceiling,
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &LayerConfig) -> Self {
        Self::new(config.retry_ceiling, config.retry_base_delay, config.retry_max_delay)
    }

    /// Whether a write that has failed `attempts` times must be dead-lettered
    pub fn exceeded(&self, attempts: u32) -> bool {
        attempts > self.ceiling
    }

    /// Delay before the pass following the `attempt`-th consecutive failure
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }
}
