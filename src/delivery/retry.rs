use std::time::Duration;

use crate::backoff::BackoffConfig;
use crate::config::RetryConfig;

/// When to try a failed delivery again, and when to stop.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    backoff: BackoffConfig,
    max_attempts: u32,
    max_elapsed: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(backoff: BackoffConfig, max_attempts: u32, max_elapsed: Option<Duration>) -> Self {
        Self {
            backoff,
            max_attempts,
            max_elapsed,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the next try after `failed_attempts` attempts have
    /// failed, `elapsed` after the first one. `None` means give up.
    pub fn next_delay(&self, failed_attempts: u32, elapsed: Duration) -> Option<Duration> {
        if failed_attempts >= self.max_attempts {
            return None;
        }
        if self.max_elapsed.is_some_and(|limit| elapsed >= limit) {
            return None;
        }
        Some(self.backoff.delay_for_attempt(failed_attempts))
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            BackoffConfig {
                initial_delay_ms: config.initial_delay_ms,
                max_delay_ms: config.max_delay_ms,
                multiplier: config.multiplier,
                jitter_factor: config.jitter_factor,
            },
            config.max_attempts,
            config.max_elapsed_seconds.map(Duration::from_secs),
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}
