//! Exponential backoff shared by the poll loops and the delivery retry policy

use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry, in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
    /// Multiplier for exponential growth
    pub multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Delay to wait after the `attempt`-th consecutive failure (1-based).
    ///
    /// Stateless, so the same curve can be evaluated from a persisted attempt
    /// counter instead of a live [`ExponentialBackoff`].
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let base = self.initial_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = base.min(self.max_delay_ms as f64);
        Duration::from_millis(self.jittered(capped))
    }

    fn jittered(&self, delay_ms: f64) -> u64 {
        if self.jitter_factor > 0.0 && delay_ms > 0.0 {
            let jitter_range = delay_ms * self.jitter_factor.min(1.0);
            let jitter = rand::rng().random_range(-jitter_range..jitter_range);
            (delay_ms + jitter).max(1.0) as u64
        } else {
            delay_ms.max(0.0) as u64
        }
    }
}

/// Stateful backoff for loops that retry the same operation until it succeeds
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::with_config(BackoffConfig::default())
    }

    pub fn with_config(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Record one more failure and return how long to wait before the next try
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.config.delay_for_attempt(self.attempt)
    }

    /// Reset after a successful operation
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new()
    }
}
