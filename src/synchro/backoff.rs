//! Capped exponential backoff with jitter

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Delay sequence for one failing operation; `reset` after a success
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before attempt `attempt` (0-indexed), before jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let initial = self.config.initial_ms as f64;
        let max = self.config.max_ms as f64;
        let base = initial * self.config.multiplier.powi(attempt.min(64) as i32);
        Duration::from_millis(base.min(max) as u64)
    }

    /// Next delay; never above the configured ceiling
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay(self.attempt).as_millis() as f64;
        self.attempt = self.attempt.saturating_add(1);

        let jitter = self.config.jitter;
        let factor = if jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            1.0
        };
        let delay = (base * factor).min(self.config.max_ms as f64).max(0.0);
        Duration::from_millis(delay as u64)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
