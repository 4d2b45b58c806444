//! # Backoff Calculator
//!
//! Exponential backoff with optional additive jitter and a hard cap. Used by the
//! resilient executor between attempts, by `retry_with_backoff`, and by the job
//! queue when rescheduling a failed job.
//!
//! Delays follow `base * multiplier^attempt`, plus up to `max_jitter` of that
//! value, capped at `max_delay`. Jitter is a fraction of the current step, so the
//! sequence stays non-decreasing as long as `max_jitter < multiplier - 1`.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for backoff calculation behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Exponential multiplier (default: 2.0)
    pub multiplier: f64,
    /// Whether to add jitter to prevent thundering herd
    pub jitter_enabled: bool,
    /// Maximum jitter as a fraction of the computed delay (0.0 to 1.0)
    pub max_jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_enabled: true,
            max_jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    pub fn without_jitter(mut self) -> Self {
        self.jitter_enabled = false;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.base_delay.is_zero() {
            return Err("base_delay must be greater than 0".to_string());
        }
        if self.max_delay < self.base_delay {
            return Err("max_delay must be >= base_delay".to_string());
        }
        if self.multiplier < 1.0 {
            return Err("multiplier must be >= 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.max_jitter) {
            return Err("max_jitter must be between 0.0 and 1.0".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct BackoffCalculator {
    config: BackoffConfig,
}

impl BackoffCalculator {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Deterministic part of the delay for a zero-based attempt number
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.config.base_delay.as_millis() as f64;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw_ms = base_ms * self.config.multiplier.powi(exponent);
        let capped_ms = raw_ms.min(self.config.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Delay to wait after the given zero-based attempt failed
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for_attempt(attempt);
        let with_jitter = if self.config.jitter_enabled && self.config.max_jitter > 0.0 {
            let fraction = rand::thread_rng().gen_range(0.0..=self.config.max_jitter);
            base + base.mul_f64(fraction)
        } else {
            base
        };
        with_jitter.min(self.config.max_delay)
    }

    /// Like [`Self::delay_for_attempt`] but honoring a server-requested delay
    /// (Retry-After) when it asks for longer, still bounded by the cap.
    pub fn delay_with_hint(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let computed = self.delay_for_attempt(attempt);
        match retry_after {
            Some(requested) if requested > computed => requested.min(self.config.max_delay),
            _ => computed,
        }
    }
}

impl Default for BackoffCalculator {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
