//! Retry policy with exponential backoff
//!
//! Retries are modeled as an explicit bounded state machine so the ceiling
//! and the backoff schedule are independently testable: each failed attempt
//! is evaluated to `Retry(n + 1)` or `GiveUp`, and only transient errors
//! ever re-enter the schedule.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum submission attempts per batch (first try included)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry (milliseconds)
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Ceiling for any single delay (milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after each attempt
    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,
    /// Add random jitter to each delay
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_multiplier(),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Backoff delay after the given failed attempt (1-based), without jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent as i32);
        Duration::from_millis((delay as u64).min(self.max_delay_ms))
    }
}

/// Where a batch goes after one submission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// The attempt succeeded
    Success,
    /// Transient failure with budget left; retry as attempt `n`
    Retry(u32),
    /// Non-transient failure, or the attempt ceiling is reached
    GiveUp,
}

/// Evaluates attempt outcomes against the configured ceiling
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a new retry policy
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Classify the outcome of attempt `attempt` (1-based).
    pub fn evaluate<T>(&self, attempt: u32, outcome: &Result<T>) -> Attempt {
        match outcome {
            Ok(_) => Attempt::Success,
            Err(err) if err.is_transient() && attempt < self.config.max_attempts => {
                Attempt::Retry(attempt + 1)
            }
            Err(_) => Attempt::GiveUp,
        }
    }

    /// Sleep out the backoff delay that follows failed attempt `attempt`.
    pub async fn wait_after(&self, attempt: u32) {
        tokio::time::sleep(self.jittered(self.config.delay_for_attempt(attempt))).await;
    }

    /// Maximum attempts per batch
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.config.jitter {
            return delay;
        }
        let jitter_factor = 0.1;
        let jitter = delay.as_millis() as f64 * jitter_factor * (rand::random::<f64>() - 0.5);
        Duration::from_millis((delay.as_millis() as f64 + jitter).max(0.0) as u64)
    }
}
