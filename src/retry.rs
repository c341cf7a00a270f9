//! Requeue backoff with exponential growth and jitter.
//!
//! Nothing in the operator retries in-process. A failed reconcile returns
//! its error to the controller, and the error policy asks [`BackoffConfig`]
//! how long to wait before the object is reconciled again.
//!
//! # Example
//!
//! ```ignore
//! use iam_role_operator::retry::BackoffConfig;
//!
//! let backoff = BackoffConfig::default();
//! let delay = backoff.delay_for(3);
//! ```

use std::time::Duration;

use rand::Rng;

/// Configuration for requeue delays after transient failures.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Un-jittered delay after `failures` consecutive failures (1-based)
    pub fn base_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Jittered delay after `failures` consecutive failures, capped at `max_delay`
    pub fn delay_for(&self, failures: u32) -> Duration {
        // Add jitter: 0.5x to 1.5x of the delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = self.base_delay(failures).as_secs_f64() * jitter;
        Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64()))
    }
}
