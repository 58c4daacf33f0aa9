//! Backoff between transmission retries.
//!
//! Retries are not executed in place: a failed record goes back to its queue
//! carrying a `not_before` instant computed here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::policy::RetryStrategy;

/// Configuration for retry spacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the first retry, and the constant step for linear retries.
    pub base_delay_ms: u64,
    /// Cap for exponential growth.
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay_ms: base_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
            backoff_multiplier: 2.0,
        }
    }

    /// Set backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Delay before the next attempt, given how many retries were already used.
    ///
    /// `retry_count` is the count after the failure being handled, so the
    /// first retry uses `retry_count == 1`.
    pub fn delay_for(&self, strategy: RetryStrategy, retry_count: u32) -> Duration {
        match strategy {
            RetryStrategy::Immediate => Duration::ZERO,
            RetryStrategy::Linear => Duration::from_millis(self.base_delay_ms),
            RetryStrategy::Exponential => {
                let exponent = retry_count.saturating_sub(1).min(63) as i32;
                let delay = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
                let capped = delay.min(self.max_delay_ms as f64);
                Duration::from_millis(capped as u64)
            }
        }
    }

    /// Earliest instant the record may be dequeued again.
    pub fn not_before(
        &self,
        strategy: RetryStrategy,
        retry_count: u32,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let delay = self.delay_for(strategy, retry_count);
        if delay.is_zero() {
            return None;
        }
        chrono::Duration::from_std(delay).ok().map(|d| now + d)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(300))
    }
}
