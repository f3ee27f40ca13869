//! Reconnect policy with exponential backoff.
//!
//! The delay for attempt `n` (0-based) is `base_delay * 2^n`, capped at
//! `max_delay`, plus up to `jitter_factor * delay` of random jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How the supervisor retries after a recoverable disconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Base delay for exponential backoff (milliseconds).
    pub base_delay_ms: u64,
    /// Maximum delay cap (milliseconds).
    pub max_delay_ms: u64,
    /// Jitter factor (0.0 to 1.0).
    pub jitter_factor: f64,
    /// Consecutive failed attempts before giving up. `None` retries forever.
    pub max_retries: Option<u32>,
    /// Consecutive failed attempts after which every failure is logged as an error.
    pub alert_after: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_factor: 0.25,
            max_retries: None,
            alert_after: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Reconnect immediately and forever.
    pub fn immediate() -> Self {
        Self {
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter_factor: 0.0,
            ..Self::default()
        }
    }

    /// Delay before the given (0-based) reconnect attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let capped_delay_ms = self.capped_delay_ms(attempt);

        let jitter_range = (capped_delay_ms as f64 * self.jitter_factor) as u64;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..=jitter_range)
        } else {
            0
        };

        Duration::from_millis(capped_delay_ms.saturating_add(jitter))
    }

    fn capped_delay_ms(&self, attempt: u32) -> u64 {
        let exp_delay_ms = self
            .base_delay_ms
            .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
        exp_delay_ms.min(self.max_delay_ms)
    }

    /// Whether `failures` consecutive failures exhaust the retry budget.
    pub fn is_exhausted(&self, failures: u32) -> bool {
        self.max_retries.is_some_and(|max| failures > max)
    }

    /// Whether `failures` consecutive failures warrant operator attention.
    pub fn should_alert(&self, failures: u32) -> bool {
        self.alert_after > 0 && failures >= self.alert_after
    }
}
