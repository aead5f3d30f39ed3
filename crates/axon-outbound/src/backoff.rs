//! Exponential backoff policy for failing destinations.
//!
//! Pure arithmetic over a failure count; all timing state lives in the
//! destination ledger so it survives restarts. The schedule is
//! `base * 2^(failures - 1)` capped at `max`, with the shift and multiply
//! saturating so absurd failure counts cannot overflow.

use std::time::Duration;

use axon_common::config::DeliveryConfig;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub base: Duration,
    /// Upper bound on any computed delay.
    pub max: Duration,
    /// Consecutive failures at which a destination is blacklisted.
    pub blacklist_threshold: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            max: Duration::from_secs(3_600),
            blacklist_threshold: 16,
        }
    }
}

impl BackoffPolicy {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            base: Duration::from_secs(config.backoff_base_secs),
            max: Duration::from_secs(config.backoff_max_secs),
            blacklist_threshold: config.blacklist_threshold,
        }
    }

    /// Delay to wait after `failure_count` consecutive failures.
    pub fn delay_for(&self, failure_count: i64) -> chrono::Duration {
        if failure_count <= 0 {
            return chrono::Duration::zero();
        }
        let shift = u32::try_from(failure_count - 1).unwrap_or(u32::MAX);
        let multiplier = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        let delay_ms = base_ms.saturating_mul(multiplier).min(max_ms);
        chrono::Duration::milliseconds(delay_ms as i64)
    }

    pub fn should_blacklist(&self, failure_count: i64) -> bool {
        failure_count >= i64::from(self.blacklist_threshold)
    }
}

/// Whether a destination's retry time has passed. No recorded time means
/// it was never pushed back.
pub fn is_due(next_retry_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match next_retry_at {
        None => true,
        Some(at) => now >= at,
    }
}
