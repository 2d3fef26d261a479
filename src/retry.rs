//! Bounded exponential backoff with jitter.
//!
//! Used for single checkpoint appends only. Lifecycle writes are never retried
//! here; they propagate to the caller.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy for transient store failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    /// Default: 3
    pub max_attempts: u32,

    /// Delay before the first retry.
    /// Default: 100 ms
    pub base_delay_ms: u64,

    /// Upper bound on the exponential part of the delay.
    /// Default: 2000 ms
    pub max_delay_ms: u64,

    /// Add up to 50% random jitter on top of each delay.
    /// Default: true
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// No retries: the first failure is final.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based): base, 2x base, 4x base...
    /// capped at `max_delay_ms`, plus jitter when enabled.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64 << retry.min(16))
            .min(self.max_delay_ms);
        let jitter = if self.jitter && exp > 0 {
            rand::thread_rng().gen_range(0..=exp / 2)
        } else {
            0
        };
        Duration::from_millis(exp + jitter)
    }
}
