//! Bounded exponential backoff for retryable provider failures.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::duration_millis;

/// Default number of provider attempts (first try included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);
/// Default upper bound on a single backoff delay (before jitter).
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(2);

/// Retry policy for provider calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first; `1` disables retries.
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(with = "duration_millis", rename = "base_delay_ms")]
    pub base_delay: Duration,
    /// Cap on the exponential delay.
    #[serde(with = "duration_millis", rename = "max_delay_ms")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Sets the attempt budget (at least one).
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = if max_attempts == 0 { 1 } else { max_attempts };
        self
    }

    /// Sets base and maximum delays.
    #[must_use]
    pub const fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    /// Returns true if another attempt follows `attempt` (1-based).
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Backoff after failed attempt `attempt` (1-based), without jitter.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let mut delay = self.base_delay;
        for _ in 1..attempt {
            delay = delay.saturating_mul(2);
            if delay >= self.max_delay {
                break;
            }
        }
        delay.min(self.max_delay)
    }

    /// Backoff plus uniform jitter of up to half the delay.
    #[must_use]
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        let half_ms = u64::try_from(delay.as_millis() / 2).unwrap_or(u64::MAX);
        if half_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..=half_ms))
    }
}
