//! Retry Backoff
//!
//! Exponential backoff for retryable bind failures: the delay doubles from
//! `initial` up to `max` and stays there. There is no attempt limit; a
//! waiting workload keeps retrying until it binds or is cancelled.
//!
//! All arithmetic saturates, so any attempt number yields a delay in
//! `[initial, max]`.

use std::time::Duration;

/// Backoff policy shared by every workload task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
        }
    }

    /// Delay before retry number `attempt` (1-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let initial_ms = u64::try_from(self.initial.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max.as_millis()).unwrap_or(u64::MAX);

        Duration::from_millis(initial_ms.saturating_mul(factor).min(max_ms))
    }
}
