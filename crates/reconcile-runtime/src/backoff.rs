//! # Exponential Backoff
//!
//! Per-item exponential backoff for work queue retries.
//! Each failure doubles the delay, starting at `base` and capped at `max`.
//!
//! Defaults follow the usual controller work queue settings:
//! 5ms, 10ms, 20ms, 40ms, ... up to 1000s.

use std::time::Duration;

/// Default first retry delay
pub const DEFAULT_BASE: Duration = Duration::from_millis(5);

/// Default delay cap
pub const DEFAULT_MAX: Duration = Duration::from_secs(1000);

/// Exponential backoff calculator
///
/// Generates backoff durations that double on every call, capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// First delay (for reset)
    base: Duration,
    /// Delay returned by the next call
    current: Duration,
    /// Maximum delay
    max: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE, DEFAULT_MAX)
    }
}

impl ExponentialBackoff {
    /// Create a new exponential backoff starting at `base` and capped at `max`
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            current: base.min(max),
            max,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        self.current = self
            .current
            .checked_mul(2)
            .map_or(self.max, |next| next.min(self.max));
        result
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.current = self.base.min(self.max);
    }

    /// Calculate the backoff duration for a given error count (stateless)
    ///
    /// `error_count` is 0-indexed: the first failure waits `base`, the
    /// second `base * 2`, and so on. Overflow saturates at `max`.
    #[must_use]
    pub fn calculate_for_error_count(error_count: u32, base: Duration, max: Duration) -> Duration {
        2u32.checked_pow(error_count)
            .and_then(|factor| base.checked_mul(factor))
            .map_or(max, |delay| delay.min(max))
    }
}
