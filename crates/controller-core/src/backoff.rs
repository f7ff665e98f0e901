//! # Exponential Backoff
//!
//! Capped exponential backoff shared by the informer (watch reconnects,
//! initial list retries) and the per-key rate limiter of the work queue.
//!
//! Sequence for a 5ms base and 1000s cap: 5ms, 10ms, 20ms, 40ms, ... 1000s (max).

use std::time::Duration;

/// Stateful exponential backoff calculator.
///
/// Each call to [`next_backoff`](Self::next_backoff) returns the current
/// delay and doubles it for the next call, never exceeding the maximum.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// First delay, also the value restored by `reset`
    min: Duration,
    /// Delay returned by the next call
    current: Duration,
    /// Upper bound
    max: Duration,
}

impl ExponentialBackoff {
    /// Creates a backoff starting at `min` and capped at `max`.
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            current: min.min(max),
            max,
        }
    }

    /// Returns the next delay and advances the sequence.
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        result
    }

    /// Restarts the sequence after a success.
    pub fn reset(&mut self) {
        self.current = self.min.min(self.max);
    }

    /// Stateless delay for the given zero-based attempt: `base * 2^attempt`, capped at `max`.
    #[must_use]
    pub fn for_attempt(attempt: u32, base: Duration, max: Duration) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        base.saturating_mul(factor).min(max)
    }
}
