//! Exponential backoff for retrying transient failures.
//!
//! The accept loop sleeps for [`Backoff::next_delay`] after every temporary
//! error and calls [`Backoff::reset`] after the next success, so a burst of
//! failures waits 5ms, 10ms, 20ms, ... up to one second between attempts.

use std::time::Duration;

/// First delay after a failure (5ms).
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(5);

/// Upper bound for any single delay (1s).
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1);

/// Doubling backoff with a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Create a backoff starting at `initial` and capped at `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: Duration::ZERO,
        }
    }

    /// Advance to the next delay and return it.
    ///
    /// The first call after construction or [`reset`](Self::reset) returns the
    /// initial delay; every following call doubles it until the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        self.current = if self.current.is_zero() {
            self.initial
        } else {
            self.current.saturating_mul(2).min(self.max)
        };
        self.current
    }

    /// Forget accumulated failures.
    pub fn reset(&mut self) {
        self.current = Duration::ZERO;
    }

    /// The delay most recently returned, or zero after a reset.
    pub fn current(&self) -> Duration {
        self.current
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_DELAY, DEFAULT_MAX_DELAY)
    }
}
