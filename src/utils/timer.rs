//! Timing helper for reconnection pacing.

use std::time::{Duration, Instant};

/// Restartable countdown used to pace peer reconnection attempts.
///
/// The owner restarts it with `reset()` and widens it with
/// `set_duration_ms()` to get exponential backoff behavior; `timed_out()`
/// reports whether the current countdown has elapsed.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    /// When the current countdown started.
    start: Instant,

    /// Length of the current countdown.
    duration: Duration,
}

impl Backoff {
    /// Creates a new backoff timer with the given initial duration, with the
    /// countdown running from now.
    pub(crate) fn new(duration_ms: u64) -> Self {
        Backoff {
            start: Instant::now(),
            duration: Duration::from_millis(duration_ms),
        }
    }

    /// True if the current countdown has fully elapsed.
    pub(crate) fn timed_out(&self) -> bool {
        self.start.elapsed() >= self.duration
    }

    /// Restarts the countdown from now, keeping the current duration.
    pub(crate) fn reset(&mut self) {
        self.start = Instant::now();
    }

    /// Updates the countdown duration (to take effect for the countdown
    /// currently running).
    pub(crate) fn set_duration_ms(&mut self, duration_ms: u64) {
        self.duration = Duration::from_millis(duration_ms);
    }

    /// Current countdown duration in millisecs.
    pub(crate) fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }
}
