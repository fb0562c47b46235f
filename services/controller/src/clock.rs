//! Shared clock.
//!
//! Every loop and job reads time from one [`Clock`] so that "same tick" means
//! the same thing everywhere.

use siphon_batch::Millis;
use tokio::time::Instant;

/// Millisecond clock.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Millis;
}

/// Wall clock, milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Millis {
        chrono::Utc::now().timestamp_millis().max(0) as Millis
    }
}

/// Monotonic clock on tokio's timer.
///
/// Follows tokio's paused clock in tests, so `tokio::time::sleep` and
/// `now_ms` stay consistent.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
    base: Millis,
}

impl MonotonicClock {
    /// Starts counting at `base` milliseconds.
    pub fn starting_at(base: Millis) -> Self {
        Self {
            origin: Instant::now(),
            base,
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::starting_at(0)
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> Millis {
        self.base + self.origin.elapsed().as_millis() as Millis
    }
}
