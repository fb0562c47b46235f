//! Control-loop primitives.
//!
//! A control loop steers one target toward its optimal state (full value,
//! pressure at its floor) and keeps it there. This library tracks whether that
//! is actually happening:
//!
//! - **Distance**: how far the target is from optimal, a single number.
//! - **Convergence**: distance reaching zero within a tolerance.
//! - **Stall**: many cycles in a row without the distance improving.
//!
//! # Invariants
//!
//! - Trackers only observe; they never change what the loop plans
//! - Decisions are deterministic given the same sequence of observations

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convergence errors.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConvergenceError {
    /// No progress for too many cycles.
    #[error("no progress toward optimal state for {cycles} cycles (distance {distance:.4})")]
    Stalled { cycles: u32, distance: f64 },

    /// Tracker parameters out of range.
    #[error("invalid convergence config: {0}")]
    InvalidConfig(String),
}

/// Convergence status for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceStatus {
    /// Target is at its optimal state.
    Converged,

    /// Target is moving toward its optimal state.
    Converging,

    /// Target has stopped improving.
    Diverged,

    /// Not enough observations yet.
    Unknown,
}

impl ConvergenceStatus {
    /// Returns true if the target has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }

    /// Returns true if the target is still converging.
    pub fn is_converging(&self) -> bool {
        matches!(self, Self::Converging)
    }
}

/// Distance from optimal: missing value share plus excess pressure.
///
/// `pressure_weight` converts a pressure delta into value-ratio units.
pub fn distance(value_ratio: f64, pressure_delta: f64, pressure_weight: f64) -> f64 {
    let missing = (1.0 - value_ratio).max(0.0);
    let excess = pressure_delta.max(0.0) * pressure_weight;
    missing + excess
}

/// Tracks one target's distance across cycles.
#[derive(Debug, Clone)]
pub struct ConvergenceTracker {
    tolerance: f64,
    max_stalled: u32,
    best: Option<f64>,
    last: Option<f64>,
    stalled: u32,
}

impl ConvergenceTracker {
    /// Create a new tracker.
    pub fn new(tolerance: f64, max_stalled: u32) -> Result<Self, ConvergenceError> {
        if !(tolerance.is_finite() && tolerance >= 0.0) {
            return Err(ConvergenceError::InvalidConfig(format!(
                "tolerance must be finite and non-negative, got {tolerance}"
            )));
        }
        if max_stalled == 0 {
            return Err(ConvergenceError::InvalidConfig(
                "max stalled cycles must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            tolerance,
            max_stalled,
            best: None,
            last: None,
            stalled: 0,
        })
    }

    /// Record this cycle's distance and classify it.
    pub fn observe(&mut self, distance: f64) -> ConvergenceStatus {
        self.last = Some(distance);

        if distance <= self.tolerance {
            self.best = Some(distance);
            self.stalled = 0;
            return ConvergenceStatus::Converged;
        }

        let Some(best) = self.best else {
            self.best = Some(distance);
            return ConvergenceStatus::Unknown;
        };

        if distance < best - self.tolerance {
            self.best = Some(distance);
            self.stalled = 0;
            return ConvergenceStatus::Converging;
        }

        self.stalled += 1;
        if self.stalled >= self.max_stalled {
            ConvergenceStatus::Diverged
        } else {
            ConvergenceStatus::Converging
        }
    }

    /// Cycles since the distance last improved.
    pub fn stalled_cycles(&self) -> u32 {
        self.stalled
    }

    /// `Err(Stalled)` once the stall limit is reached.
    pub fn ensure_progress(&self) -> Result<(), ConvergenceError> {
        match self.last {
            Some(distance) if self.stalled >= self.max_stalled => Err(ConvergenceError::Stalled {
                cycles: self.stalled,
                distance,
            }),
            _ => Ok(()),
        }
    }

    /// Forget history, e.g. after switching strategy.
    pub fn reset(&mut self) {
        self.best = None;
        self.last = None;
        self.stalled = 0;
    }
}

impl Default for ConvergenceTracker {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_CONVERGENCE_TOLERANCE,
            max_stalled: DEFAULT_MAX_STALLED_CYCLES,
            best: None,
            last: None,
            stalled: 0,
        }
    }
}

/// Windowed counter of one loop's cycles that could not dispatch their batch.
#[derive(Debug, Clone)]
pub struct ShortfallTracker {
    /// Shortfalls tolerated inside one window.
    max_shortfalls: u32,

    /// Window duration.
    window: Duration,

    /// Count and first shortfall of the open window.
    open: Option<(u32, Instant)>,
}

impl ShortfallTracker {
    /// Create a new shortfall tracker.
    pub fn new(max_shortfalls: u32, window: Duration) -> Self {
        Self {
            max_shortfalls,
            window,
            open: None,
        }
    }

    /// Record a shortfall at `now`.
    ///
    /// Returns true once the limit is exceeded inside the window.
    pub fn record(&mut self, now: Instant) -> bool {
        let (count, first) = self.open.get_or_insert((0, now));

        if now.saturating_duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_shortfalls
    }

    /// Shortfalls in the open window.
    pub fn count(&self) -> u32 {
        self.open.map_or(0, |(count, _)| count)
    }

    /// Close the window (on a full dispatch).
    pub fn clear(&mut self) {
        self.open = None;
    }
}

impl Default for ShortfallTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SHORTFALLS, DEFAULT_SHORTFALL_WINDOW)
    }
}

/// Default distance at or below which a target counts as optimal.
pub const DEFAULT_CONVERGENCE_TOLERANCE: f64 = 1e-3;

/// Default cycles without progress before a target is reported as stalled.
pub const DEFAULT_MAX_STALLED_CYCLES: u32 = 20;

/// Default weight of one point of pressure delta in [`distance`].
pub const DEFAULT_PRESSURE_WEIGHT: f64 = 0.01;

/// Default shortfalls tolerated per window before escalating.
pub const DEFAULT_MAX_SHORTFALLS: u32 = 3;

/// Default shortfall window.
pub const DEFAULT_SHORTFALL_WINDOW: Duration = Duration::from_secs(10 * 60); // 10 minutes

/// Default floor on the control loop's sleep between cycles.
pub const DEFAULT_MIN_SLEEP: Duration = Duration::from_millis(200);

/// Default margin added after the slowest operation finishes.
pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_millis(400);
