//! Error types for planning, timing and allocation.

use thiserror::Error;

use crate::Millis;

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors raised by the scheduling core.
///
/// Only `WrongType`, `TimeMiss`, `InsufficientCapacity` and `InvalidConfig`
/// ever leave this crate. `UndefinedYield` is produced by analyzer guards and
/// recovered inside the planner.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchedulerError {
    /// Operation kind outside {extract, replenish, counter-pressure}.
    #[error("unknown operation kind '{0}'")]
    WrongType(String),

    /// Predicted finish overshot the deadline; the job must not fire late.
    #[error("predicted finish {finish}ms overshoots target finish {target}ms")]
    TimeMiss { finish: Millis, target: Millis },

    /// The pool cannot hold the ideal batch.
    #[error("insufficient capacity: batch needs {required:.2}, pool has {available:.2} free")]
    InsufficientCapacity { required: f64, available: f64 },

    /// A planner formula input is degenerate.
    #[error("undefined yield: {0}")]
    UndefinedYield(String),

    /// Scheduler configuration is inconsistent.
    #[error("invalid scheduler config: {0}")]
    InvalidConfig(String),
}

impl SchedulerError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SchedulerError::WrongType(_) => "wrong_type",
            SchedulerError::TimeMiss { .. } => "time_miss",
            SchedulerError::InsufficientCapacity { .. } => "insufficient_capacity",
            SchedulerError::UndefinedYield(_) => "undefined_yield",
            SchedulerError::InvalidConfig(_) => "invalid_config",
        }
    }
}

/// Snapshot constructor validation failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SnapshotError {
    /// Pressure reported below its own floor.
    #[error("pressure {pressure} below floor {floor}")]
    PressureBelowFloor { pressure: f64, floor: f64 },

    /// Value outside `[0, max]`.
    #[error("value {value} outside [0, {max}]")]
    ValueOutOfRange { value: f64, max: f64 },

    /// Committed capacity larger than the worker's total.
    #[error("committed capacity {committed} exceeds total {total}")]
    CommittedExceedsTotal { committed: f64, total: f64 },

    /// NaN, infinite or negative where a magnitude is required.
    #[error("field '{0}' must be finite and non-negative")]
    NotFinite(&'static str),
}

/// Reject NaN, infinities and negative magnitudes.
pub(crate) fn ensure_magnitude(field: &'static str, v: f64) -> Result<f64, SnapshotError> {
    if v.is_finite() && v >= 0.0 {
        Ok(v)
    } else {
        Err(SnapshotError::NotFinite(field))
    }
}
