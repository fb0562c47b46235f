//! Error types for the controller.

use siphon_batch::{SchedulerError, SnapshotError};
use siphon_id::TargetId;
use thiserror::Error;

use crate::launcher::LaunchError;

/// Result type for controller operations.
pub type ControllerResult<T> = Result<T, ControllerError>;

/// Controller errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The snapshot source could not answer.
    #[error("state source unavailable: {0}")]
    SourceUnavailable(String),

    /// The snapshot source does not know the target.
    #[error("target not found: {0}")]
    TargetNotFound(TargetId),

    /// The snapshot source returned inconsistent values.
    #[error("invalid snapshot: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Launch boundary refused a job.
    #[error("launch failed: {0}")]
    Launch(#[from] LaunchError),

    /// Planning, timing or allocation error.
    #[error("scheduling error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Configuration out of range.
    #[error("invalid config: {0}")]
    Config(String),
}

impl ControllerError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ControllerError::SourceUnavailable(_) => "source_unavailable",
            ControllerError::TargetNotFound(_) => "target_not_found",
            ControllerError::Snapshot(_) => "invalid_snapshot",
            ControllerError::Launch(e) => e.reason_code(),
            ControllerError::Scheduler(e) => e.reason_code(),
            ControllerError::Config(_) => "invalid_config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes_pass_through() {
        let err: ControllerError = SchedulerError::TimeMiss {
            finish: 10,
            target: 5,
        }
        .into();
        assert_eq!(err.reason_code(), "time_miss");

        let err = ControllerError::TargetNotFound(TargetId::parse("gone").unwrap());
        assert_eq!(err.reason_code(), "target_not_found");
        assert_eq!(err.to_string(), "target not found: gone");
    }
}
