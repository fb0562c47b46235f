//! ID parse errors.

use thiserror::Error;

/// Why a string is not a valid ID.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("ID cannot be empty")]
    Empty,

    /// Prefixed ID with someone else's prefix (or a run ID without `run-`).
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    #[error("ID missing underscore separator")]
    MissingSeparator,

    #[error("invalid ULID: {0}")]
    InvalidUlid(String),

    /// A host name contains characters that cannot appear in one.
    #[error("invalid host name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// A run ID is not a positive integer.
    #[error("invalid run ID: {0}")]
    InvalidRun(String),
}

impl IdError {
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// Wrong kind of ID rather than a malformed one.
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::InvalidPrefix { .. })
    }
}
