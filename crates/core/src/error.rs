//! Core error model.

use thiserror::Error;

use crate::status::RunStatus;

/// Result type used across the core crate.
pub type CoreResult<T> = Result<T, CoreError>;

/// Core-level error.
///
/// Deterministic failures only (validation, identifiers, state machine).
/// IO failures belong to the infrastructure crates.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A status transition was rejected by the state machine.
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    /// An unknown status string was supplied.
    #[error("unknown status: {0}")]
    UnknownStatus(String),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
