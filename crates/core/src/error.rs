//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic failures only (validation, illegal transitions, unknown
/// kinds). Storage and network failures belong to the infra error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A status transition that the state machine forbids.
    #[error("illegal transition: {0}")]
    IllegalTransition(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A request or message kind this build does not know how to handle.
    #[error("unsupported kind: {0}")]
    UnsupportedKind(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn illegal_transition(msg: impl Into<String>) -> Self {
        Self::IllegalTransition(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn unsupported_kind(msg: impl Into<String>) -> Self {
        Self::UnsupportedKind(msg.into())
    }
}
