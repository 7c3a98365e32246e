//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures (validation, identifiers,
/// strategy configuration). Store and scheduler failures belong to infra.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed member event).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. empty correlation id).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A strategy was configured outside its allowed bounds.
    ///
    /// Raised at provisioning time, never while handling events.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A group state transition was attempted from a terminal state.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    pub fn invalid_transition(msg: impl Into<String>) -> Self {
        Self::InvalidTransition(msg.into())
    }
}
