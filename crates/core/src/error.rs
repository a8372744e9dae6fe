//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (illegal
/// transitions, booking conflicts, invariants). Storage and delivery concerns
/// belong to the infrastructure layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input, unknown state name).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested case or related entity was not found.
    #[error("not found")]
    NotFound,

    /// The requested edge is not part of the workflow's transition graph.
    #[error("invalid {workflow} transition: {from} -> {to}")]
    InvalidTransition {
        workflow: String,
        from: String,
        to: String,
    },

    /// An active appointment already occupies the requested slot.
    #[error("conflicting appointment: {0}")]
    ConflictingAppointment(String),

    /// A conflict with the current case state (e.g. fee already paid).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }

    pub fn invalid_transition(
        workflow: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self::InvalidTransition {
            workflow: workflow.into(),
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn conflicting_appointment(msg: impl Into<String>) -> Self {
        Self::ConflictingAppointment(msg.into())
    }
}
