//! Error taxonomy for the platform
//!
//! Every failure maps to one policy: retry, dead-letter, reject at ingress,
//! silently discard and count, exit the component, or unwind as a non-error.
//! Workers branch on [`TagmineError::policy`] instead of matching variants.

use thiserror::Error;

/// Result type used across the workspace
pub type TagmineResult<T> = Result<T, TagmineError>;

/// Platform error taxonomy
#[derive(Error, Debug)]
pub enum TagmineError {
    /// Adapter timeout, broker unreachable, store unavailable
    #[error("transient remote failure: {0}")]
    TransientRemote(String),

    /// Undecodable message or persistently unresolvable reference
    #[error("poison message: {0}")]
    Poison(String),

    /// Missing required field or invariant breach at ingress
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// Stale write such as a timestamp older than the stored one
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// Persistence failure in the metadata or time-series store
    #[error("storage error: {0}")]
    Storage(String),

    /// Bad configuration; the affected component must not start
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Unrecoverable authentication failure against a source system
    #[error("authentication failure: {0}")]
    Authentication(String),

    /// Entity lookup failed
    #[error("{0} not found")]
    NotFound(String),

    /// Illegal lifecycle transition
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Deadline exceeded or shutdown requested; unwind without commit
    #[error("operation cancelled")]
    Cancelled,
}

/// What a worker should do with a failed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Exponential backoff with jitter, circuit-break after repeats
    Retry,
    /// Route to the DLQ topic and commit the offset
    DeadLetter,
    /// Reject at ingress; do not publish downstream
    Reject,
    /// Drop silently and increment a counter
    Discard,
    /// The affected component exits; peers keep running
    Exit,
    /// Not an error; unwind to a safe offset
    Unwind,
}

impl TagmineError {
    pub fn policy(&self) -> FailurePolicy {
        match self {
            TagmineError::TransientRemote(_) | TagmineError::Storage(_) => FailurePolicy::Retry,
            TagmineError::Poison(_) => FailurePolicy::DeadLetter,
            TagmineError::ContractViolation(_)
            | TagmineError::NotFound(_)
            | TagmineError::InvalidTransition { .. } => FailurePolicy::Reject,
            TagmineError::Integrity(_) => FailurePolicy::Discard,
            TagmineError::Configuration(_) | TagmineError::Authentication(_) => FailurePolicy::Exit,
            TagmineError::Cancelled => FailurePolicy::Unwind,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.policy() == FailurePolicy::Retry
    }
}
