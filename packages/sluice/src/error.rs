//! Structured error types for the job server core.
//!
//! `SluiceError` provides pattern-matchable errors instead of generic boxed
//! errors. `JobError` is the serializable failure record stored on a child
//! promise when a worker reports an execution failure.
//!
//! # The Error Boundary Rule
//!
//! > **No opaque error ever crosses the crate boundary.**
//!
//! - `SluiceError` is the only error type returned from public operations
//! - `JobError` is the only error shape persisted inside promise payloads
//!
//! Cancellation is expected control flow, not a fault: `SluiceError::Cancelled`
//! carries the identity of the token that triggered it so callers can
//! distinguish their own cancellation from a foreign one.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Job Failures
// =============================================================================

/// Coarse category for a job failure.
///
/// This is intentionally coarse-grained: it is used for policy decisions
/// and for observability dimensions, never for transporting details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobErrorKind {
    /// The worker ran the job and it failed.
    Execution,
    /// The job exceeded its configured time budget.
    Timeout,
    /// The job was intentionally cancelled. Control flow, not a fault.
    Cancelled,
    /// Something inside the server misbehaved while handling the job.
    Internal,
}

/// Serializable failure record for a job.
///
/// Stored on the child promise when a worker surfaces an error, and used to
/// complete a macro job's result list when its expansion fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind:?}: {message}")]
pub struct JobError {
    /// Coarse failure category used by policy and observability.
    pub kind: JobErrorKind,
    /// Human-readable summary safe to display in normal logs.
    pub message: String,
    /// Identity of the cancellation token that triggered this failure,
    /// when `kind` is [`JobErrorKind::Cancelled`].
    pub token_id: Option<u64>,
}

impl JobError {
    /// Create a failure record with the given category and message.
    pub fn new(kind: JobErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            token_id: None,
        }
    }

    /// Create a cancellation record tagged with the triggering token identity.
    pub fn cancelled(token_id: Option<u64>) -> Self {
        Self {
            kind: JobErrorKind::Cancelled,
            message: "job was cancelled".to_string(),
            token_id,
        }
    }

    /// Whether this failure represents cancellation rather than a fault.
    pub fn is_cancellation(&self) -> bool {
        self.kind == JobErrorKind::Cancelled
    }
}

// =============================================================================
// Core Errors
// =============================================================================

/// Errors surfaced by the job server core.
#[derive(Debug, Error)]
pub enum SluiceError {
    /// Invalid promise id, unknown queue, or invalid configuration.
    ///
    /// Reported to the caller; never logged at error level.
    #[error("invalid input: {0}")]
    UserInput(String),

    /// Payload exceeds the persistence cap. Non-fatal: the promise stays
    /// memory-resident.
    #[error("payload of {len} bytes exceeds the {max}-byte persistence cap")]
    OversizePromise { len: usize, max: usize },

    /// Blob store read/write failure. Logged; the promise is treated as
    /// memory-only (writes) or absent (reads).
    #[error("blob store failure: {0}")]
    Persistence(String),

    /// A double-enumeration attempt on a macro job message, or a rented
    /// cancellation source returned after it was triggered. Loud on
    /// purpose: this must never happen in correct code.
    #[error("scheduling invariant violated: {0}")]
    SchedulingInvariant(&'static str),

    /// Expected control flow: a job was cancelled. Carries the identity of
    /// the triggering token so local cancellation can be told from foreign.
    #[error("cancelled by token {token_id}")]
    Cancelled { token_id: u64 },

    /// A worker-surfaced execution failure.
    #[error(transparent)]
    Execution(#[from] JobError),
}

impl SluiceError {
    /// Shorthand for a [`SluiceError::UserInput`].
    pub fn user_input(message: impl Into<String>) -> Self {
        Self::UserInput(message.into())
    }

    /// Whether this error represents cancellation rather than a fault.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
            || matches!(self, Self::Execution(e) if e.is_cancellation())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_error_display_includes_kind_and_message() {
        let err = JobError::new(JobErrorKind::Timeout, "took too long");
        let rendered = err.to_string();
        assert!(rendered.contains("Timeout"));
        assert!(rendered.contains("took too long"));
    }

    #[test]
    fn job_error_serde_round_trip() {
        let err = JobError::cancelled(Some(7));
        let json = serde_json::to_string(&err).unwrap();
        let back: JobError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
        assert!(back.is_cancellation());
        assert_eq!(back.token_id, Some(7));
    }

    #[test]
    fn cancellation_detection_covers_both_layers() {
        assert!(SluiceError::Cancelled { token_id: 1 }.is_cancellation());
        assert!(SluiceError::Execution(JobError::cancelled(None)).is_cancellation());
        assert!(!SluiceError::user_input("nope").is_cancellation());
    }
}
