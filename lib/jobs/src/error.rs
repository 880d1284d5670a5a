//! Error types for the jobs crate.
//!
//! - `JobError`: job lifecycle and spec failures
//! - `HandlerError`: returned by job handlers, split into retryable and
//!   permanent failures
//! - `FinalizerError`: finalizer guard failures
//! - `DispatchError`: handler registry and notify path; lifted into a
//!   rootcause `Report` at the public boundary

use crate::job::{JobState, JobType};
use dockyard_core::ObjectRef;
use dockyard_store::StoreError;
use std::fmt;

/// Errors from job lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// The store rejected an operation.
    Store(StoreError),
    /// The requested transition would move the job backwards.
    InvalidTransition {
        job: ObjectRef,
        from: JobState,
        to: JobState,
    },
    /// The job spec is malformed.
    InvalidSpec { reason: String },
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "job store error: {e}"),
            Self::InvalidTransition { job, from, to } => {
                write!(f, "invalid transition for job {job}: {from} -> {to}")
            }
            Self::InvalidSpec { reason } => write!(f, "invalid job spec: {reason}"),
        }
    }
}

impl std::error::Error for JobError {}

impl From<StoreError> for JobError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// Errors returned by job handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// A retryable failure (network, IO). The job keeps its state.
    Transient { message: String },
    /// A failure retrying cannot fix. The job moves to `Failed`.
    Permanent { message: String },
}

impl HandlerError {
    /// Shorthand for a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Shorthand for a permanent error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    /// Returns the error text without the kind prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Transient { message } | Self::Permanent { message } => message,
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient { message } => write!(f, "transient handler error: {message}"),
            Self::Permanent { message } => write!(f, "permanent handler error: {message}"),
        }
    }
}

impl std::error::Error for HandlerError {}

/// Errors from the finalizer guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizerError {
    /// Adding or removing the token failed.
    Store(StoreError),
    /// The cleanup notification failed; the token was kept.
    CleanupFailed {
        kind: &'static str,
        key: ObjectRef,
        reason: String,
    },
}

impl fmt::Display for FinalizerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "finalizer store error: {e}"),
            Self::CleanupFailed { kind, key, reason } => {
                write!(f, "cleanup of {kind} {key} failed: {reason}")
            }
        }
    }
}

impl std::error::Error for FinalizerError {}

impl From<StoreError> for FinalizerError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// Errors from handler registration and dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// A job type was registered twice.
    DuplicateHandler { job_type: JobType },
    /// Statically known job types have no handler.
    MissingHandlers { job_types: Vec<JobType> },
    /// Writing the handler outcome back failed.
    Lifecycle(JobError),
    /// The store rejected a read.
    Store(StoreError),
    /// The finalizer guard failed.
    Finalizer(FinalizerError),
    /// The handler failed during a deletion notification.
    CleanupFailed { job: ObjectRef, message: String },
    /// The handler has not finished cleaning up yet.
    CleanupPending { job: ObjectRef, reason: String },
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateHandler { job_type } => {
                write!(f, "handler already registered for job type {job_type}")
            }
            Self::MissingHandlers { job_types } => {
                let names: Vec<&str> = job_types.iter().map(JobType::as_str).collect();
                write!(f, "no handler registered for job types: {}", names.join(", "))
            }
            Self::Lifecycle(e) => write!(f, "applying handler outcome failed: {e}"),
            Self::Store(e) => write!(f, "dispatch store error: {e}"),
            Self::Finalizer(e) => write!(f, "{e}"),
            Self::CleanupFailed { job, message } => {
                write!(f, "cleanup of job {job} failed: {message}")
            }
            Self::CleanupPending { job, reason } => {
                write!(f, "cleanup of job {job} still pending: {reason}")
            }
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<JobError> for DispatchError {
    fn from(e: JobError) -> Self {
        Self::Lifecycle(e)
    }
}

impl From<StoreError> for DispatchError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<FinalizerError> for DispatchError {
    fn from(e: FinalizerError) -> Self {
        Self::Finalizer(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_display() {
        let err = JobError::InvalidTransition {
            job: ObjectRef::new("scan-1"),
            from: JobState::Completed,
            to: JobState::Running,
        };
        assert_eq!(
            err.to_string(),
            "invalid transition for job scan-1: Completed -> Running"
        );
    }

    #[test]
    fn handler_error_message() {
        let err = HandlerError::transient("connection reset");
        assert_eq!(err.message(), "connection reset");
        assert!(err.to_string().starts_with("transient"));
    }

    #[test]
    fn missing_handlers_lists_types() {
        let err = DispatchError::MissingHandlers {
            job_types: vec![JobType::Sign, JobType::Scan],
        };
        assert!(err.to_string().contains("sign, scan"));
    }
}
