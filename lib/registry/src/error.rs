//! Error types for the registry crate.
//!
//! - `ClientError`: returned by the registry, signer and scanner
//!   collaborators
//! - `ReplicationError`: replication reconcile failures; lifted into a
//!   rootcause `Report` at the public boundary

use dockyard_core::ObjectRef;
use dockyard_jobs::{FinalizerError, HandlerError};
use dockyard_store::StoreError;
use dockyard_workflow::PipelineError;
use std::fmt;

/// Errors from external collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The service could not be reached or timed out.
    Unavailable { reason: String },
    /// The service refused the request.
    Rejected { reason: String },
}

impl ClientError {
    /// Shorthand for an unavailable service.
    #[must_use]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Shorthand for a refused request.
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { reason } => write!(f, "service unavailable: {reason}"),
            Self::Rejected { reason } => write!(f, "request rejected: {reason}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ClientError> for HandlerError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Unavailable { .. } => Self::transient(e.to_string()),
            ClientError::Rejected { .. } => Self::permanent(e.to_string()),
        }
    }
}

/// Errors from reconciling a replication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    /// The store rejected an operation.
    Store(StoreError),
    /// The finalizer guard failed.
    Finalizer(FinalizerError),
    /// A pipeline stage failed.
    Pipeline(PipelineError),
    /// Owned jobs are still being cleaned up.
    JobsRemaining { replication: ObjectRef, count: usize },
}

impl fmt::Display for ReplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "replication store error: {e}"),
            Self::Finalizer(e) => write!(f, "{e}"),
            Self::Pipeline(e) => write!(f, "{e}"),
            Self::JobsRemaining { replication, count } => {
                write!(f, "replication {replication} still owns {count} job(s)")
            }
        }
    }
}

impl std::error::Error for ReplicationError {}

impl From<StoreError> for ReplicationError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<FinalizerError> for ReplicationError {
    fn from(e: FinalizerError) -> Self {
        Self::Finalizer(e)
    }
}

impl From<PipelineError> for ReplicationError {
    fn from(e: PipelineError) -> Self {
        Self::Pipeline(e)
    }
}
