//! Error types for the store crate.

use dockyard_core::ObjectRef;
use std::fmt;

/// Errors from store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The record does not exist.
    NotFound { kind: &'static str, key: ObjectRef },
    /// A record with this key already exists.
    AlreadyExists { kind: &'static str, key: ObjectRef },
    /// The write was based on a stale read.
    Conflict {
        kind: &'static str,
        key: ObjectRef,
        expected: u64,
        actual: u64,
    },
    /// The patch document is malformed.
    InvalidPatch { reason: String },
    /// A record could not be converted to or from JSON.
    Serialization { reason: String },
}

impl StoreError {
    /// Returns true for `NotFound`.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true for `AlreadyExists`.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Returns true for `Conflict`.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { kind, key } => write!(f, "{kind} not found: {key}"),
            Self::AlreadyExists { kind, key } => write!(f, "{kind} already exists: {key}"),
            Self::Conflict {
                kind,
                key,
                expected,
                actual,
            } => write!(
                f,
                "conflict writing {kind} {key}: read version {expected}, stored version {actual}"
            ),
            Self::InvalidPatch { reason } => write!(f, "invalid patch: {reason}"),
            Self::Serialization { reason } => write!(f, "serialization failed: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            reason: e.to_string(),
        }
    }
}
