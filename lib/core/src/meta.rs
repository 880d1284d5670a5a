//! Object metadata shared by every persisted record.
//!
//! Records live in a versioned store: each carries a `resourceVersion` token
//! used for optimistic concurrency, an optional deletion timestamp set when a
//! delete is requested while finalizers are still present, and the finalizer
//! tokens themselves.

use crate::id::ObjectUid;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference to a record by name and optional namespace.
///
/// Used both as the store key and as the target of a job claim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    /// Namespace, if the record is namespace-scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Record name.
    pub name: String,
}

impl ObjectRef {
    /// Creates a cluster-scoped reference.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Creates a namespace-scoped reference.
    #[must_use]
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Returns a reference to a sibling record in the same namespace.
    #[must_use]
    pub fn sibling(&self, name: impl Into<String>) -> Self {
        Self {
            namespace: self.namespace.clone(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}/{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Points from a dependent record to the record that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    /// Kind of the owner.
    pub kind: String,
    /// Name of the owner (same namespace as the dependent).
    pub name: String,
    /// Uid of the owner.
    pub uid: ObjectUid,
}

/// Metadata common to all stored records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Record name, unique within its namespace.
    pub name: String,
    /// Namespace, if namespace-scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Assigned by the store on create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<ObjectUid>,
    /// Version token; bumped by the store on every write.
    #[serde(default)]
    pub resource_version: u64,
    /// Assigned by the store on create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Set when deletion was requested while finalizers were present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    /// Tokens blocking physical deletion.
    #[serde(default)]
    pub finalizers: Vec<String>,
    /// Owners of this record.
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
}

impl ObjectMeta {
    /// Creates metadata for a record with the given key.
    #[must_use]
    pub fn for_key(key: &ObjectRef) -> Self {
        Self {
            name: key.name.clone(),
            namespace: key.namespace.clone(),
            ..Self::default()
        }
    }

    /// Returns the store key of this record.
    #[must_use]
    pub fn key(&self) -> ObjectRef {
        ObjectRef {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    /// Returns true if the given finalizer token is present.
    #[must_use]
    pub fn has_finalizer(&self, token: &str) -> bool {
        self.finalizers.iter().any(|f| f == token)
    }

    /// Returns true if deletion has been requested.
    #[must_use]
    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    /// Returns true if the given record is listed as an owner.
    #[must_use]
    pub fn is_owned_by(&self, kind: &str, name: &str) -> bool {
        self.owner_references
            .iter()
            .any(|owner| owner.kind == kind && owner.name == name)
    }
}

/// A record kind that can be kept in the store.
pub trait Resource:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Kind name, used in owner references and log fields.
    const KIND: &'static str;

    /// Returns the record metadata.
    fn meta(&self) -> &ObjectMeta;

    /// Returns the record metadata mutably.
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Returns the store key.
    fn key(&self) -> ObjectRef {
        self.meta().key()
    }

    /// Builds an owner reference pointing at this record.
    ///
    /// Returns `None` if the record has not been persisted yet.
    fn owner_reference(&self) -> Option<OwnerReference> {
        let meta = self.meta();
        meta.uid.map(|uid| OwnerReference {
            kind: Self::KIND.to_string(),
            name: meta.name.clone(),
            uid,
        })
    }
}
