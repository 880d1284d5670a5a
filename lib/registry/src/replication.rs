//! The replication resource.
//!
//! A replication copies repositories from a source registry to a
//! destination registry and optionally signs the copies. Its status holds the
//! condition ledger driven by the replication pipeline and the phase derived
//! from it.

use dockyard_core::{ObjectMeta, ObjectRef, Resource};
use dockyard_workflow::{ConditionLedger, Phase};
use serde::{Deserialize, Serialize};

/// Finalizer token placed on every replication.
pub const REPLICATION_FINALIZER: &str = "registry.dockyard.io/replication";

/// Signing requested for a replication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignerSpec {
    pub key_name: String,
}

/// Desired replication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSpec {
    /// Registry to copy from.
    pub source: String,
    /// Registry to copy to.
    pub destination: String,
    /// Repositories to copy; empty copies the whole source catalog.
    #[serde(default)]
    pub repositories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer: Option<SignerSpec>,
}

/// Observed replication progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub conditions: ConditionLedger,
    /// Source catalog as last synchronized.
    #[serde(default)]
    pub catalog: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Replication {
    pub metadata: ObjectMeta,
    pub spec: ReplicationSpec,
    #[serde(default)]
    pub status: ReplicationStatus,
}

impl Replication {
    /// Creates a replication of the whole source catalog, unsigned.
    #[must_use]
    pub fn new(key: &ObjectRef, source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::for_key(key),
            spec: ReplicationSpec {
                source: source.into(),
                destination: destination.into(),
                repositories: Vec::new(),
                signer: None,
            },
            status: ReplicationStatus::default(),
        }
    }

    /// Restricts the replication to the given repositories.
    #[must_use]
    pub fn with_repositories<I, S>(mut self, repositories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.repositories = repositories.into_iter().map(Into::into).collect();
        self
    }

    /// Requests signing with the named key.
    #[must_use]
    pub fn with_signer(mut self, key_name: impl Into<String>) -> Self {
        self.spec.signer = Some(SignerSpec {
            key_name: key_name.into(),
        });
        self
    }

    /// Returns the repositories to copy, sign and scan.
    ///
    /// Explicitly listed repositories win; otherwise the synchronized catalog
    /// is used.
    #[must_use]
    pub fn selected_repositories(&self) -> &[String] {
        if self.spec.repositories.is_empty() {
            &self.status.catalog
        } else {
            &self.spec.repositories
        }
    }

    /// Returns the signing key name, if signing was requested.
    #[must_use]
    pub fn signing_key(&self) -> Option<&str> {
        self.spec.signer.as_ref().map(|s| s.key_name.as_str())
    }
}

impl Resource for Replication {
    const KIND: &'static str = "Replication";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn explicit_repositories_win_over_catalog() {
        let mut replication = Replication::new(&ObjectRef::new("mirror"), "hub", "local");
        replication.status.catalog = vec!["library/nginx".into(), "library/redis".into()];
        assert_eq!(replication.selected_repositories().len(), 2);

        let replication = replication.with_repositories(["library/redis"]);
        assert_eq!(replication.selected_repositories(), ["library/redis"]);
    }

    #[test]
    fn wire_shape() {
        let replication = Replication::new(&ObjectRef::namespaced("ops", "mirror"), "hub", "local")
            .with_signer("release");
        let json = serde_json::to_value(&replication).unwrap();

        assert_eq!(json["spec"]["signer"], json!({"keyName": "release"}));
        assert_eq!(json["status"]["phase"], "Processing");
        assert_eq!(json["status"]["conditions"], json!([]));
    }

    #[test]
    fn unsigned_spec_omits_signer() {
        let replication = Replication::new(&ObjectRef::new("mirror"), "hub", "local");
        let json = serde_json::to_value(&replication).unwrap();
        assert!(json["spec"].get("signer").is_none());
        assert!(replication.signing_key().is_none());
    }
}
