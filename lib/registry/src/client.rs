//! Interfaces to the services the handlers act on.
//!
//! Implementations own their own timeouts. An unreachable service is
//! reported as `Unavailable` and retried; a refused request is `Rejected`
//! and fails the job.

use crate::error::ClientError;
use async_trait::async_trait;

/// Image registry API.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Lists the repositories of a registry.
    async fn catalog(&self, registry: &str) -> Result<Vec<String>, ClientError>;

    /// Copies a repository between registries. Copying an already present
    /// repository succeeds.
    async fn copy_repository(
        &self,
        source: &str,
        destination: &str,
        repository: &str,
    ) -> Result<(), ClientError>;

    /// Deletes a repository. Deleting a missing repository succeeds.
    async fn delete_repository(&self, registry: &str, repository: &str) -> Result<(), ClientError>;
}

/// Signing service.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Creates the key unless it already exists.
    async fn ensure_key(&self, key_name: &str) -> Result<(), ClientError>;

    /// Signs a repository with an existing key.
    async fn sign(&self, registry: &str, repository: &str, key_name: &str)
    -> Result<(), ClientError>;

    /// Removes the signature `key_name` put on a repository. Removing a
    /// missing signature succeeds.
    async fn unsign(&self, registry: &str, repository: &str, key_name: &str)
    -> Result<(), ClientError>;

    /// Deletes the key and whatever it signed. Deleting a missing key
    /// succeeds.
    async fn delete_key(&self, key_name: &str) -> Result<(), ClientError>;
}

/// Vulnerability scanner.
#[async_trait]
pub trait Scanner: Send + Sync {
    /// Scans a repository; a repository that fails the scan is `Rejected`.
    async fn scan(&self, registry: &str, repository: &str) -> Result<(), ClientError>;
}
