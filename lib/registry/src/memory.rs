//! In-process collaborators.
//!
//! Keep their state in memory and log every call. The controller binary runs
//! against them until real clients are configured, and tests use them to
//! observe side effects.

use crate::client::{RegistryClient, Scanner, Signer};
use crate::error::ClientError;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registries as named sets of repositories.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    registries: Mutex<BTreeMap<String, BTreeSet<String>>>,
    unavailable: AtomicBool,
}

impl InMemoryRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a registry with repositories.
    #[must_use]
    pub fn with_repositories<I, S>(self, registry: &str, repositories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        lock(&self.registries)
            .entry(registry.to_string())
            .or_default()
            .extend(repositories.into_iter().map(Into::into));
        self
    }

    /// Returns the repositories of a registry, sorted.
    #[must_use]
    pub fn repositories(&self, registry: &str) -> Vec<String> {
        lock(&self.registries)
            .get(registry)
            .map(|repos| repos.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Makes every call fail as unreachable until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), ClientError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ClientError::unavailable("registry unreachable"));
        }
        Ok(())
    }
}

#[async_trait]
impl RegistryClient for InMemoryRegistry {
    async fn catalog(&self, registry: &str) -> Result<Vec<String>, ClientError> {
        self.check_available()?;
        let catalog = self.repositories(registry);
        debug!(registry, repositories = catalog.len(), "catalog listed");
        Ok(catalog)
    }

    async fn copy_repository(
        &self,
        source: &str,
        destination: &str,
        repository: &str,
    ) -> Result<(), ClientError> {
        self.check_available()?;
        let mut registries = lock(&self.registries);
        let present = registries
            .get(source)
            .is_some_and(|repos| repos.contains(repository));
        if !present {
            return Err(ClientError::rejected(format!(
                "repository {repository} not found in {source}"
            )));
        }
        registries
            .entry(destination.to_string())
            .or_default()
            .insert(repository.to_string());
        info!(source, destination, repository, "repository copied");
        Ok(())
    }

    async fn delete_repository(&self, registry: &str, repository: &str) -> Result<(), ClientError> {
        self.check_available()?;
        if let Some(repos) = lock(&self.registries).get_mut(registry)
            && repos.remove(repository)
        {
            info!(registry, repository, "repository deleted");
        }
        Ok(())
    }
}

/// A signer keeping keys and signatures in memory.
#[derive(Debug, Default)]
pub struct LocalSigner {
    keys: Mutex<BTreeSet<String>>,
    signatures: Mutex<BTreeSet<(String, String)>>,
}

impl LocalSigner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing key names.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        lock(&self.keys).iter().cloned().collect()
    }

    /// Returns true if `registry/repository` was signed with `key_name`.
    #[must_use]
    pub fn is_signed(&self, registry: &str, repository: &str, key_name: &str) -> bool {
        lock(&self.signatures).contains(&(format!("{registry}/{repository}"), key_name.to_string()))
    }
}

#[async_trait]
impl Signer for LocalSigner {
    async fn ensure_key(&self, key_name: &str) -> Result<(), ClientError> {
        if lock(&self.keys).insert(key_name.to_string()) {
            info!(key = key_name, "signing key created");
        }
        Ok(())
    }

    async fn sign(
        &self,
        registry: &str,
        repository: &str,
        key_name: &str,
    ) -> Result<(), ClientError> {
        if !lock(&self.keys).contains(key_name) {
            return Err(ClientError::rejected(format!("unknown signing key {key_name}")));
        }
        lock(&self.signatures).insert((format!("{registry}/{repository}"), key_name.to_string()));
        debug!(registry, repository, key = key_name, "repository signed");
        Ok(())
    }

    async fn unsign(
        &self,
        registry: &str,
        repository: &str,
        key_name: &str,
    ) -> Result<(), ClientError> {
        if lock(&self.signatures).remove(&(format!("{registry}/{repository}"), key_name.to_string())) {
            debug!(registry, repository, key = key_name, "signature removed");
        }
        Ok(())
    }

    async fn delete_key(&self, key_name: &str) -> Result<(), ClientError> {
        if lock(&self.keys).remove(key_name) {
            info!(key = key_name, "signing key deleted");
        }
        lock(&self.signatures).retain(|(_, key)| key != key_name);
        Ok(())
    }
}

/// A scanner that fails a fixed set of repositories.
#[derive(Debug, Default)]
pub struct StaticScanner {
    vulnerable: BTreeSet<String>,
    scanned: Mutex<Vec<String>>,
}

impl StaticScanner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a repository as failing the scan.
    #[must_use]
    pub fn vulnerable(mut self, repository: impl Into<String>) -> Self {
        self.vulnerable.insert(repository.into());
        self
    }

    /// Returns the scanned repositories in scan order.
    #[must_use]
    pub fn scanned(&self) -> Vec<String> {
        lock(&self.scanned).clone()
    }
}

#[async_trait]
impl Scanner for StaticScanner {
    async fn scan(&self, registry: &str, repository: &str) -> Result<(), ClientError> {
        lock(&self.scanned).push(repository.to_string());
        if self.vulnerable.contains(repository) {
            return Err(ClientError::rejected(format!(
                "{registry}/{repository} has known vulnerabilities"
            )));
        }
        debug!(registry, repository, "repository scanned clean");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copy_requires_source_repository() {
        let registry = InMemoryRegistry::new().with_repositories("hub", ["library/nginx"]);

        registry
            .copy_repository("hub", "local", "library/nginx")
            .await
            .unwrap();
        // Copying twice is fine.
        registry
            .copy_repository("hub", "local", "library/nginx")
            .await
            .unwrap();
        assert_eq!(registry.repositories("local"), ["library/nginx"]);

        let err = registry
            .copy_repository("hub", "local", "library/redis")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Rejected { .. }));
    }

    #[tokio::test]
    async fn unavailable_registry() {
        let registry = InMemoryRegistry::new();
        registry.set_unavailable(true);
        let err = registry.catalog("hub").await.unwrap_err();
        assert!(matches!(err, ClientError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn signing_needs_key() {
        let signer = LocalSigner::new();
        assert!(signer.sign("local", "library/nginx", "release").await.is_err());

        signer.ensure_key("release").await.unwrap();
        signer.sign("local", "library/nginx", "release").await.unwrap();
        assert!(signer.is_signed("local", "library/nginx", "release"));

        signer.sign("local", "library/redis", "release").await.unwrap();
        signer.unsign("local", "library/nginx", "release").await.unwrap();
        assert!(!signer.is_signed("local", "library/nginx", "release"));
        assert!(signer.is_signed("local", "library/redis", "release"));

        signer.delete_key("release").await.unwrap();
        assert!(signer.keys().is_empty());
        assert!(!signer.is_signed("local", "library/redis", "release"));
    }
}
