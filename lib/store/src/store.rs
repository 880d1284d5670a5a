//! The store interface consumed by every controller.

use crate::error::StoreError;
use async_trait::async_trait;
use dockyard_core::Resource;
use futures::stream::BoxStream;
use serde_json::Value as JsonValue;
use std::future::Future;
use tracing::debug;

/// Upper bound on write attempts made by [`retry_on_conflict`].
pub const MAX_CONFLICT_RETRIES: usize = 8;

/// A change observed on a record kind.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<R> {
    /// A record was created.
    Added(R),
    /// A record was written (spec, status, metadata or deletion request).
    Modified(R),
    /// A record was physically removed.
    Deleted(R),
}

impl<R> WatchEvent<R> {
    /// Returns the record carried by the event.
    #[must_use]
    pub fn record(&self) -> &R {
        match self {
            Self::Added(r) | Self::Modified(r) | Self::Deleted(r) => r,
        }
    }
}

/// Live stream of watch events for one record kind.
pub type WatchStream<R> = BoxStream<'static, WatchEvent<R>>;

/// Versioned CRUD + watch over one record kind.
///
/// Every write is conditional on the `resourceVersion` of the record passed
/// in; a stale version fails with [`StoreError::Conflict`].
#[async_trait]
pub trait Store<R: Resource>: Send + Sync {
    /// Gets a record by key.
    async fn get(&self, key: &dockyard_core::ObjectRef) -> Result<R, StoreError>;

    /// Lists all records.
    async fn list(&self) -> Result<Vec<R>, StoreError>;

    /// Creates a record. Fails with `AlreadyExists` if the key is taken.
    async fn create(&self, record: R) -> Result<R, StoreError>;

    /// Applies a merge patch to everything but `status`.
    async fn patch(&self, record: &R, diff: JsonValue) -> Result<R, StoreError>;

    /// Applies the `status` member of a merge patch.
    async fn patch_status(&self, record: &R, diff: JsonValue) -> Result<R, StoreError>;

    /// Requests deletion.
    ///
    /// While finalizers are present this only stamps `deletionTimestamp`;
    /// the record disappears once the last finalizer is removed.
    async fn delete(&self, record: &R) -> Result<(), StoreError>;

    /// Subscribes to changes.
    fn watch(&self) -> WatchStream<R>;
}

/// Runs a write against a record, re-reading and retrying on conflict.
///
/// `attempt` receives the freshest known copy of the record each time, so it
/// can re-decide whether a write is still needed. Errors other than
/// `Conflict` are returned immediately.
pub async fn retry_on_conflict<R, S, F, Fut, T>(
    store: &S,
    record: &R,
    mut attempt: F,
) -> Result<T, StoreError>
where
    R: Resource,
    S: Store<R> + ?Sized,
    F: FnMut(R) -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let key = record.key();
    let mut current = record.clone();
    let mut attempts = 1;

    loop {
        match attempt(current).await {
            Err(StoreError::Conflict { .. }) if attempts < MAX_CONFLICT_RETRIES => {
                debug!(kind = R::KIND, key = %key, attempts, "write conflict, retrying from a fresh read");
                attempts += 1;
                current = store.get(&key).await?;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::memory::tests::Widget;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn retries_stale_write_from_fresh_read() {
        let store = MemoryStore::<Widget>::new();
        let created = store.create(Widget::named("w")).await.unwrap();

        // Another writer bumps the version behind our back.
        store
            .patch(&created, json!({"spec": {"size": 2}}))
            .await
            .unwrap();

        let calls = AtomicUsize::new(0);
        let updated = retry_on_conflict(&store, &created, |current| {
            calls.fetch_add(1, Ordering::SeqCst);
            let store = &store;
            async move { store.patch(&current, json!({"spec": {"size": 5}})).await }
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(updated.spec.size, 5);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let store = MemoryStore::<Widget>::new();
        let calls = AtomicUsize::new(0);

        let result = retry_on_conflict(&store, &Widget::named("missing"), |current| {
            calls.fetch_add(1, Ordering::SeqCst);
            let store = &store;
            async move { store.patch(&current, json!({"spec": {"size": 1}})).await }
        })
        .await;

        assert!(result.unwrap_err().is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn persistent_conflict_is_surfaced_after_bound() {
        let store = MemoryStore::<Widget>::new();
        let created = store.create(Widget::named("w")).await.unwrap();
        let calls = AtomicUsize::new(0);

        let result: Result<(), StoreError> = retry_on_conflict(&store, &created, |_current| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                Err(StoreError::Conflict {
                    kind: "Widget",
                    key: dockyard_core::ObjectRef::new("w"),
                    expected: 1,
                    actual: 2,
                })
            }
        })
        .await;

        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), MAX_CONFLICT_RETRIES);
    }
}
