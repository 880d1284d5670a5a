//! In-process store with the same versioning semantics as a cluster API.

use crate::error::StoreError;
use crate::merge::merge_patch;
use crate::store::{Store, WatchEvent, WatchStream};
use async_trait::async_trait;
use chrono::Utc;
use dockyard_core::{ObjectRef, ObjectUid, Resource};
use futures::StreamExt;
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

/// Buffered watch events per subscriber before it starts lagging.
const WATCH_BUFFER: usize = 1024;

/// Which part of a record a patch may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatchScope {
    /// Everything except `status`.
    Main,
    /// Only `status`.
    Status,
}

impl PatchScope {
    fn restrict(self, diff: JsonValue) -> Result<JsonValue, StoreError> {
        let JsonValue::Object(mut members) = diff else {
            return Err(StoreError::InvalidPatch {
                reason: "patch must be a JSON object".to_string(),
            });
        };

        match self {
            Self::Main => {
                members.remove("status");
                Ok(JsonValue::Object(members))
            }
            Self::Status => {
                let status = members.remove("status").ok_or_else(|| StoreError::InvalidPatch {
                    reason: "status patch has no status member".to_string(),
                })?;
                let mut restricted = Map::new();
                restricted.insert("status".to_string(), status);
                Ok(JsonValue::Object(restricted))
            }
        }
    }
}

/// A [`Store`] kept in memory.
///
/// Lost on restart; used by tests and single-process deployments.
pub struct MemoryStore<R: Resource> {
    records: Mutex<BTreeMap<ObjectRef, R>>,
    events: broadcast::Sender<WatchEvent<R>>,
}

impl<R: Resource> MemoryStore<R> {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            records: Mutex::new(BTreeMap::new()),
            events,
        }
    }

    /// Returns the number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if no records are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<ObjectRef, R>> {
        // A panic while holding the lock cannot leave a half-written record.
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Called with the records lock held, so events go out in version order.
    fn publish(&self, event: WatchEvent<R>) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn not_found(key: &ObjectRef) -> StoreError {
        StoreError::NotFound {
            kind: R::KIND,
            key: key.clone(),
        }
    }

    fn check_version(stored: &R, seen: &R) -> Result<(), StoreError> {
        let actual = stored.meta().resource_version;
        let expected = seen.meta().resource_version;
        if actual != expected {
            return Err(StoreError::Conflict {
                kind: R::KIND,
                key: stored.key(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    fn apply(&self, record: &R, diff: JsonValue, scope: PatchScope) -> Result<R, StoreError> {
        let diff = scope.restrict(diff)?;
        let key = record.key();
        let mut records = self.lock();
        let stored = records.get(&key).ok_or_else(|| Self::not_found(&key))?;
        Self::check_version(stored, record)?;

        let mut document = serde_json::to_value(stored)?;
        merge_patch(&mut document, &diff);
        let mut updated: R = serde_json::from_value(document)?;

        // Identity and lifecycle fields belong to the store.
        let stored_meta = stored.meta();
        let meta = updated.meta_mut();
        meta.name = stored_meta.name.clone();
        meta.namespace = stored_meta.namespace.clone();
        meta.uid = stored_meta.uid;
        meta.creation_timestamp = stored_meta.creation_timestamp;
        meta.deletion_timestamp = stored_meta.deletion_timestamp;
        meta.resource_version = stored_meta.resource_version + 1;

        if updated.meta().is_deleting() && updated.meta().finalizers.is_empty() {
            records.remove(&key);
            debug!(kind = R::KIND, key = %key, "last finalizer removed, record deleted");
            self.publish(WatchEvent::Deleted(updated.clone()));
            return Ok(updated);
        }

        records.insert(key, updated.clone());
        self.publish(WatchEvent::Modified(updated.clone()));
        Ok(updated)
    }
}

impl<R: Resource> Default for MemoryStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<R: Resource> Store<R> for MemoryStore<R> {
    async fn get(&self, key: &ObjectRef) -> Result<R, StoreError> {
        self.lock()
            .get(key)
            .cloned()
            .ok_or_else(|| Self::not_found(key))
    }

    async fn list(&self) -> Result<Vec<R>, StoreError> {
        Ok(self.lock().values().cloned().collect())
    }

    async fn create(&self, mut record: R) -> Result<R, StoreError> {
        let key = record.key();
        let mut records = self.lock();
        if records.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: R::KIND,
                key,
            });
        }

        let meta = record.meta_mut();
        meta.uid = Some(ObjectUid::new());
        meta.resource_version = 1;
        // Kept when supplied so imported records retain their history.
        meta.creation_timestamp.get_or_insert_with(Utc::now);
        meta.deletion_timestamp = None;

        records.insert(key, record.clone());
        self.publish(WatchEvent::Added(record.clone()));
        Ok(record)
    }

    async fn patch(&self, record: &R, diff: JsonValue) -> Result<R, StoreError> {
        self.apply(record, diff, PatchScope::Main)
    }

    async fn patch_status(&self, record: &R, diff: JsonValue) -> Result<R, StoreError> {
        self.apply(record, diff, PatchScope::Status)
    }

    async fn delete(&self, record: &R) -> Result<(), StoreError> {
        let key = record.key();
        let mut records = self.lock();
        let stored = records.get(&key).ok_or_else(|| Self::not_found(&key))?;
        Self::check_version(stored, record)?;

        if stored.meta().finalizers.is_empty() {
            if let Some(removed) = records.remove(&key) {
                self.publish(WatchEvent::Deleted(removed));
            }
            return Ok(());
        }

        if stored.meta().is_deleting() {
            return Ok(());
        }

        let mut marked = stored.clone();
        let meta = marked.meta_mut();
        meta.deletion_timestamp = Some(Utc::now());
        meta.resource_version += 1;
        records.insert(key.clone(), marked.clone());
        debug!(kind = R::KIND, key = %key, "deletion requested, waiting on finalizers");
        self.publish(WatchEvent::Modified(marked));
        Ok(())
    }

    fn watch(&self) -> WatchStream<R> {
        BroadcastStream::new(self.events.subscribe())
            .filter_map(|event| async move {
                match event {
                    Ok(event) => Some(event),
                    Err(e) => {
                        warn!(kind = R::KIND, error = %e, "watch subscriber lagged, events skipped");
                        None
                    }
                }
            })
            .boxed()
    }
}
