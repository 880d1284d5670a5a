//! Finalizer guard.
//!
//! A record carrying the guard's token cannot be removed from the store.
//! The guard adds the token to live records, and for records whose deletion
//! was requested it runs the cleanup notification once and then drops the
//! token. A failed cleanup keeps the token, so the next reconcile retries it.

use crate::error::FinalizerError;
use dockyard_core::Resource;
use dockyard_store::{Store, retry_on_conflict};
use serde_json::json;
use std::fmt;
use std::future::Future;
use tracing::{debug, info};

/// What the guard did with a record.
#[derive(Debug, Clone, PartialEq)]
pub enum Guarded<R> {
    /// The token was just added; the updated record is returned.
    Added(R),
    /// The record is live and already guarded.
    Live(R),
    /// Deletion was requested and cleanup has run; the record is gone or
    /// about to be.
    Released,
}

/// Applies the finalizer protocol to `record`.
///
/// `cleanup` is only called for records under deletion that still carry
/// `token`.
///
/// # Errors
///
/// Returns `CleanupFailed` if `cleanup` fails (the token is kept), or the
/// store error if adding or removing the token fails.
pub async fn guard<R, S, F, Fut, E>(
    store: &S,
    record: R,
    token: &str,
    cleanup: F,
) -> Result<Guarded<R>, FinalizerError>
where
    R: Resource,
    S: Store<R> + ?Sized,
    F: FnOnce(R) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: fmt::Display,
{
    let key = record.key();

    if !record.meta().is_deleting() {
        if record.meta().has_finalizer(token) {
            return Ok(Guarded::Live(record));
        }

        let updated = retry_on_conflict(store, &record, |current: R| async move {
            if current.meta().has_finalizer(token) || current.meta().is_deleting() {
                return Ok(current);
            }
            let mut finalizers = current.meta().finalizers.clone();
            finalizers.push(token.to_string());
            store
                .patch(&current, json!({"metadata": {"finalizers": finalizers}}))
                .await
        })
        .await?;

        debug!(kind = R::KIND, key = %key, token, "finalizer added");
        return Ok(Guarded::Added(updated));
    }

    if !record.meta().has_finalizer(token) {
        return Ok(Guarded::Released);
    }

    cleanup(record.clone())
        .await
        .map_err(|e| FinalizerError::CleanupFailed {
            kind: R::KIND,
            key: key.clone(),
            reason: e.to_string(),
        })?;

    let removed = retry_on_conflict(store, &record, |current: R| async move {
        if !current.meta().has_finalizer(token) {
            return Ok(());
        }
        let finalizers: Vec<&String> = current
            .meta()
            .finalizers
            .iter()
            .filter(|f| f.as_str() != token)
            .collect();
        store
            .patch(&current, json!({"metadata": {"finalizers": finalizers}}))
            .await
            .map(|_| ())
    })
    .await;

    match removed {
        Ok(()) => {}
        // Someone else released it first.
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }

    info!(kind = R::KIND, key = %key, "cleanup done, finalizer released");
    Ok(Guarded::Released)
}
