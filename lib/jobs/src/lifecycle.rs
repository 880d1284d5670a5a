//! The job state machine.
//!
//! All state changes go through [`JobLifecycle`]: transitions are
//! forward-only, a transition to the current state writes nothing, and a
//! terminal state always carries a completion time. Writes use the record's
//! version token and are retried from a fresh read on conflict.

use crate::error::JobError;
use crate::job::{Claim, Job, JobSpec, JobState, JobStatus};
use chrono::{DateTime, Utc};
use dockyard_core::{ObjectRef, Resource};
use dockyard_store::{Store, retry_on_conflict};
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Creates jobs and moves them through their states.
pub struct JobLifecycle<S: ?Sized> {
    store: Arc<S>,
}

impl<S: ?Sized> Clone for JobLifecycle<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: Store<Job> + ?Sized> JobLifecycle<S> {
    /// Creates a lifecycle over the given store.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Creates a pending job for a claim.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSpec` for a malformed claim, or the store error
    /// (including `AlreadyExists`).
    pub async fn create(
        &self,
        key: &ObjectRef,
        claim: Claim,
        priority: u32,
        ttl: i64,
    ) -> Result<Job, JobError> {
        let spec = JobSpec::new(claim).with_priority(priority).with_ttl(ttl);
        self.create_job(Job::new(key, spec)).await
    }

    /// Persists a fully built job after validating its spec.
    ///
    /// The status is reset to `Pending` whatever the caller supplied.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSpec` for a malformed spec, or the store error.
    #[instrument(skip(self, job), fields(job = %job.key(), job_type = %job.job_type()))]
    pub async fn create_job(&self, mut job: Job) -> Result<Job, JobError> {
        job.spec.validate()?;
        job.status = JobStatus::default();
        let created = self.store.create(job).await?;
        info!("job created");
        Ok(created)
    }

    /// Moves a job to `to`, recording `message`.
    ///
    /// A transition to the current state is a no-op and returns the fresh
    /// record unchanged.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` for a backward move, or the store error if
    /// the job vanished or conflicts persisted.
    #[instrument(skip(self, job, message), fields(job = %job.key()))]
    pub async fn transition(
        &self,
        job: &Job,
        to: JobState,
        message: impl Into<String>,
    ) -> Result<Job, JobError> {
        let message = message.into();
        let store = self.store.as_ref();

        let written = retry_on_conflict(store, job, |current: Job| {
            let message = message.clone();
            async move {
                let from = current.status.state;
                if from == to {
                    return Ok(Ok(current));
                }
                if !from.can_transition_to(to) {
                    return Ok(Err(JobError::InvalidTransition {
                        job: current.key(),
                        from,
                        to,
                    }));
                }
                let diff = transition_diff(&current.status, to, &message, Utc::now());
                let written = store.patch_status(&current, diff).await;
                if written.is_ok() {
                    info!(%from, %to, "job transitioned");
                }
                written.map(Ok)
            }
        })
        .await??;

        Ok(written)
    }

    /// Moves a pending job to `Running`.
    ///
    /// Unlike [`JobLifecycle::transition`], a job that has already moved past
    /// `Pending` is returned as stored instead of being rejected.
    ///
    /// # Errors
    ///
    /// Returns the store error if the job vanished or conflicts persisted.
    pub async fn start(&self, job: &Job) -> Result<Job, JobError> {
        let store = self.store.as_ref();

        let written = retry_on_conflict(store, job, |current: Job| async move {
            let from = current.status.state;
            if !from.can_transition_to(JobState::Running) {
                return Ok(current);
            }
            let diff = transition_diff(&current.status, JobState::Running, "", Utc::now());
            let written = store.patch_status(&current, diff).await;
            if written.is_ok() {
                info!(job = %current.key(), %from, "job started");
            }
            written
        })
        .await?;

        Ok(written)
    }

    /// Moves a job to `Completed` or `Failed`.
    ///
    /// # Errors
    ///
    /// See [`JobLifecycle::transition`].
    pub async fn mark_completed(
        &self,
        job: &Job,
        success: bool,
        message: impl Into<String>,
    ) -> Result<Job, JobError> {
        let to = if success {
            JobState::Completed
        } else {
            JobState::Failed
        };
        self.transition(job, to, message).await
    }

    /// Updates only the status message, leaving the state alone.
    ///
    /// # Errors
    ///
    /// Returns the store error if the job vanished or conflicts persisted.
    pub async fn record_message(
        &self,
        job: &Job,
        message: impl Into<String>,
    ) -> Result<Job, JobError> {
        let message = message.into();
        let store = self.store.as_ref();

        let written = retry_on_conflict(store, job, |current: Job| {
            let message = message.clone();
            async move {
                if current.status.message == message {
                    return Ok(current);
                }
                debug!(job = %current.key(), %message, "recording job message");
                store
                    .patch_status(&current, json!({"status": {"message": message}}))
                    .await
            }
        })
        .await?;

        Ok(written)
    }
}

/// Builds the status patch for a transition.
fn transition_diff(
    status: &JobStatus,
    to: JobState,
    message: &str,
    now: DateTime<Utc>,
) -> JsonValue {
    let mut patch = json!({
        "state": to,
        "message": message,
    });
    if to != JobState::Pending && status.start_time.is_none() {
        patch["startTime"] = json!(now);
    }
    if to.is_terminal() {
        patch["completionTime"] = json!(now);
    }
    json!({ "status": patch })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockyard_store::{MemoryStore, StoreError};
    use serde_json::json;

    fn lifecycle() -> JobLifecycle<MemoryStore<Job>> {
        JobLifecycle::new(Arc::new(MemoryStore::new()))
    }

    fn claim() -> Claim {
        Claim::Synchronize {
            handle_object: ObjectRef::namespaced("registry", "mirror"),
        }
    }

    #[tokio::test]
    async fn create_starts_pending() {
        let lifecycle = lifecycle();
        let job = lifecycle
            .create(&ObjectRef::new("sync-1"), claim(), 3, 60)
            .await
            .unwrap();

        assert_eq!(job.state(), JobState::Pending);
        assert_eq!(job.spec.priority, 3);
        assert_eq!(job.spec.ttl, 60);
        assert!(job.status.start_time.is_none());
    }

    #[tokio::test]
    async fn create_rejects_invalid_spec() {
        let lifecycle = lifecycle();
        let err = lifecycle
            .create(
                &ObjectRef::new("sync-1"),
                Claim::Synchronize {
                    handle_object: ObjectRef::new(""),
                },
                0,
                0,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidSpec { .. }));
    }

    #[tokio::test]
    async fn full_lifecycle_sets_times() {
        let lifecycle = lifecycle();
        let job = lifecycle
            .create(&ObjectRef::new("sync-1"), claim(), 0, 0)
            .await
            .unwrap();

        let running = lifecycle
            .transition(&job, JobState::Running, "")
            .await
            .unwrap();
        assert_eq!(running.state(), JobState::Running);
        assert!(running.status.start_time.is_some());
        assert!(running.status.completion_time.is_none());

        let done = lifecycle
            .mark_completed(&running, true, "catalog fetched")
            .await
            .unwrap();
        assert_eq!(done.state(), JobState::Completed);
        assert_eq!(done.status.message, "catalog fetched");
        assert_eq!(done.status.start_time, running.status.start_time);
        assert!(done.status.completion_time.is_some());
    }

    #[tokio::test]
    async fn same_state_transition_writes_nothing() {
        let lifecycle = lifecycle();
        let job = lifecycle
            .create(&ObjectRef::new("sync-1"), claim(), 0, 0)
            .await
            .unwrap();
        let running = lifecycle
            .transition(&job, JobState::Running, "")
            .await
            .unwrap();

        let again = lifecycle
            .transition(&running, JobState::Running, "ignored")
            .await
            .unwrap();
        assert_eq!(
            again.metadata.resource_version,
            running.metadata.resource_version
        );
        assert_eq!(again.status.message, "");
    }

    #[tokio::test]
    async fn terminal_states_are_final() {
        let lifecycle = lifecycle();
        let job = lifecycle
            .create(&ObjectRef::new("sync-1"), claim(), 0, 0)
            .await
            .unwrap();
        let failed = lifecycle
            .mark_completed(&job, false, "bad credentials")
            .await
            .unwrap();
        assert!(failed.status.start_time.is_some());

        let err = lifecycle
            .transition(&failed, JobState::Completed, "")
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn stale_snapshot_is_refreshed_not_failed() {
        let lifecycle = lifecycle();
        let job = lifecycle
            .create(&ObjectRef::new("sync-1"), claim(), 0, 0)
            .await
            .unwrap();

        // A concurrent writer touches the status first.
        lifecycle
            .store()
            .patch_status(&job, json!({"status": {"message": "queued"}}))
            .await
            .unwrap();

        let running = lifecycle
            .transition(&job, JobState::Running, "picked up")
            .await
            .unwrap();
        assert_eq!(running.state(), JobState::Running);
        assert_eq!(running.status.message, "picked up");
    }

    #[tokio::test]
    async fn concurrent_identical_transitions_both_succeed() {
        let lifecycle = lifecycle();
        let job = lifecycle
            .create(&ObjectRef::new("sync-1"), claim(), 0, 0)
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            lifecycle.transition(&job, JobState::Running, ""),
            lifecycle.transition(&job, JobState::Running, ""),
        );
        assert_eq!(a.unwrap().state(), JobState::Running);
        assert_eq!(b.unwrap().state(), JobState::Running);
    }

    #[tokio::test]
    async fn start_leaves_finished_job_alone() {
        let lifecycle = lifecycle();
        let job = lifecycle
            .create(&ObjectRef::new("scan-1"), claim(), 0, 0)
            .await
            .unwrap();
        let done = lifecycle.mark_completed(&job, true, "").await.unwrap();

        // Stale snapshot: the job finished after it was read.
        let started = lifecycle.start(&job).await.unwrap();
        assert_eq!(started.state(), JobState::Completed);
        assert_eq!(
            started.metadata.resource_version,
            done.metadata.resource_version
        );
    }

    #[tokio::test]
    async fn record_message_keeps_state() {
        let lifecycle = lifecycle();
        let job = lifecycle
            .create(&ObjectRef::new("sync-1"), claim(), 0, 0)
            .await
            .unwrap();

        let updated = lifecycle
            .record_message(&job, "registry unreachable")
            .await
            .unwrap();
        assert_eq!(updated.state(), JobState::Pending);
        assert_eq!(updated.status.message, "registry unreachable");

        let unchanged = lifecycle
            .record_message(&updated, "registry unreachable")
            .await
            .unwrap();
        assert_eq!(
            unchanged.metadata.resource_version,
            updated.metadata.resource_version
        );
    }

    #[tokio::test]
    async fn vanished_job_is_reported() {
        let lifecycle = lifecycle();
        let job = Job::new(&ObjectRef::new("ghost"), JobSpec::new(claim()));

        let err = lifecycle
            .transition(&job, JobState::Running, "")
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Store(StoreError::NotFound { .. })));
    }
}
