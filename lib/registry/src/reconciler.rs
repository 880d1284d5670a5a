//! Reconciles replications through their pipeline.

use crate::error::ReplicationError;
use crate::handlers::{JobStore, ReplicationStore};
use crate::replication::{REPLICATION_FINALIZER, Replication};
use crate::stages::replication_pipeline;
use async_trait::async_trait;
use dockyard_core::{ObjectRef, Resource};
use dockyard_jobs::{Action, Guarded, Job, JobLifecycle, Reconciler, guard, watch_keys, watch_mapped};
use dockyard_store::{Store, StoreError, retry_on_conflict};
use dockyard_workflow::{ConditionLedger, ConditionStatus, Phase, Pipeline};
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use rootcause::Report;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Drives replications: guards them with the replication finalizer, runs
/// the pipeline and writes the derived phase back.
pub struct ReplicationReconciler {
    replications: Arc<ReplicationStore>,
    jobs: Arc<JobStore>,
    pipeline: Pipeline<Replication>,
}

impl ReplicationReconciler {
    pub fn new(replications: Arc<ReplicationStore>, jobs: JobLifecycle<JobStore>) -> Self {
        Self {
            replications,
            jobs: Arc::clone(jobs.store()),
            pipeline: replication_pipeline(&jobs),
        }
    }

    /// Requests deletion of every job the replication owns.
    ///
    /// Fails while any owned job still exists, so the replication finalizer
    /// stays until each job has gone through its own cleanup.
    async fn release_jobs(&self, replication: &Replication) -> Result<(), ReplicationError> {
        let owned: Vec<Job> = self
            .jobs
            .list()
            .await?
            .into_iter()
            .filter(|job| {
                job.metadata.namespace == replication.metadata.namespace
                    && job
                        .metadata
                        .is_owned_by(Replication::KIND, &replication.metadata.name)
            })
            .collect();
        if owned.is_empty() {
            return Ok(());
        }

        for job in owned.iter().filter(|job| !job.metadata.is_deleting()) {
            match self.jobs.delete(job).await {
                Ok(()) => debug!(job = %job.key(), "owned job deletion requested"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Err(ReplicationError::JobsRemaining {
            replication: replication.key(),
            count: owned.len(),
        })
    }

    async fn write_status(
        &self,
        replication: &Replication,
        phase: Phase,
        message: &str,
        ledger: &ConditionLedger,
    ) -> Result<(), StoreError> {
        let status = &replication.status;
        if status.phase == phase && status.message == message && &status.conditions == ledger {
            return Ok(());
        }

        let store = self.replications.as_ref();
        let diff = json!({"status": {"phase": phase, "message": message, "conditions": ledger}});
        retry_on_conflict(store, replication, |current: Replication| {
            let diff = diff.clone();
            async move { store.patch_status(&current, diff).await }
        })
        .await?;

        if status.phase != phase {
            info!(replication = %replication.key(), from = %status.phase, to = %phase, "replication phase changed");
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for ReplicationReconciler {
    type Error = ReplicationError;

    fn name(&self) -> &'static str {
        "replication"
    }

    #[instrument(skip_all, fields(replication = %key))]
    async fn reconcile(&self, key: &ObjectRef) -> Result<Action, Report<ReplicationError>> {
        let replication = match self.replications.get(key).await {
            Ok(replication) => replication,
            Err(e) if e.is_not_found() => return Ok(Action::Done),
            Err(e) => return Err(ReplicationError::from(e).into()),
        };

        let guarded = guard(
            self.replications.as_ref(),
            replication,
            REPLICATION_FINALIZER,
            |replication| async move { self.release_jobs(&replication).await },
        )
        .await
        .map_err(ReplicationError::from)?;
        let replication = match guarded {
            Guarded::Released => return Ok(Action::Done),
            Guarded::Added(replication) | Guarded::Live(replication) => replication,
        };

        let mut ledger = replication.status.conditions.clone();
        let needs_retry = match self
            .pipeline
            .reconcile_by_condition_status(&replication, &mut ledger)
            .await
        {
            Ok(needs_retry) => needs_retry,
            Err(e) => {
                self.write_status(&replication, replication.status.phase, &e.to_string(), &ledger)
                    .await
                    .map_err(ReplicationError::from)?;
                return Err(ReplicationError::from(e).into());
            }
        };

        let phase = self.pipeline.phase(&replication, &ledger);
        let message = ledger
            .iter()
            .find(|c| c.status == ConditionStatus::False)
            .map(|c| c.message.clone())
            .unwrap_or_default();
        self.write_status(&replication, phase, &message, &ledger)
            .await
            .map_err(ReplicationError::from)?;

        // Job events bring a finished pipeline back; only a running one polls.
        Ok(if needs_retry && phase == Phase::Processing {
            Action::Requeue
        } else {
            Action::Done
        })
    }
}

/// Keys of replications to reconcile: every replication change, plus the
/// target of every job change.
///
/// # Errors
///
/// Returns the store error if listing either kind fails.
pub async fn replication_triggers(
    replications: &ReplicationStore,
    jobs: &JobStore,
) -> Result<BoxStream<'static, ObjectRef>, StoreError> {
    let own = watch_keys::<Replication, _>(replications).await?;
    let from_jobs = watch_mapped::<Job, _, _>(jobs, |job: &Job| Some(job.target().clone())).await?;
    Ok(stream::select(own, from_jobs).boxed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{ReplicateHandler, SignHandler, SynchronizeHandler};
    use crate::memory::{InMemoryRegistry, LocalSigner};
    use crate::stages::stage_job_key;
    use dockyard_jobs::{Controller, Dispatcher, HandlerRegistry, JobReconciler, JobType};
    use dockyard_store::MemoryStore;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn mirror() -> ObjectRef {
        ObjectRef::namespaced("ops", "mirror")
    }

    struct Fixture {
        replications: Arc<MemoryStore<Replication>>,
        jobs: Arc<MemoryStore<Job>>,
        reconciler: ReplicationReconciler,
    }

    fn fixture() -> Fixture {
        let replications = Arc::new(MemoryStore::<Replication>::new());
        let jobs = Arc::new(MemoryStore::<Job>::new());
        let lifecycle: JobLifecycle<JobStore> = JobLifecycle::new(jobs.clone());
        let reconciler = ReplicationReconciler::new(replications.clone(), lifecycle);
        Fixture {
            replications,
            jobs,
            reconciler,
        }
    }

    #[tokio::test]
    async fn missing_replication_is_done() {
        let fixture = fixture();
        let action = fixture.reconciler.reconcile(&mirror()).await.unwrap();
        assert_eq!(action, Action::Done);
    }

    #[tokio::test]
    async fn first_pass_guards_and_starts_pipeline() {
        let fixture = fixture();
        fixture
            .replications
            .create(Replication::new(&mirror(), "hub", "local"))
            .await
            .unwrap();

        let action = fixture.reconciler.reconcile(&mirror()).await.unwrap();
        assert_eq!(action, Action::Requeue);

        let stored = fixture.replications.get(&mirror()).await.unwrap();
        assert!(stored.metadata.has_finalizer(REPLICATION_FINALIZER));
        assert_eq!(stored.status.phase, Phase::Processing);
        assert!(stored.status.conditions.is_true("SynchronizeExist"));
        assert_eq!(stored.status.conditions.len(), 6);
        assert_eq!(fixture.jobs.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_job_fails_phase_with_its_message() {
        let fixture = fixture();
        let replication = fixture
            .replications
            .create(Replication::new(&mirror(), "hub", "local"))
            .await
            .unwrap();
        fixture.reconciler.reconcile(&mirror()).await.unwrap();

        let key = stage_job_key(&replication, JobType::Synchronize);
        let job = fixture.jobs.get(&key).await.unwrap();
        JobLifecycle::new(fixture.jobs.clone())
            .mark_completed(&job, false, "bad credentials")
            .await
            .unwrap();

        let action = fixture.reconciler.reconcile(&mirror()).await.unwrap();
        assert_eq!(action, Action::Done);
        let stored = fixture.replications.get(&mirror()).await.unwrap();
        assert_eq!(stored.status.phase, Phase::Fail);
        assert_eq!(stored.status.message, "bad credentials");
    }

    #[tokio::test]
    async fn unchanged_pass_writes_nothing() {
        let fixture = fixture();
        fixture
            .replications
            .create(Replication::new(&mirror(), "hub", "local"))
            .await
            .unwrap();
        fixture.reconciler.reconcile(&mirror()).await.unwrap();
        let before = fixture.replications.get(&mirror()).await.unwrap();

        fixture.reconciler.reconcile(&mirror()).await.unwrap();
        let after = fixture.replications.get(&mirror()).await.unwrap();
        assert_eq!(
            after.metadata.resource_version,
            before.metadata.resource_version
        );
    }

    #[tokio::test]
    async fn deletion_waits_for_owned_jobs() {
        let fixture = fixture();
        fixture
            .replications
            .create(Replication::new(&mirror(), "hub", "local"))
            .await
            .unwrap();
        fixture.reconciler.reconcile(&mirror()).await.unwrap();

        // Mark the owned job as guarded, as the job controller would.
        let job = fixture.jobs.list().await.unwrap().remove(0);
        fixture
            .jobs
            .patch(&job, json!({"metadata": {"finalizers": ["test/hold"]}}))
            .await
            .unwrap();

        let replication = fixture.replications.get(&mirror()).await.unwrap();
        fixture.replications.delete(&replication).await.unwrap();

        let err = fixture.reconciler.reconcile(&mirror()).await.unwrap_err();
        assert!(err.to_string().contains("still owns 1 job"));
        assert!(fixture.replications.get(&mirror()).await.is_ok());

        let job = fixture.jobs.list().await.unwrap().remove(0);
        assert!(job.metadata.is_deleting());
        fixture
            .jobs
            .patch(&job, json!({"metadata": {"finalizers": []}}))
            .await
            .unwrap();

        let action = fixture.reconciler.reconcile(&mirror()).await.unwrap();
        assert_eq!(action, Action::Done);
        assert!(fixture.replications.is_empty());
    }

    async fn wait_for(
        replications: &MemoryStore<Replication>,
        done: impl Fn(Option<&Replication>) -> bool,
    ) {
        for _ in 0..400 {
            let current = replications.get(&mirror()).await.ok();
            if done(current.as_ref()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn replication_runs_to_success_and_cleans_up() {
        let replications = Arc::new(MemoryStore::<Replication>::new());
        let jobs = Arc::new(MemoryStore::<Job>::new());
        let registry = Arc::new(
            InMemoryRegistry::new().with_repositories("hub", ["library/nginx", "library/redis"]),
        );
        let signer = Arc::new(LocalSigner::new());
        let lifecycle: JobLifecycle<JobStore> = JobLifecycle::new(jobs.clone());

        let handlers = HandlerRegistry::builder()
            .register(
                JobType::Synchronize,
                Arc::new(SynchronizeHandler::new(replications.clone(), registry.clone())),
            )
            .register(
                JobType::Replicate,
                Arc::new(ReplicateHandler::new(replications.clone(), registry.clone())),
            )
            .register(
                JobType::Sign,
                Arc::new(SignHandler::new(
                    replications.clone(),
                    jobs.clone(),
                    signer.clone(),
                )),
            )
            .build()
            .unwrap();
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(handlers), lifecycle.clone(), 1));

        let shutdown = CancellationToken::new();
        let delay = Duration::from_millis(20);
        let job_controller = Controller::new(
            Arc::new(JobReconciler::new(Arc::clone(lifecycle.store()), dispatcher)),
            delay,
        );
        let job_triggers = watch_keys::<Job, _>(jobs.as_ref()).await.unwrap();
        let replication_controller = Controller::new(
            Arc::new(ReplicationReconciler::new(replications.clone(), lifecycle)),
            delay,
        );
        let replication_keys = replication_triggers(replications.as_ref(), jobs.as_ref())
            .await
            .unwrap();
        let token = shutdown.clone();
        tokio::spawn(async move { job_controller.run(job_triggers, token).await });
        let token = shutdown.clone();
        tokio::spawn(async move { replication_controller.run(replication_keys, token).await });

        replications
            .create(Replication::new(&mirror(), "hub", "local").with_signer("release"))
            .await
            .unwrap();
        wait_for(&replications, |r| {
            r.is_some_and(|r| r.status.phase == Phase::Success)
        })
        .await;
        assert_eq!(registry.repositories("local"), ["library/nginx", "library/redis"]);
        assert!(signer.is_signed("local", "library/redis", "release"));

        // Dropping the signer retires the sign job, which deletes the key.
        let store = replications.as_ref();
        let current = store.get(&mirror()).await.unwrap();
        retry_on_conflict(store, &current, |current: Replication| async move {
            store.patch(&current, json!({"spec": {"signer": null}})).await
        })
        .await
        .unwrap();
        wait_for(&replications, |r| {
            signer.keys().is_empty()
                && r.is_some_and(|r| r.status.conditions.get("SignSuccess").is_none())
        })
        .await;

        let current = store.get(&mirror()).await.unwrap();
        assert_eq!(current.status.phase, Phase::Success);
        retry_on_conflict(store, &current, |current: Replication| async move {
            store.delete(&current).await
        })
        .await
        .unwrap();
        wait_for(&replications, |r| r.is_none() && jobs.is_empty()).await;

        shutdown.cancel();
    }
}
