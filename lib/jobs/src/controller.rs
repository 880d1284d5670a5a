//! Level-triggered reconcile loop.
//!
//! A [`Controller`] receives record keys from a trigger stream and calls its
//! [`Reconciler`] for each, never running two reconciles of the same key at
//! once. A key triggered while its reconcile is running is reconciled again
//! right after. Failed reconciles and `Requeue` results come back after the
//! requeue delay.

use crate::dispatch::Dispatcher;
use crate::error::DispatchError;
use crate::finalizer::{Guarded, guard};
use crate::job::{JOB_FINALIZER, Job};
use async_trait::async_trait;
use dockyard_core::{ObjectRef, Resource};
use dockyard_store::{Store, StoreError};
use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt};
use rootcause::Report;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What to do with a key after a reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing more to do until the next trigger.
    Done,
    /// Reconcile again after the requeue delay.
    Requeue,
}

/// Drives one record kind towards its desired state.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    type Error: fmt::Display + fmt::Debug + Send + Sync + 'static;

    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Reconciles the record stored under `key`.
    ///
    /// A missing record is not an error.
    async fn reconcile(&self, key: &ObjectRef) -> Result<Action, Report<Self::Error>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyState {
    Running,
    /// Triggered again while running.
    RunningDirty,
}

/// Runs a [`Reconciler`] against a stream of keys.
pub struct Controller<R> {
    reconciler: Arc<R>,
    requeue_delay: Duration,
}

impl<R: Reconciler> Controller<R> {
    /// Creates a controller.
    pub fn new(reconciler: Arc<R>, requeue_delay: Duration) -> Self {
        Self {
            reconciler,
            requeue_delay,
        }
    }

    /// Reconciles keys from `triggers` until `shutdown` is cancelled.
    ///
    /// Reconciles in flight at shutdown are allowed to finish.
    pub async fn run(&self, mut triggers: BoxStream<'static, ObjectRef>, shutdown: CancellationToken) {
        let name = self.reconciler.name();
        let (requeue_tx, mut requeue_rx) = mpsc::unbounded_channel::<ObjectRef>();
        let mut states: HashMap<ObjectRef, KeyState> = HashMap::new();
        let mut tasks: JoinSet<(ObjectRef, Action)> = JoinSet::new();
        let mut triggers_open = true;

        info!(controller = name, "controller started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                next = triggers.next(), if triggers_open => match next {
                    Some(key) => self.trigger(key, &mut states, &mut tasks),
                    None => {
                        debug!(controller = name, "trigger stream ended");
                        triggers_open = false;
                    }
                },
                Some(key) = requeue_rx.recv() => self.trigger(key, &mut states, &mut tasks),
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => match joined {
                    Ok((key, action)) => {
                        if states.remove(&key) == Some(KeyState::RunningDirty) {
                            self.trigger(key, &mut states, &mut tasks);
                        } else if action == Action::Requeue {
                            self.requeue_later(key, &requeue_tx);
                        }
                    }
                    Err(e) => error!(controller = name, error = %e, "reconcile task aborted"),
                },
            }
        }

        info!(controller = name, in_flight = tasks.len(), "controller shutting down");
        while tasks.join_next().await.is_some() {}
    }

    fn trigger(
        &self,
        key: ObjectRef,
        states: &mut HashMap<ObjectRef, KeyState>,
        tasks: &mut JoinSet<(ObjectRef, Action)>,
    ) {
        if let Some(state) = states.get_mut(&key) {
            *state = KeyState::RunningDirty;
            return;
        }
        states.insert(key.clone(), KeyState::Running);

        let reconciler = Arc::clone(&self.reconciler);
        tasks.spawn(async move {
            let result = AssertUnwindSafe(reconciler.reconcile(&key))
                .catch_unwind()
                .await;
            let action = match result {
                Ok(Ok(action)) => action,
                Ok(Err(report)) => {
                    warn!(controller = reconciler.name(), key = %key, error = %report, "reconcile failed");
                    Action::Requeue
                }
                Err(_) => {
                    error!(controller = reconciler.name(), key = %key, "reconcile panicked");
                    Action::Requeue
                }
            };
            (key, action)
        });
    }

    fn requeue_later(&self, key: ObjectRef, requeue_tx: &mpsc::UnboundedSender<ObjectRef>) {
        let requeue_tx = requeue_tx.clone();
        let delay = self.requeue_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Closed once the controller stopped.
            let _ = requeue_tx.send(key);
        });
    }
}

/// Keys of every stored record followed by the keys of later changes.
///
/// The watch is opened before listing, so no change is lost in between.
///
/// # Errors
///
/// Returns the store error if listing fails.
pub async fn watch_keys<R, S>(store: &S) -> Result<BoxStream<'static, ObjectRef>, StoreError>
where
    R: Resource,
    S: Store<R> + ?Sized,
{
    watch_mapped(store, |record: &R| Some(record.key())).await
}

/// Like [`watch_keys`], mapping each record to the key to reconcile.
///
/// Records for which `map` returns `None` are skipped.
///
/// # Errors
///
/// Returns the store error if listing fails.
pub async fn watch_mapped<R, S, F>(
    store: &S,
    map: F,
) -> Result<BoxStream<'static, ObjectRef>, StoreError>
where
    R: Resource,
    S: Store<R> + ?Sized,
    F: Fn(&R) -> Option<ObjectRef> + Send + Sync + 'static,
{
    let changes = store.watch();
    let existing: Vec<ObjectRef> = store.list().await?.iter().filter_map(&map).collect();

    let changes = changes.filter_map(move |event| {
        let key = map(event.record());
        async move { key }
    });
    Ok(stream::iter(existing).chain(changes).boxed())
}

/// Reconciles jobs: guards them with the job finalizer and notifies their
/// handler until they finish.
pub struct JobReconciler<S: ?Sized> {
    store: Arc<S>,
    dispatcher: Arc<Dispatcher<S>>,
}

impl<S: Store<Job> + ?Sized> JobReconciler<S> {
    /// Creates a job reconciler.
    pub fn new(store: Arc<S>, dispatcher: Arc<Dispatcher<S>>) -> Self {
        Self { store, dispatcher }
    }
}

#[async_trait]
impl<S: Store<Job> + ?Sized + 'static> Reconciler for JobReconciler<S> {
    type Error = DispatchError;

    fn name(&self) -> &'static str {
        "job"
    }

    async fn reconcile(&self, key: &ObjectRef) -> Result<Action, Report<DispatchError>> {
        let job = match self.store.get(key).await {
            Ok(job) => job,
            Err(e) if e.is_not_found() => return Ok(Action::Done),
            Err(e) => return Err(DispatchError::from(e).into()),
        };

        let dispatcher = &self.dispatcher;
        let guarded = guard(self.store.as_ref(), job, JOB_FINALIZER, |job| async move {
            dispatcher.notify(&job).await.map(|_| ())
        })
        .await
        .map_err(DispatchError::from)?;

        let (job, added) = match guarded {
            Guarded::Released => return Ok(Action::Done),
            Guarded::Added(job) => (job, true),
            Guarded::Live(job) => (job, false),
        };

        // Every reconcile ends in a notification, terminal jobs included.
        let outcome = self.dispatcher.notify(&job).await?;
        Ok(if added || outcome.needs_retry() {
            Action::Requeue
        } else {
            Action::Done
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Handler, HandlerRegistry};
    use crate::error::HandlerError;
    use crate::job::{Claim, JobSpec, JobState, JobType};
    use crate::lifecycle::JobLifecycle;
    use dockyard_core::Outcome;
    use dockyard_store::MemoryStore;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Never;

    impl fmt::Display for Never {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("never")
        }
    }

    /// Records calls and overlap per key; requeues each key `requeues` times.
    #[derive(Default)]
    struct Recording {
        requeues: usize,
        calls: Mutex<HashMap<ObjectRef, usize>>,
        running: Mutex<HashMap<ObjectRef, usize>>,
        overlapped: AtomicUsize,
    }

    impl Recording {
        fn calls(&self, key: &ObjectRef) -> usize {
            self.calls.lock().unwrap().get(key).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl Reconciler for Recording {
        type Error = Never;

        fn name(&self) -> &'static str {
            "recording"
        }

        async fn reconcile(&self, key: &ObjectRef) -> Result<Action, Report<Never>> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                let count = calls.entry(key.clone()).or_default();
                *count += 1;
                *count
            };
            {
                let mut running = self.running.lock().unwrap();
                let now = running.entry(key.clone()).or_default();
                *now += 1;
                if *now > 1 {
                    self.overlapped.fetch_add(1, Ordering::SeqCst);
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            *self.running.lock().unwrap().get_mut(key).unwrap() -= 1;

            Ok(if call <= self.requeues {
                Action::Requeue
            } else {
                Action::Done
            })
        }
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn spawn_controller<R: Reconciler>(
        reconciler: Arc<R>,
        keys: Vec<ObjectRef>,
    ) -> (CancellationToken, tokio::task::JoinHandle<()>) {
        let controller = Controller::new(reconciler, Duration::from_millis(10));
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let trigger_stream = stream::iter(keys).chain(stream::pending()).boxed();
        let handle = tokio::spawn(async move { controller.run(trigger_stream, token).await });
        (shutdown, handle)
    }

    #[tokio::test]
    async fn same_key_never_runs_concurrently() {
        let reconciler = Arc::new(Recording::default());
        let a = ObjectRef::new("a");
        let b = ObjectRef::new("b");
        let (shutdown, handle) = spawn_controller(
            Arc::clone(&reconciler),
            vec![a.clone(), a.clone(), b.clone(), a.clone()],
        );

        wait_for(|| reconciler.calls(&a) >= 2 && reconciler.calls(&b) >= 1).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(reconciler.overlapped.load(Ordering::SeqCst), 0);
        // Triggers arriving while running collapse into one rerun.
        assert_eq!(reconciler.calls(&a), 2);
        assert_eq!(reconciler.calls(&b), 1);
    }

    #[tokio::test]
    async fn requeued_key_comes_back() {
        let reconciler = Arc::new(Recording {
            requeues: 2,
            ..Recording::default()
        });
        let a = ObjectRef::new("a");
        let (shutdown, handle) = spawn_controller(Arc::clone(&reconciler), vec![a.clone()]);

        wait_for(|| reconciler.calls(&a) >= 3).await;
        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(reconciler.calls(&a), 3);
    }

    #[tokio::test]
    async fn watch_keys_lists_then_follows() {
        let store = MemoryStore::<Job>::new();
        let claim = Claim::Scan {
            handle_object: ObjectRef::new("mirror"),
        };
        store
            .create(Job::new(&ObjectRef::new("first"), JobSpec::new(claim.clone())))
            .await
            .unwrap();

        let mut keys = watch_keys(&store).await.unwrap();
        store
            .create(Job::new(&ObjectRef::new("second"), JobSpec::new(claim)))
            .await
            .unwrap();

        assert_eq!(keys.next().await, Some(ObjectRef::new("first")));
        assert_eq!(keys.next().await, Some(ObjectRef::new("second")));
    }

    #[tokio::test]
    async fn watch_mapped_follows_targets() {
        let store = MemoryStore::<Job>::new();
        let mut targets = watch_mapped(&store, |job: &Job| Some(job.target().clone()))
            .await
            .unwrap();
        store
            .create(Job::new(
                &ObjectRef::new("scan-1"),
                JobSpec::new(Claim::Scan {
                    handle_object: ObjectRef::new("mirror"),
                }),
            ))
            .await
            .unwrap();

        assert_eq!(targets.next().await, Some(ObjectRef::new("mirror")));
    }

    /// Succeeds live jobs and counts cleanup calls.
    #[derive(Default)]
    struct Finishing {
        cleanups: AtomicUsize,
    }

    #[async_trait]
    impl Handler for Finishing {
        async fn handle(&self, job: &Job) -> Result<Outcome, HandlerError> {
            if job.metadata.is_deleting() {
                self.cleanups.fetch_add(1, Ordering::SeqCst);
            }
            Ok(Outcome::succeeded())
        }
    }

    fn job_reconciler(
        handler: Arc<Finishing>,
    ) -> (Arc<MemoryStore<Job>>, JobReconciler<MemoryStore<Job>>) {
        let store = Arc::new(MemoryStore::new());
        let registry = HandlerRegistry::builder()
            .register(JobType::Replicate, handler)
            .build()
            .unwrap();
        let dispatcher = Dispatcher::new(
            Arc::new(registry),
            JobLifecycle::new(Arc::clone(&store)),
            1,
        );
        let reconciler = JobReconciler::new(Arc::clone(&store), Arc::new(dispatcher));
        (store, reconciler)
    }

    #[tokio::test]
    async fn job_reconciler_guards_and_completes() {
        let handler = Arc::new(Finishing::default());
        let (store, reconciler) = job_reconciler(Arc::clone(&handler));
        let key = ObjectRef::new("replicate-1");
        store
            .create(Job::new(
                &key,
                JobSpec::new(Claim::Replicate {
                    handle_object: ObjectRef::new("mirror"),
                }),
            ))
            .await
            .unwrap();

        // The first pass adds the finalizer and asks to come back.
        let action = reconciler.reconcile(&key).await.unwrap();
        assert_eq!(action, Action::Requeue);
        let job = store.get(&key).await.unwrap();
        assert!(job.metadata.has_finalizer(JOB_FINALIZER));
        assert_eq!(job.state(), JobState::Completed);

        assert_eq!(reconciler.reconcile(&key).await.unwrap(), Action::Done);
        let job = store.get(&key).await.unwrap();

        store.delete(&job).await.unwrap();
        let action = reconciler.reconcile(&key).await.unwrap();
        assert_eq!(action, Action::Done);
        assert_eq!(handler.cleanups.load(Ordering::SeqCst), 1);
        assert!(store.get(&key).await.is_err());

        // A vanished job is simply done.
        assert_eq!(reconciler.reconcile(&key).await.unwrap(), Action::Done);
    }
}
