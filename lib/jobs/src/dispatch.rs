//! Routing jobs to handlers and writing their outcomes back.

use crate::error::{DispatchError, HandlerError};
use crate::job::{Job, JobState, JobType};
use crate::lifecycle::JobLifecycle;
use async_trait::async_trait;
use dockyard_core::{ObjectRef, Outcome, Resource, Verdict};
use dockyard_store::Store;
use rootcause::Report;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, instrument, warn};

/// Performs the work for one job type.
///
/// `handle` is called for live jobs and, once, for jobs under deletion. In
/// the deletion case the handler cleans up whatever the job left behind
/// and returns a terminal outcome once nothing remains.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handles a notification for `job`.
    async fn handle(&self, job: &Job) -> Result<Outcome, HandlerError>;
}

/// Job type to handler mapping, fixed once built.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Starts a new registry.
    #[must_use]
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Returns the handler for a job type.
    #[must_use]
    pub fn get(&self, job_type: JobType) -> Option<&Arc<dyn Handler>> {
        self.handlers.get(&job_type)
    }

    /// Returns the registered job types.
    #[must_use]
    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }

    /// Checks that every job type in `required` has a handler.
    ///
    /// # Errors
    ///
    /// Returns `MissingHandlers` listing the uncovered types.
    pub fn ensure_complete(&self, required: &[JobType]) -> Result<(), Report<DispatchError>> {
        let missing: Vec<JobType> = required
            .iter()
            .copied()
            .filter(|t| !self.handlers.contains_key(t))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(DispatchError::MissingHandlers { job_types: missing }.into())
        }
    }
}

/// Builder for [`HandlerRegistry`].
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<JobType, Arc<dyn Handler>>,
    duplicates: Vec<JobType>,
}

impl HandlerRegistryBuilder {
    /// Registers the handler for a job type.
    #[must_use]
    pub fn register(mut self, job_type: JobType, handler: Arc<dyn Handler>) -> Self {
        if self.handlers.insert(job_type, handler).is_some() {
            self.duplicates.push(job_type);
        }
        self
    }

    /// Finishes the registry.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateHandler` if a job type was registered more than
    /// once.
    pub fn build(self) -> Result<HandlerRegistry, Report<DispatchError>> {
        if let Some(&job_type) = self.duplicates.first() {
            return Err(DispatchError::DuplicateHandler { job_type }.into());
        }
        Ok(HandlerRegistry {
            handlers: self.handlers,
        })
    }
}

/// What one notification did.
#[derive(Debug, Clone, PartialEq)]
pub enum NotifyOutcome {
    /// No handler is registered for the job type. Not retried.
    Unhandled,
    /// The handler ran and returned an outcome.
    Handled(Outcome),
    /// The handler failed transiently; the job keeps its state.
    Errored { message: String },
}

impl NotifyOutcome {
    /// Returns true if the job should be notified again later.
    #[must_use]
    pub fn needs_retry(&self) -> bool {
        match self {
            Self::Unhandled => false,
            Self::Handled(outcome) => outcome.needs_retry(),
            Self::Errored { .. } => true,
        }
    }
}

/// Bounds concurrent notifications per target object.
struct TargetLimiter {
    permits: usize,
    slots: Mutex<HashMap<ObjectRef, Arc<Semaphore>>>,
}

struct TargetPermit<'a> {
    limiter: &'a TargetLimiter,
    target: ObjectRef,
    slot: Arc<Semaphore>,
    permit: Option<OwnedSemaphorePermit>,
}

impl TargetLimiter {
    fn new(permits: usize) -> Self {
        Self {
            permits: permits.max(1),
            slots: Mutex::new(HashMap::new()),
        }
    }

    async fn acquire(&self, target: &ObjectRef) -> TargetPermit<'_> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(
                slots
                    .entry(target.clone())
                    .or_insert_with(|| Arc::new(Semaphore::new(self.permits))),
            )
        };
        // The semaphore is never closed.
        let permit = Arc::clone(&slot).acquire_owned().await.ok();
        TargetPermit {
            limiter: self,
            target: target.clone(),
            slot,
            permit,
        }
    }
}

impl Drop for TargetPermit<'_> {
    fn drop(&mut self) {
        self.permit.take();
        let mut slots = self
            .limiter
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one here: nobody else is waiting.
        if Arc::strong_count(&self.slot) == 2 {
            slots.remove(&self.target);
        }
    }
}

/// Routes job notifications to handlers and applies their outcomes.
pub struct Dispatcher<S: ?Sized> {
    registry: Arc<HandlerRegistry>,
    lifecycle: JobLifecycle<S>,
    limiter: TargetLimiter,
}

impl<S: Store<Job> + ?Sized> Dispatcher<S> {
    /// Creates a dispatcher allowing `max_in_flight_per_target` concurrent
    /// notifications against the same target object.
    pub fn new(
        registry: Arc<HandlerRegistry>,
        lifecycle: JobLifecycle<S>,
        max_in_flight_per_target: usize,
    ) -> Self {
        Self {
            registry,
            lifecycle,
            limiter: TargetLimiter::new(max_in_flight_per_target),
        }
    }

    /// Returns the lifecycle used to apply outcomes.
    #[must_use]
    pub fn lifecycle(&self) -> &JobLifecycle<S> {
        &self.lifecycle
    }

    /// Notifies the handler for `job`.
    ///
    /// For a live job the outcome is written back: progress moves a pending
    /// job to `Running`, waiting records the reason, a verdict completes the
    /// job and a permanent handler error fails it. Outcomes for jobs that
    /// are already terminal are not applied.
    ///
    /// # Errors
    ///
    /// For a job under deletion, returns `CleanupFailed` if the handler
    /// failed and `CleanupPending` if it has not finished. Otherwise returns
    /// an error only if writing the outcome back failed.
    #[instrument(skip(self, job), fields(job = %job.key(), job_type = %job.job_type()))]
    pub async fn notify(&self, job: &Job) -> Result<NotifyOutcome, Report<DispatchError>> {
        let job_type = job.job_type();
        let Some(handler) = self.registry.get(job_type) else {
            error!("no handler registered for job type");
            return Ok(NotifyOutcome::Unhandled);
        };

        let _permit = self.limiter.acquire(job.target()).await;
        let result = handler.handle(job).await;

        if job.metadata.is_deleting() {
            return match result {
                Ok(outcome) if outcome.needs_retry() => Err(DispatchError::CleanupPending {
                    job: job.key(),
                    reason: pending_reason(&outcome),
                }
                .into()),
                Ok(outcome) => {
                    debug!("cleanup finished");
                    Ok(NotifyOutcome::Handled(outcome))
                }
                Err(e) => Err(DispatchError::CleanupFailed {
                    job: job.key(),
                    message: e.message().to_string(),
                }
                .into()),
            };
        }

        if job.is_terminal() {
            debug!(state = %job.state(), "job already finished, outcome not applied");
            return Ok(match result {
                Ok(outcome) => NotifyOutcome::Handled(outcome),
                Err(e) => NotifyOutcome::Errored {
                    message: e.message().to_string(),
                },
            });
        }

        match result {
            Ok(outcome) => {
                self.apply(job, &outcome).await?;
                Ok(NotifyOutcome::Handled(outcome))
            }
            Err(HandlerError::Transient { message }) => {
                warn!(%message, "handler failed, will retry");
                self.lifecycle
                    .record_message(job, message.clone())
                    .await
                    .map_err(DispatchError::from)?;
                Ok(NotifyOutcome::Errored { message })
            }
            Err(HandlerError::Permanent { message }) => {
                error!(%message, "handler failed permanently");
                self.lifecycle
                    .mark_completed(job, false, message.clone())
                    .await
                    .map_err(DispatchError::from)?;
                Ok(NotifyOutcome::Handled(Outcome::failed(message)))
            }
        }
    }

    async fn apply(&self, job: &Job, outcome: &Outcome) -> Result<(), DispatchError> {
        match outcome {
            Outcome::Progressed => {
                if job.state() == JobState::Pending {
                    self.lifecycle.start(job).await?;
                }
            }
            Outcome::WaitingOnDependency { reason } => {
                self.lifecycle.record_message(job, reason.clone()).await?;
            }
            Outcome::Terminal(Verdict::Succeeded) => {
                self.lifecycle.mark_completed(job, true, "").await?;
                info!("job completed");
            }
            Outcome::Terminal(Verdict::Failed { reason }) => {
                self.lifecycle
                    .mark_completed(job, false, reason.clone())
                    .await?;
                info!(%reason, "job failed");
            }
        }
        Ok(())
    }
}

fn pending_reason(outcome: &Outcome) -> String {
    match outcome {
        Outcome::WaitingOnDependency { reason } => reason.clone(),
        _ => "cleanup in progress".to_string(),
    }
}
