//! Job handlers for the registry job types.
//!
//! Every handler reports the stored verdict for a finished job instead of
//! redoing its work, and treats a deletion notification as a request to undo
//! side effects that would otherwise leak.

use crate::client::{RegistryClient, Scanner, Signer};
use crate::replication::Replication;
use async_trait::async_trait;
use dockyard_core::{ObjectRef, Outcome, Resource, TaskId};
use dockyard_jobs::{Claim, Handler, HandlerError, Job, JobLifecycle, JobState};
use dockyard_store::{Store, retry_on_conflict};
use dockyard_workflow::{Step, StepError, Task, TaskOutcome, Ticket, WorkerPool};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Store of replications, as handlers and stages see it.
pub type ReplicationStore = dyn Store<Replication>;

/// Store of jobs, as handlers and stages see it.
pub type JobStore = dyn Store<Job>;

/// The verdict a finished job already reached.
fn settled(job: &Job) -> Option<Outcome> {
    match job.state() {
        JobState::Completed => Some(Outcome::succeeded()),
        JobState::Failed => Some(Outcome::failed(job.status.message.clone())),
        JobState::Pending | JobState::Running => None,
    }
}

async fn load_target(
    store: &ReplicationStore,
    job: &Job,
) -> Result<Option<Replication>, HandlerError> {
    match store.get(job.target()).await {
        Ok(replication) => Ok(Some(replication)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(HandlerError::transient(e.to_string())),
    }
}

async fn require_target(store: &ReplicationStore, job: &Job) -> Result<Replication, HandlerError> {
    load_target(store, job)
        .await?
        .ok_or_else(|| HandlerError::permanent(format!("replication {} not found", job.target())))
}

/// Fetches the source catalog into the replication status.
pub struct SynchronizeHandler {
    replications: Arc<ReplicationStore>,
    client: Arc<dyn RegistryClient>,
}

impl SynchronizeHandler {
    pub fn new(replications: Arc<ReplicationStore>, client: Arc<dyn RegistryClient>) -> Self {
        Self {
            replications,
            client,
        }
    }
}

#[async_trait]
impl Handler for SynchronizeHandler {
    async fn handle(&self, job: &Job) -> Result<Outcome, HandlerError> {
        if job.metadata.is_deleting() {
            return Ok(Outcome::succeeded());
        }
        if let Some(outcome) = settled(job) {
            return Ok(outcome);
        }

        let replication = require_target(self.replications.as_ref(), job).await?;
        let catalog = self.client.catalog(&replication.spec.source).await?;

        let missing: Vec<&str> = replication
            .spec
            .repositories
            .iter()
            .filter(|repository| !catalog.contains(repository))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Ok(Outcome::failed(format!(
                "repositories missing from {}: {}",
                replication.spec.source,
                missing.join(", ")
            )));
        }

        let store = self.replications.as_ref();
        retry_on_conflict(store, &replication, |current: Replication| {
            let catalog = catalog.clone();
            async move {
                if current.status.catalog == catalog {
                    return Ok(current);
                }
                store
                    .patch_status(&current, json!({"status": {"catalog": catalog}}))
                    .await
            }
        })
        .await
        .map_err(|e| HandlerError::transient(e.to_string()))?;

        info!(replication = %replication.key(), repositories = catalog.len(), "catalog synchronized");
        Ok(Outcome::succeeded())
    }
}

/// Copies the selected repositories to the destination.
pub struct ReplicateHandler {
    replications: Arc<ReplicationStore>,
    client: Arc<dyn RegistryClient>,
}

impl ReplicateHandler {
    pub fn new(replications: Arc<ReplicationStore>, client: Arc<dyn RegistryClient>) -> Self {
        Self {
            replications,
            client,
        }
    }

    /// Removes what an unfinished or failed replication may have copied.
    async fn remove_partial_copies(&self, job: &Job) -> Result<Outcome, HandlerError> {
        let Some(replication) = load_target(self.replications.as_ref(), job).await? else {
            debug!(job = %job.key(), "replication gone, nothing to remove");
            return Ok(Outcome::succeeded());
        };
        for repository in replication.selected_repositories() {
            self.client
                .delete_repository(&replication.spec.destination, repository)
                .await?;
        }
        info!(job = %job.key(), destination = %replication.spec.destination, "partial replication removed");
        Ok(Outcome::succeeded())
    }
}

#[async_trait]
impl Handler for ReplicateHandler {
    async fn handle(&self, job: &Job) -> Result<Outcome, HandlerError> {
        if job.metadata.is_deleting() {
            // A failed job may have copied some repositories before it gave up.
            if job.state() == JobState::Completed {
                return Ok(Outcome::succeeded());
            }
            return self.remove_partial_copies(job).await;
        }
        if let Some(outcome) = settled(job) {
            return Ok(outcome);
        }

        let replication = require_target(self.replications.as_ref(), job).await?;
        for repository in replication.selected_repositories() {
            self.client
                .copy_repository(
                    &replication.spec.source,
                    &replication.spec.destination,
                    repository,
                )
                .await?;
        }
        Ok(Outcome::succeeded())
    }
}

/// Signs the replicated repositories.
///
/// On job deletion the replication's signatures are removed, and the key
/// too once no other live sign job claims it.
pub struct SignHandler {
    replications: Arc<ReplicationStore>,
    jobs: Arc<JobStore>,
    signer: Arc<dyn Signer>,
}

impl SignHandler {
    pub fn new(
        replications: Arc<ReplicationStore>,
        jobs: Arc<JobStore>,
        signer: Arc<dyn Signer>,
    ) -> Self {
        Self {
            replications,
            jobs,
            signer,
        }
    }

    async fn key_claimed_elsewhere(&self, job: &Job, key_name: &str) -> Result<bool, HandlerError> {
        let jobs = self
            .jobs
            .list()
            .await
            .map_err(|e| HandlerError::transient(e.to_string()))?;
        Ok(jobs.iter().any(|other| {
            other.key() != job.key()
                && !other.metadata.is_deleting()
                && matches!(&other.spec.claim, Claim::Sign { key_name: claimed, .. } if claimed == key_name)
        }))
    }

    async fn release(&self, job: &Job, key_name: &str) -> Result<Outcome, HandlerError> {
        if let Some(replication) = load_target(self.replications.as_ref(), job).await? {
            for repository in replication.selected_repositories() {
                self.signer
                    .unsign(&replication.spec.destination, repository, key_name)
                    .await?;
            }
        }

        if self.key_claimed_elsewhere(job, key_name).await? {
            debug!(job = %job.key(), key = key_name, "signing key still claimed, kept");
        } else {
            self.signer.delete_key(key_name).await?;
        }
        Ok(Outcome::succeeded())
    }
}

#[async_trait]
impl Handler for SignHandler {
    async fn handle(&self, job: &Job) -> Result<Outcome, HandlerError> {
        let Claim::Sign { key_name, .. } = &job.spec.claim else {
            return Err(HandlerError::permanent(format!(
                "{} job routed to the sign handler",
                job.job_type()
            )));
        };

        if job.metadata.is_deleting() {
            return self.release(job, key_name).await;
        }
        if let Some(outcome) = settled(job) {
            return Ok(outcome);
        }

        let replication = require_target(self.replications.as_ref(), job).await?;
        self.signer.ensure_key(key_name).await?;
        for repository in replication.selected_repositories() {
            self.signer
                .sign(&replication.spec.destination, repository, key_name)
                .await?;
        }
        Ok(Outcome::succeeded())
    }
}

struct ScanStep {
    scanner: Arc<dyn Scanner>,
    registry: String,
    repository: String,
}

#[async_trait]
impl Step for ScanStep {
    fn describe(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    async fn run(&self) -> Result<(), StepError> {
        self.scanner
            .scan(&self.registry, &self.repository)
            .await
            .map_err(|e| StepError::new(e.to_string()))
    }
}

/// Scans the destination repositories on the worker pool.
///
/// The handler only submits the work; the job is completed from the task
/// result once a worker has finished it. Tasks are not persisted, so a job
/// left unfinished by a restart is simply resubmitted.
pub struct ScanHandler {
    replications: Arc<ReplicationStore>,
    scanner: Arc<dyn Scanner>,
    pool: Arc<WorkerPool>,
    jobs: JobLifecycle<JobStore>,
    in_flight: Arc<Mutex<HashMap<ObjectRef, TaskId>>>,
}

impl ScanHandler {
    pub fn new(
        replications: Arc<ReplicationStore>,
        scanner: Arc<dyn Scanner>,
        pool: Arc<WorkerPool>,
        jobs: JobLifecycle<JobStore>,
    ) -> Self {
        Self {
            replications,
            scanner,
            pool,
            jobs,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<ObjectRef, TaskId>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn running_task(&self, job: &ObjectRef) -> Option<TaskId> {
        self.lock_in_flight().get(job).copied()
    }
}

#[async_trait]
impl Handler for ScanHandler {
    async fn handle(&self, job: &Job) -> Result<Outcome, HandlerError> {
        let key = job.key();
        if job.metadata.is_deleting() {
            return Ok(match self.running_task(&key) {
                Some(task) => Outcome::waiting(format!("scan {task} still running")),
                None => Outcome::succeeded(),
            });
        }
        if let Some(outcome) = settled(job) {
            return Ok(outcome);
        }
        if self.running_task(&key).is_some() {
            return Ok(Outcome::Progressed);
        }
        // The snapshot may predate a scan that has just recorded its result.
        let stored = self
            .jobs
            .store()
            .get(&key)
            .await
            .map_err(|e| HandlerError::transient(e.to_string()))?;
        if let Some(outcome) = settled(&stored) {
            return Ok(outcome);
        }

        let replication = require_target(self.replications.as_ref(), job).await?;
        let task = replication
            .selected_repositories()
            .iter()
            .fold(Task::new(), |task, repository| {
                task.step(ScanStep {
                    scanner: Arc::clone(&self.scanner),
                    registry: replication.spec.destination.clone(),
                    repository: repository.clone(),
                })
            });

        {
            let mut in_flight = self.lock_in_flight();
            if in_flight.contains_key(&key) {
                return Ok(Outcome::Progressed);
            }
            in_flight.insert(key.clone(), task.id());
        }

        let ticket = match self.pool.submit(task).await {
            Ok(ticket) => ticket,
            Err(e) => {
                self.lock_in_flight().remove(&key);
                return Err(HandlerError::transient(e.to_string()));
            }
        };
        debug!(job = %key, task = %ticket.id(), "scan submitted");

        let jobs = self.jobs.clone();
        let in_flight = Arc::clone(&self.in_flight);
        let job = job.clone();
        tokio::spawn(async move {
            record_scan(&jobs, &job, ticket).await;
            in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&job.key());
        });

        Ok(Outcome::Progressed)
    }
}

async fn record_scan(jobs: &JobLifecycle<JobStore>, job: &Job, ticket: Ticket) {
    let (success, message) = match ticket.outcome().await {
        Ok(TaskOutcome::Succeeded { completed, .. }) => {
            (true, format!("scanned {completed} repositories"))
        }
        Ok(TaskOutcome::Failed { step, error, .. }) => {
            (false, format!("scan of {step} failed: {error}"))
        }
        Err(e) => {
            warn!(job = %job.key(), error = %e, "scan result lost, job will be resubmitted");
            return;
        }
    };
    if let Err(e) = jobs.mark_completed(job, success, message).await {
        warn!(job = %job.key(), error = %e, "recording scan result failed");
    }
}
