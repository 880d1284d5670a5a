//! Materializes due CronJob firings as jobs.
//!
//! One sync creates at most one job, for the most recent due firing, then
//! advances `lastScheduledTime`. A crash between the two writes replays the
//! same firing on the next sync, which finds the job already there.

use crate::cronjob::CronJob;
use crate::error::SchedulerError;
use crate::schedule::{CronSchedule, MAX_MISSED_SCHEDULES, most_recent_due};
use chrono::{DateTime, Utc};
use dockyard_core::{ObjectRef, Resource};
use dockyard_jobs::{Job, JobError, JobLifecycle};
use dockyard_store::{Store, retry_on_conflict};
use rootcause::Report;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Result of a successful sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// No firing is due yet.
    NotDue,
    /// A job was created for the most recent due firing.
    Created(ObjectRef),
    /// The job for the most recent due firing already existed.
    AlreadyCreated(ObjectRef),
}

/// Syncs CronJobs against the clock.
pub struct CronJobScheduler<C: ?Sized, J: ?Sized> {
    cron_jobs: Arc<C>,
    lifecycle: JobLifecycle<J>,
}

impl<C, J> CronJobScheduler<C, J>
where
    C: Store<CronJob> + ?Sized,
    J: Store<Job> + ?Sized,
{
    /// Creates a scheduler.
    pub fn new(cron_jobs: Arc<C>, lifecycle: JobLifecycle<J>) -> Self {
        Self {
            cron_jobs,
            lifecycle,
        }
    }

    /// Creates the job for the most recent firing due at `now`, if any.
    ///
    /// A failure is also written to the CronJob's `status.message`; a
    /// successful sync clears it.
    ///
    /// # Errors
    ///
    /// Returns an error for an unparseable schedule, more than
    /// [`MAX_MISSED_SCHEDULES`] missed firings (no job is created), a
    /// CronJob without reference time, or a store failure.
    #[instrument(skip(self, cron_job), fields(cron_job = %cron_job.key()))]
    pub async fn sync(
        &self,
        cron_job: &CronJob,
        now: DateTime<Utc>,
    ) -> Result<SyncOutcome, Report<SchedulerError>> {
        match self.try_sync(cron_job, now).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(error = %e, "cronjob sync failed");
                self.record_message(cron_job, e.to_string()).await;
                Err(e.into())
            }
        }
    }

    async fn try_sync(
        &self,
        cron_job: &CronJob,
        now: DateTime<Utc>,
    ) -> Result<SyncOutcome, SchedulerError> {
        let last = cron_job
            .status
            .last_scheduled_time
            .or(cron_job.metadata.creation_timestamp)
            .ok_or_else(|| SchedulerError::MissingReferenceTime {
                cron_job: cron_job.key(),
            })?;
        let schedule = CronSchedule::parse(&cron_job.spec.schedule)?;

        let Some(due) = most_recent_due(&schedule, last, now, MAX_MISSED_SCHEDULES)? else {
            debug!(%last, "no firing due");
            return Ok(SyncOutcome::NotDue);
        };

        let key = cron_job.job_key(due);
        let mut job = Job::new(&key, cron_job.spec.job_template.clone());
        if let Some(owner) = cron_job.owner_reference() {
            job.metadata.owner_references.push(owner);
        }

        let outcome = match self.lifecycle.create_job(job).await {
            Ok(_) => {
                info!(job = %key, %due, "scheduled job created");
                SyncOutcome::Created(key)
            }
            Err(JobError::Store(e)) if e.is_already_exists() => {
                debug!(job = %key, "scheduled job already exists");
                SyncOutcome::AlreadyCreated(key)
            }
            Err(e) => return Err(e.into()),
        };

        self.mark_scheduled(cron_job, now).await?;
        Ok(outcome)
    }

    /// Advances `lastScheduledTime` to `now` and clears the message.
    async fn mark_scheduled(&self, cron_job: &CronJob, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        let store = self.cron_jobs.as_ref();
        retry_on_conflict(store, cron_job, |current: CronJob| async move {
            let stamp = match current.status.last_scheduled_time {
                Some(previous) if previous > now => previous,
                _ => now,
            };
            store
                .patch_status(
                    &current,
                    json!({"status": {"lastScheduledTime": stamp, "message": ""}}),
                )
                .await
                .map(|_| ())
        })
        .await?;
        Ok(())
    }

    async fn record_message(&self, cron_job: &CronJob, message: String) {
        let store = self.cron_jobs.as_ref();
        let written = retry_on_conflict(store, cron_job, |current: CronJob| {
            let message = message.clone();
            async move {
                if current.status.message == message {
                    return Ok(());
                }
                store
                    .patch_status(&current, json!({"status": {"message": message}}))
                    .await
                    .map(|_| ())
            }
        })
        .await;
        if let Err(e) = written {
            warn!(error = %e, "failed to record cronjob sync error");
        }
    }

    /// Syncs every CronJob not under deletion.
    ///
    /// Returns the number of jobs created. A failing CronJob does not stop
    /// the others.
    ///
    /// # Errors
    ///
    /// Returns an error only if the CronJobs could not be listed.
    pub async fn sync_all(&self, now: DateTime<Utc>) -> Result<usize, Report<SchedulerError>> {
        let cron_jobs = self
            .cron_jobs
            .list()
            .await
            .map_err(SchedulerError::from)?;

        let mut created = 0;
        for cron_job in cron_jobs.iter().filter(|c| !c.metadata.is_deleting()) {
            if let Ok(SyncOutcome::Created(_)) = self.sync(cron_job, now).await {
                created += 1;
            }
        }
        Ok(created)
    }

    /// Syncs all CronJobs every `interval` until `shutdown` is cancelled.
    pub async fn run(&self, interval: std::time::Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("cronjob scheduler shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(report) = self.sync_all(Utc::now()).await {
                        warn!(error = %report, "cronjob sync pass failed");
                    }
                }
            }
        }
    }
}
