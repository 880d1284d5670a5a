//! Deletion of finished jobs once their retention has elapsed.

use crate::error::JobError;
use crate::job::Job;
use chrono::{DateTime, Duration, Utc};
use dockyard_store::Store;
use rootcause::Report;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Returns true if `job` has finished and its retention has run out at `now`.
///
/// A negative ttl keeps the job forever and a zero ttl expires it as soon as
/// it completes. A terminal job without a completion time never expires.
#[must_use]
pub fn is_expired(job: &Job, now: DateTime<Utc>) -> bool {
    if !job.is_terminal() {
        return false;
    }
    let Some(completed) = job.status.completion_time else {
        return false;
    };
    match job.spec.ttl {
        ttl if ttl < 0 => false,
        0 => true,
        ttl => now > completed + Duration::seconds(ttl),
    }
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Jobs looked at.
    pub examined: usize,
    /// Jobs a deletion was requested for.
    pub deleted: usize,
    /// Jobs whose deletion failed and will be retried next sweep.
    pub failed: usize,
}

/// Periodically deletes expired jobs.
///
/// Deletion goes through the store, so a job still carrying its finalizer
/// stays until the job controller has run the cleanup notification.
pub struct TtlCollector<S: ?Sized> {
    store: Arc<S>,
}

impl<S: Store<Job> + ?Sized> TtlCollector<S> {
    /// Creates a collector over the given store.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Requests deletion of every expired job.
    ///
    /// A failure on one job is logged and does not stop the sweep.
    ///
    /// # Errors
    ///
    /// Returns an error only if the jobs could not be listed.
    #[instrument(skip(self))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, Report<JobError>> {
        let jobs = self.store.list().await.map_err(JobError::from)?;
        let mut report = SweepReport::default();

        for job in jobs {
            report.examined += 1;
            if job.metadata.is_deleting() || !is_expired(&job, now) {
                continue;
            }

            match self.store.delete(&job).await {
                Ok(()) => {
                    report.deleted += 1;
                    debug!(job = %job.metadata.key(), ttl = job.spec.ttl, "expired job deleted");
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    report.failed += 1;
                    warn!(job = %job.metadata.key(), error = %e, "failed to delete expired job");
                }
            }
        }

        if report.deleted > 0 || report.failed > 0 {
            info!(
                examined = report.examined,
                deleted = report.deleted,
                failed = report.failed,
                "ttl sweep finished"
            );
        }
        Ok(report)
    }

    /// Sweeps every `interval` until `shutdown` is cancelled.
    pub async fn run(&self, interval: std::time::Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("ttl collector shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(report) = self.sweep(Utc::now()).await {
                        warn!(error = %report, "ttl sweep failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Claim, JOB_FINALIZER, JobSpec, JobState};
    use crate::lifecycle::JobLifecycle;
    use dockyard_core::{ObjectRef, Resource};
    use dockyard_store::MemoryStore;

    fn claim() -> Claim {
        Claim::Replicate {
            handle_object: ObjectRef::new("mirror"),
        }
    }

    fn finished(ttl: i64, completed: DateTime<Utc>) -> Job {
        let mut job = Job::new(
            &ObjectRef::new("replicate-1"),
            JobSpec::new(claim()).with_ttl(ttl),
        );
        job.status.state = JobState::Completed;
        job.status.completion_time = Some(completed);
        job
    }

    #[test]
    fn negative_ttl_never_expires() {
        let completed = Utc::now() - Duration::days(365);
        assert!(!is_expired(&finished(-1, completed), Utc::now()));
    }

    #[test]
    fn zero_ttl_expires_on_completion() {
        let completed = Utc::now();
        assert!(is_expired(&finished(0, completed), completed));
    }

    #[test]
    fn positive_ttl_expires_strictly_after_retention() {
        let completed = Utc::now();
        let job = finished(60, completed);
        assert!(!is_expired(&job, completed + Duration::seconds(60)));
        assert!(is_expired(&job, completed + Duration::seconds(61)));
    }

    #[test]
    fn unfinished_jobs_never_expire() {
        let mut job = finished(0, Utc::now());
        job.status.state = JobState::Running;
        assert!(!is_expired(&job, Utc::now()));

        let mut job = finished(0, Utc::now());
        job.status.completion_time = None;
        assert!(!is_expired(&job, Utc::now()));
    }

    #[tokio::test]
    async fn sweep_deletes_only_expired_jobs() {
        let store = Arc::new(MemoryStore::new());
        let lifecycle = JobLifecycle::new(Arc::clone(&store));
        let collector = TtlCollector::new(Arc::clone(&store));

        let keep = lifecycle
            .create(&ObjectRef::new("keep"), claim(), 0, -1)
            .await
            .unwrap();
        lifecycle.mark_completed(&keep, true, "").await.unwrap();
        let drop_now = lifecycle
            .create(&ObjectRef::new("drop"), claim(), 0, 0)
            .await
            .unwrap();
        lifecycle.mark_completed(&drop_now, true, "").await.unwrap();
        lifecycle
            .create(&ObjectRef::new("pending"), claim(), 0, 0)
            .await
            .unwrap();

        let report = collector.sweep(Utc::now()).await.unwrap();
        assert_eq!(report.examined, 3);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.failed, 0);
        assert!(store.get(&ObjectRef::new("drop")).await.is_err());
        assert!(store.get(&ObjectRef::new("keep")).await.is_ok());
        assert!(store.get(&ObjectRef::new("pending")).await.is_ok());
    }

    #[tokio::test]
    async fn finalized_job_waits_for_cleanup() {
        let store = Arc::new(MemoryStore::new());
        let collector = TtlCollector::new(Arc::clone(&store));

        let mut job = finished(0, Utc::now());
        job.metadata.finalizers.push(JOB_FINALIZER.to_string());
        let created = store.create(job).await.unwrap();

        let report = collector.sweep(Utc::now()).await.unwrap();
        assert_eq!(report.deleted, 1);
        let held = store.get(&created.key()).await.unwrap();
        assert!(held.metadata.is_deleting());

        // A second sweep leaves the pending deletion alone.
        let report = collector.sweep(Utc::now()).await.unwrap();
        assert_eq!(report.deleted, 0);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::<Job>::new());
        let collector = TtlCollector::new(store);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        collector
            .run(std::time::Duration::from_millis(10), shutdown)
            .await;
    }
}
