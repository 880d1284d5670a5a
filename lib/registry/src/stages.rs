//! The replication pipeline: synchronize, then replicate, then sign.
//!
//! Each stage owns one job named after the replication and the stage, and
//! mirrors that job's state into three conditions: `<Stage>Exist`,
//! `<Stage>Processing` and `<Stage>Success`.

use crate::handlers::JobStore;
use crate::replication::Replication;
use async_trait::async_trait;
use chrono::Utc;
use dockyard_core::{ObjectRef, Outcome, Resource};
use dockyard_jobs::{Claim, Job, JobError, JobLifecycle, JobSpec, JobState, JobType};
use dockyard_store::Store;
use dockyard_workflow::{ConditionLedger, ConditionStatus, Pipeline, Stage, StageAction, StageError};
use std::sync::Arc;
use tracing::{debug, info};

pub const EXIST: &str = "Exist";
pub const PROCESSING: &str = "Processing";
pub const SUCCESS: &str = "Success";

/// Returns the condition type for an aspect of a stage, e.g.
/// `ReplicateSuccess`.
#[must_use]
pub fn condition_type(job_type: JobType, aspect: &str) -> String {
    let stage = match job_type {
        JobType::Synchronize => "Synchronize",
        JobType::Replicate => "Replicate",
        JobType::Sign => "Sign",
        JobType::Scan => "Scan",
    };
    format!("{stage}{aspect}")
}

/// Returns the key of the job a stage owns for `replication`.
#[must_use]
pub fn stage_job_key(replication: &Replication, job_type: JobType) -> ObjectRef {
    replication
        .key()
        .sibling(format!("{}-{job_type}", replication.metadata.name))
}

/// A stage backed by one job.
pub struct JobStage {
    job_type: JobType,
    jobs: JobLifecycle<JobStore>,
}

impl JobStage {
    pub fn new(job_type: JobType, jobs: JobLifecycle<JobStore>) -> Self {
        Self { job_type, jobs }
    }

    fn claim(&self, replication: &Replication) -> Result<Claim, StageError> {
        let handle_object = replication.key();
        Ok(match self.job_type {
            JobType::Synchronize => Claim::Synchronize { handle_object },
            JobType::Replicate => Claim::Replicate { handle_object },
            JobType::Sign => Claim::Sign {
                handle_object,
                key_name: replication
                    .signing_key()
                    .ok_or_else(|| StageError::failed("no signer requested"))?
                    .to_string(),
            },
            JobType::Scan => Claim::Scan { handle_object },
        })
    }

    async fn find(&self, key: &ObjectRef) -> Result<Option<Job>, StageError> {
        match self.jobs.store().get(key).await {
            Ok(job) => Ok(Some(job)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(StageError::failed(e)),
        }
    }

    /// Creates the stage job; a job created concurrently is read back.
    async fn create(&self, replication: &Replication, key: &ObjectRef) -> Result<Job, StageError> {
        // Kept until the replication goes, so the ledger can be rebuilt.
        let spec = JobSpec::new(self.claim(replication)?).with_ttl(-1);
        let mut job = Job::new(key, spec);
        job.metadata
            .owner_references
            .extend(replication.owner_reference());

        match self.jobs.create_job(job).await {
            Ok(job) => Ok(job),
            Err(JobError::Store(e)) if e.is_already_exists() => {
                self.jobs.store().get(key).await.map_err(StageError::failed)
            }
            Err(e) => Err(StageError::failed(e)),
        }
    }

    async fn delete(&self, job: &Job) -> Result<(), StageError> {
        if job.metadata.is_deleting() {
            return Ok(());
        }
        match self.jobs.store().delete(job).await {
            Ok(()) => {
                info!(job = %job.key(), "stage job retired");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(StageError::failed(e)),
        }
    }

    /// Retires a job whose claim no longer matches the replication; the
    /// replacement is created once the old job is gone.
    async fn supersede(&self, job: &Job, ledger: &mut ConditionLedger) -> Result<Outcome, StageError> {
        self.delete(job).await?;
        let reason = format!("job {} superseded", job.key());
        let now = Utc::now();
        for aspect in [EXIST, PROCESSING, SUCCESS] {
            ledger.set(
                &condition_type(self.job_type, aspect),
                ConditionStatus::Unknown,
                reason.clone(),
                now,
            );
        }
        Ok(Outcome::waiting(reason))
    }

    fn record(&self, job: &Job, ledger: &mut ConditionLedger) -> Outcome {
        let now = Utc::now();
        let key = job.key();
        let processing = condition_type(self.job_type, PROCESSING);
        let success = condition_type(self.job_type, SUCCESS);

        ledger.set(
            &condition_type(self.job_type, EXIST),
            ConditionStatus::True,
            format!("job {key} created"),
            now,
        );
        match job.state() {
            JobState::Pending => {
                ledger.set(&processing, ConditionStatus::Unknown, "job pending", now);
                ledger.set(&success, ConditionStatus::Unknown, "", now);
                Outcome::waiting(format!("job {key} pending"))
            }
            JobState::Running => {
                ledger.set(&processing, ConditionStatus::True, "job running", now);
                ledger.set(&success, ConditionStatus::Unknown, "", now);
                Outcome::Progressed
            }
            JobState::Completed => {
                ledger.set(&processing, ConditionStatus::True, "job running", now);
                ledger.set(&success, ConditionStatus::True, "job completed", now);
                Outcome::succeeded()
            }
            JobState::Failed => {
                ledger.set(&processing, ConditionStatus::True, "job running", now);
                ledger.set(&success, ConditionStatus::False, job.status.message.clone(), now);
                Outcome::failed(job.status.message.clone())
            }
        }
    }
}

#[async_trait]
impl StageAction<Replication> for JobStage {
    fn enabled(&self, replication: &Replication) -> bool {
        self.job_type != JobType::Sign || replication.signing_key().is_some()
    }

    async fn run(
        &self,
        replication: &Replication,
        ledger: &mut ConditionLedger,
    ) -> Result<Outcome, StageError> {
        let key = stage_job_key(replication, self.job_type);
        let claim = self.claim(replication)?;
        let job = match self.find(&key).await? {
            Some(job) if job.spec.claim != claim => {
                debug!(job = %key, "stage job claim changed");
                return self.supersede(&job, ledger).await;
            }
            Some(job) => job,
            None if ledger.is_true(&condition_type(self.job_type, SUCCESS)) => {
                debug!(job = %key, "stage job gone after success");
                return Ok(Outcome::succeeded());
            }
            None => self.create(replication, &key).await?,
        };
        Ok(self.record(&job, ledger))
    }

    async fn retire(&self, replication: &Replication) -> Result<(), StageError> {
        let key = stage_job_key(replication, self.job_type);
        match self.find(&key).await? {
            Some(job) => self.delete(&job).await,
            None => Ok(()),
        }
    }
}

/// Builds the replication pipeline over the given job lifecycle.
#[must_use]
pub fn replication_pipeline(jobs: &JobLifecycle<JobStore>) -> Pipeline<Replication> {
    let stage = |job_type: JobType| {
        let action: Arc<dyn StageAction<Replication>> =
            Arc::new(JobStage::new(job_type, jobs.clone()));
        Stage::new(job_type.as_str(), action)
            .advertise(condition_type(job_type, EXIST))
            .advertise(condition_type(job_type, PROCESSING))
            .advertise(condition_type(job_type, SUCCESS))
    };

    Pipeline::new()
        .stage(stage(JobType::Synchronize))
        .stage(stage(JobType::Replicate).require(condition_type(JobType::Synchronize, SUCCESS)))
        .stage(stage(JobType::Sign).require(condition_type(JobType::Replicate, SUCCESS)))
}
