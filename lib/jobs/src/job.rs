//! The persisted job record.

use crate::error::JobError;
use chrono::{DateTime, Utc};
use dockyard_core::{ObjectMeta, ObjectRef, Resource};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Finalizer token placed on every job by the job controller.
pub const JOB_FINALIZER: &str = "jobs.dockyard.io/finalizer";

/// The kind of work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Fetch the source registry catalog.
    Synchronize,
    /// Copy repositories from source to destination.
    Replicate,
    /// Sign replicated repositories.
    Sign,
    /// Scan repositories for vulnerabilities.
    Scan,
}

impl JobType {
    /// Every job type, in pipeline order.
    pub const ALL: [JobType; 4] = [Self::Synchronize, Self::Replicate, Self::Sign, Self::Scan];

    /// Returns the wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synchronize => "synchronize",
            Self::Replicate => "replicate",
            Self::Sign => "sign",
            Self::Scan => "scan",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a job does and against which object.
///
/// Each job type carries its own payload; the dispatcher resolves the
/// handler from the variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "jobType",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum Claim {
    /// Synchronize the catalog of the referenced replication's source.
    Synchronize { handle_object: ObjectRef },
    /// Replicate the referenced replication's repositories.
    Replicate { handle_object: ObjectRef },
    /// Sign the referenced replication's repositories with the named key.
    Sign {
        handle_object: ObjectRef,
        key_name: String,
    },
    /// Scan the referenced replication's destination repositories.
    Scan { handle_object: ObjectRef },
}

impl Claim {
    /// Returns the job type of this claim.
    #[must_use]
    pub fn job_type(&self) -> JobType {
        match self {
            Self::Synchronize { .. } => JobType::Synchronize,
            Self::Replicate { .. } => JobType::Replicate,
            Self::Sign { .. } => JobType::Sign,
            Self::Scan { .. } => JobType::Scan,
        }
    }

    /// Returns the object the job acts on.
    #[must_use]
    pub fn target(&self) -> &ObjectRef {
        match self {
            Self::Synchronize { handle_object }
            | Self::Replicate { handle_object }
            | Self::Sign { handle_object, .. }
            | Self::Scan { handle_object } => handle_object,
        }
    }
}

/// Desired work, as written by the creator of the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    /// Higher runs first where a handler has a choice.
    #[serde(default)]
    pub priority: u32,
    /// Retention after completion in seconds: 0 deletes right away, a
    /// negative value keeps the job forever.
    #[serde(default)]
    pub ttl: i64,
    /// The claimed work.
    pub claim: Claim,
}

impl JobSpec {
    /// Creates a spec with default priority and immediate deletion on
    /// completion.
    #[must_use]
    pub fn new(claim: Claim) -> Self {
        Self {
            priority: 0,
            ttl: 0,
            claim,
        }
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the retention in seconds.
    #[must_use]
    pub fn with_ttl(mut self, ttl: i64) -> Self {
        self.ttl = ttl;
        self
    }

    /// Validates fields the type system does not cover.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSpec` if the claim has no target or a sign claim has
    /// no key.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.claim.target().name.trim().is_empty() {
            return Err(JobError::InvalidSpec {
                reason: format!("{} claim has no target object", self.claim.job_type()),
            });
        }
        if let Claim::Sign { key_name, .. } = &self.claim
            && key_name.trim().is_empty()
        {
            return Err(JobError::InvalidSpec {
                reason: "sign claim has no key name".to_string(),
            });
        }
        Ok(())
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Created, not yet picked up.
    #[default]
    Pending,
    /// A handler is working on it.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
}

impl JobState {
    /// Returns true for `Completed` and `Failed`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    /// Returns true if moving from `self` to `next` only moves forward.
    #[must_use]
    pub fn can_transition_to(&self, next: JobState) -> bool {
        next.rank() > self.rank()
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Observed progress of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    #[serde(default)]
    pub state: JobState,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    /// Set exactly when `state` is terminal.
    #[serde(default)]
    pub completion_time: Option<DateTime<Utc>>,
}

/// A unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub metadata: ObjectMeta,
    #[serde(rename = "jobSpec")]
    pub spec: JobSpec,
    #[serde(default)]
    pub status: JobStatus,
}

impl Job {
    /// Creates a pending job with the given key.
    #[must_use]
    pub fn new(key: &ObjectRef, spec: JobSpec) -> Self {
        Self {
            metadata: ObjectMeta::for_key(key),
            spec,
            status: JobStatus::default(),
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> JobState {
        self.status.state
    }

    /// Returns true if the job has finished.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.state.is_terminal()
    }

    /// Returns the claimed job type.
    #[must_use]
    pub fn job_type(&self) -> JobType {
        self.spec.claim.job_type()
    }

    /// Returns the claimed target object.
    #[must_use]
    pub fn target(&self) -> &ObjectRef {
        self.spec.claim.target()
    }
}

impl Resource for Job {
    const KIND: &'static str = "Job";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
