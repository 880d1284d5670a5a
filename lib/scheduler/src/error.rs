//! Error types for the scheduler crate.
//!
//! - `ScheduleError`: cron parsing and missed-firing computation
//! - `SchedulerError`: a failed CronJob sync; lifted into a rootcause
//!   `Report` at the public boundary

use dockyard_core::ObjectRef;
use dockyard_jobs::JobError;
use dockyard_store::StoreError;
use std::fmt;

/// Errors from schedule operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// Invalid cron expression.
    InvalidCronExpression { expression: String, reason: String },
    /// The expression has no further occurrence.
    EvaluationFailed { expression: String, reason: String },
    /// More firings were missed than the catch-up cap allows.
    TooManyMissed { cap: usize },
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCronExpression { expression, reason } => {
                write!(f, "invalid cron expression '{expression}': {reason}")
            }
            Self::EvaluationFailed { expression, reason } => {
                write!(f, "evaluating '{expression}' failed: {reason}")
            }
            Self::TooManyMissed { cap } => {
                write!(f, "too many unstarted schedules (more than {cap})")
            }
        }
    }
}

impl std::error::Error for ScheduleError {}

/// Errors from syncing a CronJob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// The schedule could not be evaluated.
    Schedule(ScheduleError),
    /// The CronJob has neither a last firing nor a creation time.
    MissingReferenceTime { cron_job: ObjectRef },
    /// Creating the job failed.
    JobCreation(JobError),
    /// Reading or writing the CronJob failed.
    Store(StoreError),
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Schedule(e) => write!(f, "{e}"),
            Self::MissingReferenceTime { cron_job } => write!(
                f,
                "cronjob {cron_job} has no last scheduled time or creation time"
            ),
            Self::JobCreation(e) => write!(f, "creating scheduled job failed: {e}"),
            Self::Store(e) => write!(f, "cronjob store error: {e}"),
        }
    }
}

impl std::error::Error for SchedulerError {}

impl From<ScheduleError> for SchedulerError {
    fn from(e: ScheduleError) -> Self {
        Self::Schedule(e)
    }
}

impl From<JobError> for SchedulerError {
    fn from(e: JobError) -> Self {
        Self::JobCreation(e)
    }
}

impl From<StoreError> for SchedulerError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_error_display() {
        let err = ScheduleError::InvalidCronExpression {
            expression: "invalid".to_string(),
            reason: "expected 5 fields, got 1".to_string(),
        };
        assert!(err.to_string().contains("invalid"));
        assert!(err.to_string().contains("5 fields"));
    }

    #[test]
    fn cap_error_is_passed_through() {
        let err = SchedulerError::from(ScheduleError::TooManyMissed { cap: 100 });
        assert_eq!(
            err.to_string(),
            "too many unstarted schedules (more than 100)"
        );
    }
}
