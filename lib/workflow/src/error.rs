//! Error types for the workflow crate.
//!
//! - `StageError`: returned by a pipeline stage action
//! - `PipelineError`: a failed pipeline pass, naming the stage
//! - `StepError`: returned by a worker pool step
//! - `PoolError`: worker pool misuse

use dockyard_core::TaskId;
use std::fmt;

/// Errors from a stage action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    /// The action could not be completed; retried on the next pass.
    Failed { reason: String },
}

impl StageError {
    /// Wraps any displayable failure.
    #[must_use]
    pub fn failed(reason: impl fmt::Display) -> Self {
        Self::Failed {
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { reason } => write!(f, "{reason}"),
        }
    }
}

impl std::error::Error for StageError {}

/// Errors from a pipeline pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// A ready stage failed to run.
    StageFailed { stage: &'static str, error: StageError },
    /// A disabled stage failed to clean up after itself.
    RetireFailed { stage: &'static str, error: StageError },
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StageFailed { stage, error } => write!(f, "stage {stage} failed: {error}"),
            Self::RetireFailed { stage, error } => {
                write!(f, "retiring stage {stage} failed: {error}")
            }
        }
    }
}

impl std::error::Error for PipelineError {}

/// Errors from a worker pool step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepError {
    pub message: String,
}

impl StepError {
    /// Creates a step error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for StepError {}

/// Errors from worker pool operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The pool was stopped; no task can be submitted.
    Stopped,
    /// `start` was called on a running pool.
    AlreadyStarted,
    /// `start` was asked for zero workers.
    NoWorkers,
    /// The worker running the task went away without reporting.
    OutcomeLost { task: TaskId },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "worker pool is stopped"),
            Self::AlreadyStarted => write!(f, "worker pool already started"),
            Self::NoWorkers => write!(f, "worker pool needs at least one worker"),
            Self::OutcomeLost { task } => write!(f, "outcome of {task} was lost"),
        }
    }
}

impl std::error::Error for PoolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_error_names_stage() {
        let err = PipelineError::StageFailed {
            stage: "replicate",
            error: StageError::failed("destination unreachable"),
        };
        assert_eq!(
            err.to_string(),
            "stage replicate failed: destination unreachable"
        );
    }

    #[test]
    fn pool_error_display() {
        assert_eq!(PoolError::Stopped.to_string(), "worker pool is stopped");
        assert_eq!(
            PoolError::NoWorkers.to_string(),
            "worker pool needs at least one worker"
        );
    }
}
