//! The result of one evaluation of a job handler or pipeline stage.
//!
//! Retry-versus-terminal is decided from this value alone: callers never
//! diff stored state to work out whether another pass is needed.

use serde::{Deserialize, Serialize};

/// Final verdict of a unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// The work finished successfully.
    Succeeded,
    /// The work finished and failed permanently.
    Failed {
        /// Why the work failed.
        reason: String,
    },
}

impl Verdict {
    /// Returns true for `Succeeded`.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Outcome of evaluating a handler or stage once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// Work was started or advanced but is not finished.
    Progressed,
    /// A prerequisite is not met yet; nothing was done.
    WaitingOnDependency {
        /// What is being waited on.
        reason: String,
    },
    /// The work reached a final verdict.
    Terminal(Verdict),
}

impl Outcome {
    /// Shorthand for a waiting outcome.
    #[must_use]
    pub fn waiting(reason: impl Into<String>) -> Self {
        Self::WaitingOnDependency {
            reason: reason.into(),
        }
    }

    /// Shorthand for a successful terminal outcome.
    #[must_use]
    pub fn succeeded() -> Self {
        Self::Terminal(Verdict::Succeeded)
    }

    /// Shorthand for a failed terminal outcome.
    #[must_use]
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Terminal(Verdict::Failed {
            reason: reason.into(),
        })
    }

    /// Returns true if the caller should evaluate again later.
    #[must_use]
    pub fn needs_retry(&self) -> bool {
        !matches!(self, Self::Terminal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_terminal_outcomes_stop_retrying() {
        assert!(Outcome::Progressed.needs_retry());
        assert!(Outcome::waiting("sync not finished").needs_retry());
        assert!(!Outcome::succeeded().needs_retry());
        assert!(!Outcome::failed("boom").needs_retry());
    }

    #[test]
    fn verdict_success() {
        assert!(Verdict::Succeeded.is_success());
        assert!(
            !Verdict::Failed {
                reason: "x".to_string()
            }
            .is_success()
        );
    }
}
