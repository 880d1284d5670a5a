//! Condition-gated pipelines.
//!
//! A pipeline is an ordered list of stages over a parent resource. Each
//! stage advertises the conditions it maintains and requires conditions of
//! earlier stages. A stage whose requirements are not all `True` is skipped
//! for this pass without side effects. The parent's phase is derived from
//! the ledger and never stored independently.

use crate::condition::{ConditionLedger, ConditionStatus};
use crate::error::{PipelineError, StageError};
use async_trait::async_trait;
use chrono::Utc;
use dockyard_core::{Outcome, Verdict};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Overall phase of a pipeline resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Processing,
    Success,
    Fail,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Processing => "Processing",
            Self::Success => "Success",
            Self::Fail => "Fail",
        };
        f.write_str(name)
    }
}

/// Derives the phase from the expected conditions.
///
/// `Fail` if any expected condition is `False`, `Success` if all are
/// `True`, `Processing` otherwise. Conditions outside `expected` are
/// ignored.
#[must_use]
pub fn derive_phase<S: AsRef<str>>(ledger: &ConditionLedger, expected: &[S]) -> Phase {
    let statuses: Vec<ConditionStatus> = expected.iter().map(|t| ledger.status(t.as_ref())).collect();
    if statuses.contains(&ConditionStatus::False) {
        Phase::Fail
    } else if statuses.iter().all(|s| *s == ConditionStatus::True) {
        Phase::Success
    } else {
        Phase::Processing
    }
}

/// The work behind a stage.
#[async_trait]
pub trait StageAction<P: Send + Sync>: Send + Sync {
    /// Whether the stage applies to this parent at all.
    fn enabled(&self, _parent: &P) -> bool {
        true
    }

    /// Performs the stage and records its conditions in `ledger`.
    ///
    /// Must be idempotent: it runs on every pass once the stage is ready.
    async fn run(&self, parent: &P, ledger: &mut ConditionLedger) -> Result<Outcome, StageError>;

    /// Removes whatever the stage created, once it is no longer enabled.
    async fn retire(&self, _parent: &P) -> Result<(), StageError> {
        Ok(())
    }
}

/// One step of a pipeline.
pub struct Stage<P: Send + Sync> {
    name: &'static str,
    advertises: Vec<String>,
    requires: Vec<String>,
    action: Arc<dyn StageAction<P>>,
}

impl<P: Send + Sync> Stage<P> {
    /// Creates a stage.
    pub fn new(name: &'static str, action: Arc<dyn StageAction<P>>) -> Self {
        Self {
            name,
            advertises: Vec::new(),
            requires: Vec::new(),
            action,
        }
    }

    /// Declares a condition this stage maintains.
    #[must_use]
    pub fn advertise(mut self, condition_type: impl Into<String>) -> Self {
        self.advertises.push(condition_type.into());
        self
    }

    /// Declares a condition that must be `True` before this stage runs.
    #[must_use]
    pub fn require(mut self, condition_type: impl Into<String>) -> Self {
        self.requires.push(condition_type.into());
        self
    }

    /// Returns the stage name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns true if every required condition is `True`.
    #[must_use]
    pub fn is_ready(&self, ledger: &ConditionLedger) -> bool {
        ledger.all_true(self.requires.as_slice())
    }
}

/// An ordered set of stages over parents of type `P`.
pub struct Pipeline<P: Send + Sync> {
    stages: Vec<Stage<P>>,
}

impl<P: Send + Sync> Default for Pipeline<P> {
    fn default() -> Self {
        Self { stages: Vec::new() }
    }
}

impl<P: Send + Sync> Pipeline<P> {
    /// Creates an empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage.
    #[must_use]
    pub fn stage(mut self, stage: Stage<P>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Returns the conditions expected for `parent`, in stage order.
    #[must_use]
    pub fn expected_conditions(&self, parent: &P) -> Vec<String> {
        self.stages
            .iter()
            .filter(|s| s.action.enabled(parent))
            .flat_map(|s| s.advertises.iter().cloned())
            .collect()
    }

    /// Derives the phase of `parent` from its ledger.
    #[must_use]
    pub fn phase(&self, parent: &P, ledger: &ConditionLedger) -> Phase {
        derive_phase(ledger, self.expected_conditions(parent).as_slice())
    }

    /// Runs one pass over all stages.
    ///
    /// The ledger is first aligned with the expected conditions, disabled
    /// stages are retired, then every ready stage runs in order. Returns
    /// true if the parent needs another pass: some stage was not ready or
    /// is still in progress.
    ///
    /// # Errors
    ///
    /// Returns the first stage failure; stages after it do not run.
    #[instrument(skip_all)]
    pub async fn reconcile_by_condition_status(
        &self,
        parent: &P,
        ledger: &mut ConditionLedger,
    ) -> Result<bool, PipelineError> {
        ledger.reconcile_expected(self.expected_conditions(parent).as_slice(), Utc::now());

        let mut needs_retry = false;
        for stage in &self.stages {
            if !stage.action.enabled(parent) {
                stage
                    .action
                    .retire(parent)
                    .await
                    .map_err(|error| PipelineError::RetireFailed {
                        stage: stage.name,
                        error,
                    })?;
                continue;
            }

            if !stage.is_ready(ledger) {
                debug!(stage = stage.name, requires = ?stage.requires, "stage not ready");
                needs_retry = true;
                continue;
            }

            let outcome = stage
                .action
                .run(parent, ledger)
                .await
                .map_err(|error| PipelineError::StageFailed {
                    stage: stage.name,
                    error,
                })?;
            match &outcome {
                Outcome::Terminal(Verdict::Failed { reason }) => {
                    debug!(stage = stage.name, %reason, "stage failed");
                }
                Outcome::Terminal(Verdict::Succeeded) => {}
                Outcome::Progressed | Outcome::WaitingOnDependency { .. } => needs_retry = true,
            }
        }
        Ok(needs_retry)
    }
}
