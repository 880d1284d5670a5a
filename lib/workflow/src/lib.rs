//! Declarative workflow primitives for dockyard.
//!
//! This crate provides:
//!
//! - **Condition Ledger**: an ordered, keyed set of tri-state conditions
//!   with transition timestamps
//! - **Pipeline**: stages gated on the conditions of earlier stages, with
//!   the parent phase derived from the ledger
//! - **Worker Pool**: a fixed set of workers draining a bounded task queue

pub mod condition;
pub mod error;
pub mod pipeline;
pub mod worker;

pub use condition::{Condition, ConditionLedger, ConditionStatus};
pub use error::{PipelineError, PoolError, StageError, StepError};
pub use pipeline::{Phase, Pipeline, Stage, StageAction, derive_phase};
pub use worker::{Step, Task, TaskOutcome, Ticket, WorkerPool};
