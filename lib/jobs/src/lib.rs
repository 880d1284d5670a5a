//! Asynchronous jobs for dockyard.
//!
//! This crate provides:
//!
//! - **Job**: the persisted unit of asynchronous work and its typed claim
//! - **Lifecycle**: the monotonic Pending → Running → Completed/Failed state
//!   machine, written through the store with optimistic concurrency
//! - **Finalizer guard**: blocks physical deletion until the owning handler
//!   has seen the deletion
//! - **TTL collector**: periodic removal of finished jobs
//! - **Dispatch**: the handler registry and the notify path
//! - **Controller**: a watch-driven reconcile loop shared by all record kinds

pub mod controller;
pub mod dispatch;
pub mod error;
pub mod finalizer;
pub mod job;
pub mod lifecycle;
pub mod ttl;

pub use controller::{Action, Controller, JobReconciler, Reconciler, watch_keys, watch_mapped};
pub use dispatch::{Dispatcher, Handler, HandlerRegistry, HandlerRegistryBuilder, NotifyOutcome};
pub use error::{DispatchError, FinalizerError, HandlerError, JobError};
pub use finalizer::{Guarded, guard};
pub use job::{Claim, JOB_FINALIZER, Job, JobSpec, JobState, JobStatus, JobType};
pub use lifecycle::JobLifecycle;
pub use ttl::{SweepReport, TtlCollector, is_expired};
