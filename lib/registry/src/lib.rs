//! Registry replication for dockyard.
//!
//! This crate provides:
//!
//! - **Replication**: the resource describing a source → destination copy,
//!   optionally signed
//! - **Pipeline**: synchronize → replicate → sign stages, each backed by a
//!   job and gated on the conditions of the stage before it
//! - **Handlers**: the job handlers for synchronize, replicate, sign and scan
//! - **Collaborators**: registry, signer and scanner interfaces, with
//!   in-memory implementations

pub mod client;
pub mod error;
pub mod handlers;
pub mod memory;
pub mod reconciler;
pub mod replication;
pub mod stages;

pub use client::{RegistryClient, Scanner, Signer};
pub use error::{ClientError, ReplicationError};
pub use handlers::{
    JobStore, ReplicateHandler, ReplicationStore, ScanHandler, SignHandler, SynchronizeHandler,
};
pub use memory::{InMemoryRegistry, LocalSigner, StaticScanner};
pub use reconciler::{ReplicationReconciler, replication_triggers};
pub use replication::{REPLICATION_FINALIZER, Replication, ReplicationSpec, ReplicationStatus, SignerSpec};
pub use stages::{JobStage, condition_type, replication_pipeline, stage_job_key};
