//! Versioned record store for dockyard.
//!
//! This crate provides:
//!
//! - **Store**: the CRUD + watch interface every controller talks to, with
//!   optimistic concurrency on every write and a separate status sub-resource
//! - **Merge patches**: RFC 7386 JSON merge patch application
//! - **MemoryStore**: an in-process implementation with the same semantics

pub mod error;
pub mod memory;
pub mod merge;
pub mod store;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use merge::merge_patch;
pub use store::{MAX_CONFLICT_RETRIES, Store, WatchEvent, WatchStream, retry_on_conflict};
