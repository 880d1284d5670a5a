//! Core domain types and utilities for dockyard.
//!
//! This crate provides the foundational types shared by every dockyard crate:
//! identifiers, object metadata for stored records, and the
//! three-way outcome returned by job handlers and pipeline stages.

pub mod id;
pub mod meta;
pub mod outcome;

pub use id::{ObjectUid, ParseIdError, TaskId};
pub use meta::{ObjectMeta, ObjectRef, OwnerReference, Resource};
pub use outcome::{Outcome, Verdict};
