//! # duosync protocol
//!
//! Causality and record types shared by every duosync crate.
//!
//! This crate provides:
//! - `ReplicaId` / `ItemId` identifiers
//! - `VersionVector` and replica-wide `Knowledge`
//! - `ItemRecord` and `ChangeRecord`
//! - `Conflict` classification and `ConflictPolicy` resolution
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod ids;
mod knowledge;
mod record;
mod version;

pub use conflict::{Conflict, ConflictKind, ConflictPolicy, ConflictResolution, ConflictResolver};
pub use ids::{ItemId, ReplicaId};
pub use knowledge::Knowledge;
pub use record::{ChangeKind, ChangeRecord, Fingerprint, ItemRecord};
pub use version::{Causality, VersionVector};
