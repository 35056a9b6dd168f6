//! # duosync testkit
//!
//! Test utilities for duosync.
//!
//! This crate provides:
//! - Replica fixtures (in-memory and temp-dir backed) and replica pairs
//! - A listener recording every applied and skipped change
//! - Property-based test generators using proptest
//!
//! The scenario suites live in `tests/`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use duosync_testkit::prelude::*;
//!
//! #[test]
//! fn create_propagates() {
//!     let pair = ReplicaPair::new();
//!     pair.left.write("notes.txt", "hello");
//!     pair.sync();
//!     assert_eq!(pair.right.read("notes.txt").as_deref(), Some("hello"));
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
