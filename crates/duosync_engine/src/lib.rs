//! # duosync engine
//!
//! Synchronizes two replicas of a file tree.
//!
//! This crate provides:
//! - Replica media (file system, in-memory) behind [`ReplicaMedium`]
//! - Change detection against the metadata store
//! - Delta computation and conflict resolution per session
//! - Change application with recycling of overwritten content
//! - The session state machine and a polling scheduler
//! - Tombstone garbage collection
//!
//! ## Architecture
//!
//! Each side of a pair is a [`Replica`]: a medium, a metadata store and an
//! optional recycle bin. A [`SyncOrchestrator`] runs sessions between two
//! replicas:
//! 1. Detect changes on both replicas (concurrently)
//! 2. Exchange knowledge and compute what each side is missing
//! 3. Resolve conflicts with the configured policy
//! 4. Apply remote changes locally, then local changes remotely
//! 5. Merge knowledge for what was applied
//!
//! ## Key Invariants
//!
//! - Per-item failures never abort a session; they are reported as skips
//! - Overwritten or deleted content goes to the recycle bin when enabled
//! - A skipped item is offered again in the next session
//! - Only store failures are fatal

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod applier;
mod config;
mod detector;
mod error;
mod events;
mod filter;
mod gc;
mod medium;
mod planner;
mod recycle;
mod replica;
mod scheduler;
mod session;

pub use config::{SyncConfig, SyncDirection, SyncOptions};
pub use detector::{ChangeDetector, DetectionReport};
pub use error::{ItemFailure, SkipReason, SyncError, SyncResult};
pub use events::{AppliedChange, EventBus, SkippedChange, SyncEvent, SyncListener};
pub use filter::{AllowAll, GlobFilter, GlobFilterBuilder, ScopeFilter};
pub use gc::{collect_tombstones, GcReport};
pub use medium::{hash_bytes, now_ms, FsMedium, MemoryMedium, ReplicaMedium, ScannedEntry, TEMP_SUFFIX};
pub use recycle::{DirectoryRecycleBin, MemoryRecycleBin, RecycleBin, RecycleReason, RecycledItem};
pub use replica::{DirectoryOptions, Replica, CONTROL_DIR};
pub use scheduler::SyncScheduler;
pub use session::{
    SessionReport, SessionState, SyncOrchestrator, SyncOrchestratorBuilder, SyncStats,
};

pub use duosync_protocol::ConflictPolicy;
