//! # duosync storage
//!
//! Durable per-replica metadata for duosync.
//!
//! The [`MetadataStore`] trait is what the sync engine sees: item records,
//! the replica's knowledge and remembered peer knowledge. [`JournalStore`]
//! implements it as an in-memory index whose every mutation is first
//! appended to a checksummed CBOR journal.
//!
//! ## Available Backends
//!
//! - [`MemoryJournal`] - For testing
//! - [`FileJournal`] - Single journal file with an advisory lock
//!
//! ## Example
//!
//! ```rust
//! use duosync_protocol::ReplicaId;
//! use duosync_storage::{memory_store, MetadataStore};
//!
//! let store = memory_store(ReplicaId::new());
//! let tick = store.allocate_tick().unwrap();
//! assert_eq!(tick, 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod frame;
mod memory;
mod store;

pub use backend::JournalBackend;
pub use error::{StoreError, StoreResult};
pub use file::FileJournal;
pub use frame::{compute_crc32, FRAME_MAGIC};
pub use memory::MemoryJournal;
pub use store::{
    memory_store, open_file_store, JournalConfig, JournalStore, MetadataStore, RecordIter,
    JOURNAL_FORMAT,
};
