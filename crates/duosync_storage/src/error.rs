//! Error types for metadata store operations.

use duosync_protocol::ReplicaId;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for metadata store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the metadata store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The journal is corrupted before its last valid frame.
    #[error("journal corrupted: {0}")]
    Corrupted(String),

    /// A frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// The journal belongs to a different replica.
    #[error("journal belongs to replica {found}, expected {expected}")]
    ReplicaMismatch {
        /// Replica the caller opened the store for.
        expected: ReplicaId,
        /// Replica recorded in the journal header.
        found: ReplicaId,
    },

    /// Another process holds the journal lock.
    #[error("metadata store is locked: {}", .0.display())]
    Locked(PathBuf),

    /// The store has been closed.
    #[error("metadata store is closed")]
    Closed,
}

impl StoreError {
    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }

    /// Creates a codec error.
    pub fn codec(message: impl std::fmt::Display) -> Self {
        Self::Codec(message.to_string())
    }
}
