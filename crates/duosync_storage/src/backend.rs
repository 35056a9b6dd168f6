//! Journal backend trait definition.

use crate::error::StoreResult;

/// A byte store holding one append-only journal.
///
/// Backends are **opaque byte stores**. The metadata store owns the frame
/// format; backends do not understand records or knowledge.
///
/// # Invariants
///
/// - `append` returns the offset where data was written
/// - `read_all` returns every byte appended since the last `replace`
/// - `sync` makes all appended data durable
/// - `replace` swaps the whole content atomically: a crash leaves either
///   the old or the new content
///
/// # Implementors
///
/// - [`super::MemoryJournal`] - For testing
/// - [`super::FileJournal`] - For persistent storage
pub trait JournalBackend: Send + Sync {
    /// Reads the whole journal.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn read_all(&self) -> StoreResult<Vec<u8>>;

    /// Appends data to the end of the journal.
    ///
    /// Returns the offset where the data was written.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StoreResult<u64>;

    /// Syncs all appended data to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StoreResult<()>;

    /// Returns the current size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StoreResult<u64>;

    /// Truncates the journal to `new_size`, dropping a torn tail.
    ///
    /// # Errors
    ///
    /// Returns an error if `new_size` exceeds the current size or the
    /// truncation fails.
    fn truncate(&mut self, new_size: u64) -> StoreResult<()>;

    /// Atomically replaces the whole journal with `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if the new content cannot be written.
    fn replace(&mut self, data: &[u8]) -> StoreResult<()>;
}
