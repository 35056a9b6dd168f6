//! Recycle bins keep content the engine is about to destroy.

use parking_lot::RwLock;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Why content was displaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecycleReason {
    /// The file was deleted by a propagated delete.
    Deleted,
    /// The file was overwritten by a propagated update.
    PreviousOnUpdate,
    /// The file lost a conflict.
    ConflictLoser,
}

impl fmt::Display for RecycleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RecycleReason::Deleted => "deleted",
            RecycleReason::PreviousOnUpdate => "previous-on-update",
            RecycleReason::ConflictLoser => "conflict-loser",
        };
        f.write_str(text)
    }
}

/// A place to copy content before it is deleted or overwritten.
pub trait RecycleBin: Send + Sync {
    /// Stores `content` that lived at `path`. Returns where it was stored.
    fn recycle(&self, path: &str, content: &[u8], reason: RecycleReason) -> io::Result<String>;
}

/// Recycle bin backed by a directory.
///
/// Each recycled file goes to `<root>/<unix-ms>-<seq>/<path>`, so repeated
/// copies of the same path never overwrite each other.
#[derive(Debug)]
pub struct DirectoryRecycleBin {
    root: PathBuf,
    seq: AtomicU64,
}

impl DirectoryRecycleBin {
    /// Creates a bin rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            seq: AtomicU64::new(0),
        }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns every recycled copy of `path`, oldest first.
    pub fn copies_of(&self, path: &str) -> io::Result<Vec<PathBuf>> {
        let mut buckets = match fs::read_dir(&self.root) {
            Ok(entries) => entries
                .map(|entry| entry.map(|e| e.path()))
                .collect::<io::Result<Vec<_>>>()?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        buckets.sort();
        Ok(buckets
            .into_iter()
            .map(|bucket| bucket.join(path))
            .filter(|candidate| candidate.is_file())
            .collect())
    }
}

impl RecycleBin for DirectoryRecycleBin {
    fn recycle(&self, path: &str, content: &[u8], reason: RecycleReason) -> io::Result<String> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let bucket = format!("{:013}-{:06}", crate::medium::now_ms(), seq);
        let target = self.root.join(&bucket).join(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, content)?;
        tracing::debug!(path, %reason, location = %target.display(), "recycled");
        Ok(target.display().to_string())
    }
}

/// One entry of a [`MemoryRecycleBin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecycledItem {
    /// Path the content lived at.
    pub path: String,
    /// Recycled bytes.
    pub content: Vec<u8>,
    /// Why it was recycled.
    pub reason: RecycleReason,
}

/// In-memory recycle bin for tests.
#[derive(Debug, Default)]
pub struct MemoryRecycleBin {
    items: RwLock<Vec<RecycledItem>>,
    failing: RwLock<bool>,
}

impl MemoryRecycleBin {
    /// Creates an empty bin.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every recycled entry.
    pub fn items(&self) -> Vec<RecycledItem> {
        self.items.read().clone()
    }

    /// Returns the recycled contents of `path`, oldest first.
    pub fn contents_for(&self, path: &str) -> Vec<Vec<u8>> {
        self.items
            .read()
            .iter()
            .filter(|item| item.path == path)
            .map(|item| item.content.clone())
            .collect()
    }

    /// Makes every later `recycle` call fail.
    pub fn set_failing(&self, failing: bool) {
        *self.failing.write() = failing;
    }
}

impl RecycleBin for MemoryRecycleBin {
    fn recycle(&self, path: &str, content: &[u8], reason: RecycleReason) -> io::Result<String> {
        if *self.failing.read() {
            return Err(io::Error::new(io::ErrorKind::Other, "recycle bin unavailable"));
        }
        let mut items = self.items.write();
        items.push(RecycledItem {
            path: path.to_string(),
            content: content.to_vec(),
            reason,
        });
        Ok(format!("memory:{}", items.len() - 1))
    }
}
