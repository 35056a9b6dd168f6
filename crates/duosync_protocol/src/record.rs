//! Item and change records.

use crate::ids::{ItemId, ReplicaId};
use crate::version::VersionVector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Content fingerprint of a file.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    /// SHA-256 of the content.
    pub hash: [u8; 32],
    /// Size in bytes.
    pub size: u64,
    /// Modification time in milliseconds since the Unix epoch.
    pub modified_ms: u64,
}

impl Fingerprint {
    /// Creates a fingerprint.
    #[must_use]
    pub fn new(hash: [u8; 32], size: u64, modified_ms: u64) -> Self {
        Self {
            hash,
            size,
            modified_ms,
        }
    }

    /// Returns true if both fingerprints describe the same bytes.
    ///
    /// The modification time is ignored.
    #[must_use]
    pub fn same_content(&self, other: &Fingerprint) -> bool {
        self.hash == other.hash && self.size == other.size
    }

    /// Returns the first 8 bytes of the hash as hex, for logs.
    #[must_use]
    pub fn short_hex(&self) -> String {
        self.hash[..8].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Fingerprint({} size={} mtime={})",
            self.short_hex(),
            self.size,
            self.modified_ms
        )
    }
}

/// Kind of change made to an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// A new item appeared.
    Create,
    /// The item's content changed.
    Update,
    /// The item was removed.
    Delete,
    /// The item moved to a new path with unchanged content.
    Rename,
}

impl ChangeKind {
    /// Lowercase name of the kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
            ChangeKind::Rename => "rename",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata a replica keeps for one item.
///
/// Tombstones keep their last path and carry no fingerprint. Paths are
/// `/`-separated and relative to the replica root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    /// Stable item identity.
    pub item_id: ItemId,
    /// Current (or, for tombstones, last) path.
    pub path: String,
    /// Content fingerprint, `None` for tombstones.
    pub fingerprint: Option<Fingerprint>,
    /// Version of the item.
    pub version: VersionVector,
    /// Whether the item has been deleted.
    pub tombstone: bool,
    /// Replica that made the last change.
    pub last_writer: ReplicaId,
    /// Kind of the last change.
    pub last_kind: ChangeKind,
    /// When the tombstone was written locally, in Unix milliseconds.
    pub tombstoned_at_ms: Option<u64>,
    /// Medium-specific attributes.
    #[serde(default)]
    pub extras: BTreeMap<String, String>,
}

impl ItemRecord {
    /// Creates a live record.
    #[must_use]
    pub fn live(
        item_id: ItemId,
        path: impl Into<String>,
        fingerprint: Fingerprint,
        version: VersionVector,
        last_writer: ReplicaId,
        last_kind: ChangeKind,
    ) -> Self {
        Self {
            item_id,
            path: path.into(),
            fingerprint: Some(fingerprint),
            version,
            tombstone: false,
            last_writer,
            last_kind,
            tombstoned_at_ms: None,
            extras: BTreeMap::new(),
        }
    }

    /// Returns true if the item is not deleted.
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.tombstone
    }

    /// Turns this record into a tombstone at `version`.
    #[must_use]
    pub fn into_tombstone(mut self, version: VersionVector, writer: ReplicaId, at_ms: u64) -> Self {
        self.fingerprint = None;
        self.version = version;
        self.tombstone = true;
        self.last_writer = writer;
        self.last_kind = ChangeKind::Delete;
        self.tombstoned_at_ms = Some(at_ms);
        self
    }

    /// Returns true if both records are live with identical path and content.
    #[must_use]
    pub fn same_state(&self, other: &ItemRecord) -> bool {
        if self.tombstone || other.tombstone {
            return self.tombstone == other.tombstone;
        }
        self.path == other.path
            && match (&self.fingerprint, &other.fingerprint) {
                (Some(a), Some(b)) => a.same_content(b),
                _ => false,
            }
    }

    /// Sets a medium-specific attribute.
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }
}

/// A single detected or planned change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Item the change applies to.
    pub item_id: ItemId,
    /// Kind of change.
    pub kind: ChangeKind,
    /// Path before the change (Update, Delete, Rename).
    pub old_path: Option<String>,
    /// Path after the change (Create, Update, Rename).
    pub new_path: Option<String>,
    /// Item version after the change.
    pub version: VersionVector,
    /// Content after the change, `None` for Delete.
    pub fingerprint: Option<Fingerprint>,
    /// Replica the change was made on.
    pub origin: ReplicaId,
}

impl ChangeRecord {
    /// A new item at `path`.
    #[must_use]
    pub fn create(
        item_id: ItemId,
        path: impl Into<String>,
        fingerprint: Fingerprint,
        version: VersionVector,
        origin: ReplicaId,
    ) -> Self {
        Self {
            item_id,
            kind: ChangeKind::Create,
            old_path: None,
            new_path: Some(path.into()),
            version,
            fingerprint: Some(fingerprint),
            origin,
        }
    }

    /// New content for the item at `path`.
    #[must_use]
    pub fn update(
        item_id: ItemId,
        path: impl Into<String>,
        fingerprint: Fingerprint,
        version: VersionVector,
        origin: ReplicaId,
    ) -> Self {
        let path = path.into();
        Self {
            item_id,
            kind: ChangeKind::Update,
            old_path: Some(path.clone()),
            new_path: Some(path),
            version,
            fingerprint: Some(fingerprint),
            origin,
        }
    }

    /// Removal of the item at `path`.
    #[must_use]
    pub fn delete(
        item_id: ItemId,
        path: impl Into<String>,
        version: VersionVector,
        origin: ReplicaId,
    ) -> Self {
        Self {
            item_id,
            kind: ChangeKind::Delete,
            old_path: Some(path.into()),
            new_path: None,
            version,
            fingerprint: None,
            origin,
        }
    }

    /// A move from `old_path` to `new_path`.
    #[must_use]
    pub fn rename(
        item_id: ItemId,
        old_path: impl Into<String>,
        new_path: impl Into<String>,
        fingerprint: Fingerprint,
        version: VersionVector,
        origin: ReplicaId,
    ) -> Self {
        Self {
            item_id,
            kind: ChangeKind::Rename,
            old_path: Some(old_path.into()),
            new_path: Some(new_path.into()),
            version,
            fingerprint: Some(fingerprint),
            origin,
        }
    }

    /// Records that an update also moved the item from `old_path`.
    #[must_use]
    pub fn moved_from(mut self, old_path: impl Into<String>) -> Self {
        self.old_path = Some(old_path.into());
        self
    }

    /// The path the change ends at, or the removed path for deletes.
    #[must_use]
    pub fn path(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or_default()
    }

    /// Returns true if the change moves the item.
    #[must_use]
    pub fn is_move(&self) -> bool {
        matches!((&self.old_path, &self.new_path), (Some(old), Some(new)) if old != new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(byte: u8, size: u64, mtime: u64) -> Fingerprint {
        Fingerprint::new([byte; 32], size, mtime)
    }

    #[test]
    fn same_content_ignores_mtime() {
        assert!(fp(1, 10, 100).same_content(&fp(1, 10, 200)));
        assert!(!fp(1, 10, 100).same_content(&fp(2, 10, 100)));
        assert!(!fp(1, 10, 100).same_content(&fp(1, 11, 100)));
    }

    #[test]
    fn tombstone_drops_fingerprint_and_keeps_path() {
        let writer = ReplicaId::new();
        let record = ItemRecord::live(
            ItemId::new(),
            "docs/a.txt",
            fp(1, 3, 5),
            VersionVector::single(writer, 1),
            writer,
            ChangeKind::Create,
        );
        let tomb = record
            .clone()
            .into_tombstone(VersionVector::single(writer, 2), writer, 42);
        assert!(!tomb.is_live());
        assert_eq!(tomb.path, "docs/a.txt");
        assert_eq!(tomb.fingerprint, None);
        assert_eq!(tomb.last_kind, ChangeKind::Delete);
        assert_eq!(tomb.tombstoned_at_ms, Some(42));
        assert!(tomb.version.dominates(&record.version));
    }

    #[test]
    fn same_state_compares_path_and_content() {
        let writer = ReplicaId::new();
        let id = ItemId::new();
        let v = VersionVector::single(writer, 1);
        let a = ItemRecord::live(id, "a", fp(1, 1, 1), v.clone(), writer, ChangeKind::Create);
        let b = ItemRecord::live(id, "a", fp(1, 1, 9), v.clone(), writer, ChangeKind::Update);
        let c = ItemRecord::live(id, "c", fp(1, 1, 1), v, writer, ChangeKind::Rename);
        assert!(a.same_state(&b));
        assert!(!a.same_state(&c));
    }

    #[test]
    fn change_paths_per_kind() {
        let origin = ReplicaId::new();
        let id = ItemId::new();
        let v = VersionVector::single(origin, 1);

        let create = ChangeRecord::create(id, "n.txt", fp(1, 1, 1), v.clone(), origin);
        assert_eq!(create.old_path, None);
        assert_eq!(create.path(), "n.txt");

        let delete = ChangeRecord::delete(id, "n.txt", v.clone(), origin);
        assert_eq!(delete.new_path, None);
        assert_eq!(delete.path(), "n.txt");

        let rename = ChangeRecord::rename(id, "a.txt", "b.txt", fp(1, 1, 1), v.clone(), origin);
        assert!(rename.is_move());
        assert_eq!(rename.path(), "b.txt");

        let update = ChangeRecord::update(id, "b.txt", fp(2, 1, 1), v, origin);
        assert!(!update.is_move());
        assert!(update.moved_from("a.txt").is_move());
    }

    #[test]
    fn kind_names() {
        assert_eq!(ChangeKind::Create.to_string(), "create");
        assert_eq!(ChangeKind::Rename.as_str(), "rename");
    }
}
