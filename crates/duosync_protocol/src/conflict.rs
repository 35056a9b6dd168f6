//! Conflict detection and resolution.

use crate::record::{ChangeKind, ItemRecord};
use crate::version::VersionVector;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Classification of two concurrent changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictKind {
    /// Both sides changed the item's content or path.
    UpdateUpdate,
    /// One side deleted the item, the other changed it.
    UpdateDelete,
    /// Two distinct items were created at the same path.
    CreateCreate,
    /// Both sides renamed the item to different paths.
    RenameRename,
    /// Two distinct items were moved or written to the same path, at least
    /// one of them by a rename.
    PathCollision,
}

/// A conflict between the local and remote state of an item.
///
/// For [`ConflictKind::CreateCreate`] and [`ConflictKind::PathCollision`]
/// the two records belong to different items that collide on one path;
/// otherwise they share an item id.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    /// Classification.
    pub kind: ConflictKind,
    /// Local record.
    pub local: ItemRecord,
    /// Remote record.
    pub remote: ItemRecord,
    /// Resolution (if any).
    pub resolution: Option<ConflictResolution>,
}

impl Conflict {
    /// Classifies two concurrent records of the same item.
    ///
    /// Returns `None` when the two states agree (both deleted, or the same
    /// content at the same path), which needs no resolution.
    #[must_use]
    pub fn between(local: ItemRecord, remote: ItemRecord) -> Option<Self> {
        let kind = match (local.tombstone, remote.tombstone) {
            (true, true) => return None,
            (true, false) | (false, true) => ConflictKind::UpdateDelete,
            (false, false) => {
                if local.same_state(&remote) {
                    return None;
                }
                let both_renamed = local.last_kind == ChangeKind::Rename
                    && remote.last_kind == ChangeKind::Rename;
                if both_renamed && local.path != remote.path {
                    ConflictKind::RenameRename
                } else {
                    ConflictKind::UpdateUpdate
                }
            }
        };
        Some(Self {
            kind,
            local,
            remote,
            resolution: None,
        })
    }

    /// Two different items created at the same path.
    #[must_use]
    pub fn create_create(local: ItemRecord, remote: ItemRecord) -> Self {
        Self {
            kind: ConflictKind::CreateCreate,
            local,
            remote,
            resolution: None,
        }
    }

    /// Two different items moved onto the same path.
    #[must_use]
    pub fn path_collision(local: ItemRecord, remote: ItemRecord) -> Self {
        Self {
            kind: ConflictKind::PathCollision,
            ..Self::create_create(local, remote)
        }
    }

    /// Version stamped on the surviving state: the merge of both sides.
    #[must_use]
    pub fn merged_version(&self) -> VersionVector {
        self.local.version.merge(&self.remote.version)
    }

    /// Path the conflict is reported under.
    #[must_use]
    pub fn path(&self) -> &str {
        if self.local.is_live() {
            &self.local.path
        } else {
            &self.remote.path
        }
    }

    /// Resolves the conflict with the given resolver and records the outcome.
    pub fn settle(&mut self, resolver: &dyn ConflictResolver) -> ConflictResolution {
        let resolution = resolver.resolve(self);
        self.resolution = Some(resolution);
        resolution
    }

    /// Returns true if the conflict has been resolved.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

/// Resolution for a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictResolution {
    /// Keep the local state; it is applied to the remote replica.
    KeepLocal,
    /// Accept the remote state; it is applied to the local replica.
    AcceptRemote,
    /// Leave both sides diverged.
    Skip,
}

/// Picks a winner for a conflict.
pub trait ConflictResolver: Send + Sync {
    /// Decides the conflict.
    fn resolve(&self, conflict: &Conflict) -> ConflictResolution;
}

impl<F> ConflictResolver for F
where
    F: Fn(&Conflict) -> ConflictResolution + Send + Sync,
{
    fn resolve(&self, conflict: &Conflict) -> ConflictResolution {
        self(conflict)
    }
}

/// Built-in resolution policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// The most recently modified content wins.
    ///
    /// Ties fall back to the larger size, then the larger replica id. A
    /// live item always beats a deletion. Divergent renames are skipped.
    #[default]
    NewestWins,
    /// The local side always wins.
    LocalWins,
    /// The remote side always wins.
    RemoteWins,
    /// Nothing is resolved automatically.
    Manual,
}

impl ConflictPolicy {
    /// Returns true if this policy automatically resolves conflicts.
    #[must_use]
    pub fn auto_resolves(&self) -> bool {
        !matches!(self, ConflictPolicy::Manual)
    }

    /// Name used in configuration.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::NewestWins => "newest",
            ConflictPolicy::LocalWins => "local",
            ConflictPolicy::RemoteWins => "remote",
            ConflictPolicy::Manual => "manual",
        }
    }

    fn newest(conflict: &Conflict) -> ConflictResolution {
        match conflict.kind {
            ConflictKind::RenameRename => ConflictResolution::Skip,
            ConflictKind::UpdateDelete => {
                if conflict.local.is_live() {
                    ConflictResolution::KeepLocal
                } else {
                    ConflictResolution::AcceptRemote
                }
            }
            ConflictKind::UpdateUpdate
            | ConflictKind::CreateCreate
            | ConflictKind::PathCollision => {
                match newer(&conflict.local, &conflict.remote) {
                    Ordering::Less => ConflictResolution::AcceptRemote,
                    _ => ConflictResolution::KeepLocal,
                }
            }
        }
    }
}

impl ConflictResolver for ConflictPolicy {
    fn resolve(&self, conflict: &Conflict) -> ConflictResolution {
        match self {
            ConflictPolicy::NewestWins => Self::newest(conflict),
            ConflictPolicy::LocalWins => ConflictResolution::KeepLocal,
            ConflictPolicy::RemoteWins => ConflictResolution::AcceptRemote,
            ConflictPolicy::Manual => ConflictResolution::Skip,
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "newest" | "newest-wins" => Ok(ConflictPolicy::NewestWins),
            "local" | "local-wins" => Ok(ConflictPolicy::LocalWins),
            "remote" | "remote-wins" => Ok(ConflictPolicy::RemoteWins),
            "manual" => Ok(ConflictPolicy::Manual),
            other => Err(format!("unknown conflict policy: {other}")),
        }
    }
}

/// Orders two live records by recency: mtime, then size, then writer.
fn newer(a: &ItemRecord, b: &ItemRecord) -> Ordering {
    let key = |r: &ItemRecord| {
        let (mtime, size) = r
            .fingerprint
            .map(|fp| (fp.modified_ms, fp.size))
            .unwrap_or((0, 0));
        (mtime, size, r.last_writer)
    };
    key(a).cmp(&key(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ItemId, ReplicaId};
    use crate::record::Fingerprint;

    fn local_id() -> ReplicaId {
        ReplicaId::from_bytes([1u8; 16])
    }

    fn remote_id() -> ReplicaId {
        ReplicaId::from_bytes([2u8; 16])
    }

    fn record(
        id: ItemId,
        path: &str,
        byte: u8,
        size: u64,
        mtime: u64,
        writer: ReplicaId,
        kind: ChangeKind,
    ) -> ItemRecord {
        ItemRecord::live(
            id,
            path,
            Fingerprint::new([byte; 32], size, mtime),
            VersionVector::single(writer, 2),
            writer,
            kind,
        )
    }

    #[test]
    fn agreeing_states_are_not_conflicts() {
        let id = ItemId::new();
        let a = record(id, "x", 1, 1, 10, local_id(), ChangeKind::Update);
        let b = record(id, "x", 1, 1, 20, remote_id(), ChangeKind::Update);
        assert!(Conflict::between(a.clone(), b).is_none());

        let ta = a.clone().into_tombstone(VersionVector::single(local_id(), 3), local_id(), 0);
        let tb = a.into_tombstone(VersionVector::single(remote_id(), 3), remote_id(), 0);
        assert!(Conflict::between(ta, tb).is_none());
    }

    #[test]
    fn classification() {
        let id = ItemId::new();
        let a = record(id, "x", 1, 1, 10, local_id(), ChangeKind::Update);
        let b = record(id, "x", 2, 1, 20, remote_id(), ChangeKind::Update);
        let uu = Conflict::between(a.clone(), b.clone()).unwrap();
        assert_eq!(uu.kind, ConflictKind::UpdateUpdate);
        assert_eq!(uu.merged_version().get(local_id()), 2);
        assert_eq!(uu.merged_version().get(remote_id()), 2);

        let deleted = b.into_tombstone(VersionVector::single(remote_id(), 3), remote_id(), 0);
        let ud = Conflict::between(a, deleted).unwrap();
        assert_eq!(ud.kind, ConflictKind::UpdateDelete);
        assert_eq!(ud.path(), "x");

        let ra = record(id, "left", 1, 1, 10, local_id(), ChangeKind::Rename);
        let rb = record(id, "right", 1, 1, 10, remote_id(), ChangeKind::Rename);
        let rr = Conflict::between(ra, rb).unwrap();
        assert_eq!(rr.kind, ConflictKind::RenameRename);
    }

    #[test]
    fn newest_wins_by_mtime_then_size_then_writer() {
        let id = ItemId::new();
        let older = record(id, "x", 1, 5, 10, local_id(), ChangeKind::Update);
        let newer = record(id, "x", 2, 5, 20, remote_id(), ChangeKind::Update);
        let c = Conflict::between(older.clone(), newer.clone()).unwrap();
        assert_eq!(ConflictPolicy::NewestWins.resolve(&c), ConflictResolution::AcceptRemote);
        let c = Conflict::between(newer, older).unwrap();
        assert_eq!(ConflictPolicy::NewestWins.resolve(&c), ConflictResolution::KeepLocal);

        let small = record(id, "x", 1, 5, 10, local_id(), ChangeKind::Update);
        let large = record(id, "x", 2, 9, 10, remote_id(), ChangeKind::Update);
        let c = Conflict::between(large, small).unwrap();
        assert_eq!(ConflictPolicy::NewestWins.resolve(&c), ConflictResolution::KeepLocal);

        let l = record(id, "x", 1, 5, 10, local_id(), ChangeKind::Update);
        let r = record(id, "x", 2, 5, 10, remote_id(), ChangeKind::Update);
        let c = Conflict::between(l, r).unwrap();
        assert_eq!(ConflictPolicy::NewestWins.resolve(&c), ConflictResolution::AcceptRemote);
    }

    #[test]
    fn newest_wins_keeps_live_side_and_skips_divergent_renames() {
        let id = ItemId::new();
        let live = record(id, "x", 1, 1, 10, local_id(), ChangeKind::Update);
        let dead = record(id, "x", 1, 1, 99, remote_id(), ChangeKind::Update).into_tombstone(
            VersionVector::single(remote_id(), 3),
            remote_id(),
            0,
        );
        let c = Conflict::between(live.clone(), dead.clone()).unwrap();
        assert_eq!(ConflictPolicy::NewestWins.resolve(&c), ConflictResolution::KeepLocal);
        let c = Conflict::between(dead, live).unwrap();
        assert_eq!(ConflictPolicy::NewestWins.resolve(&c), ConflictResolution::AcceptRemote);

        let ra = record(id, "left", 1, 1, 10, local_id(), ChangeKind::Rename);
        let rb = record(id, "right", 1, 1, 10, remote_id(), ChangeKind::Rename);
        let mut c = Conflict::between(ra, rb).unwrap();
        assert_eq!(c.settle(&ConflictPolicy::NewestWins), ConflictResolution::Skip);
        assert!(c.is_resolved());
    }

    #[test]
    fn fixed_policies() {
        let a = record(ItemId::new(), "x", 1, 1, 10, local_id(), ChangeKind::Create);
        let b = record(ItemId::new(), "x", 2, 1, 20, remote_id(), ChangeKind::Create);
        let c = Conflict::create_create(a, b);
        assert_eq!(ConflictPolicy::LocalWins.resolve(&c), ConflictResolution::KeepLocal);
        assert_eq!(ConflictPolicy::RemoteWins.resolve(&c), ConflictResolution::AcceptRemote);
        assert_eq!(ConflictPolicy::Manual.resolve(&c), ConflictResolution::Skip);
        assert!(!ConflictPolicy::Manual.auto_resolves());
        assert!(ConflictPolicy::default().auto_resolves());
    }

    #[test]
    fn closures_are_resolvers() {
        let a = record(ItemId::new(), "x", 1, 1, 10, local_id(), ChangeKind::Create);
        let b = record(ItemId::new(), "x", 2, 1, 20, remote_id(), ChangeKind::Create);
        let mut c = Conflict::create_create(a, b);
        let always_local = |_: &Conflict| ConflictResolution::KeepLocal;
        assert_eq!(c.settle(&always_local), ConflictResolution::KeepLocal);
    }

    #[test]
    fn path_collisions_go_to_the_newer_item() {
        let moved = record(ItemId::new(), "b", 1, 4, 10, local_id(), ChangeKind::Rename);
        let fresh = record(ItemId::new(), "b", 2, 4, 30, remote_id(), ChangeKind::Create);
        let c = Conflict::path_collision(moved.clone(), fresh.clone());
        assert_eq!(c.kind, ConflictKind::PathCollision);
        assert_eq!(c.path(), "b");
        assert_eq!(ConflictPolicy::NewestWins.resolve(&c), ConflictResolution::AcceptRemote);
        let c = Conflict::path_collision(fresh, moved);
        assert_eq!(ConflictPolicy::NewestWins.resolve(&c), ConflictResolution::KeepLocal);
    }

    #[test]
    fn policy_names_parse() {
        for policy in [
            ConflictPolicy::NewestWins,
            ConflictPolicy::LocalWins,
            ConflictPolicy::RemoteWins,
            ConflictPolicy::Manual,
        ] {
            assert_eq!(policy.as_str().parse::<ConflictPolicy>().unwrap(), policy);
        }
        assert!("coin-flip".parse::<ConflictPolicy>().is_err());
    }
}
