//! Replica knowledge.

use crate::ids::{ItemId, ReplicaId};
use crate::version::VersionVector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Everything a replica has observed.
///
/// The `vector` is the replica-wide high-water mark per originating replica.
/// Because a session may fail to apply some items, a plain vector would
/// over-claim: `exceptions` lists item versions this replica has *not*
/// learned even though `vector` covers them. An exception is cleared as soon
/// as a record for that item covering the excepted version is stored.
///
/// # Invariants
///
/// - `vector` covers the version of every record the replica stores
/// - `vector` never decreases
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Knowledge {
    /// High-water mark per originating replica.
    pub vector: VersionVector,
    /// Item versions not learned despite being covered by `vector`.
    #[serde(with = "exception_pairs")]
    pub exceptions: BTreeMap<ItemId, VersionVector>,
}

impl Knowledge {
    /// Creates empty knowledge.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates knowledge from a vector with no exceptions.
    #[must_use]
    pub fn from_vector(vector: VersionVector) -> Self {
        Self {
            vector,
            exceptions: BTreeMap::new(),
        }
    }

    /// Returns true if this replica already knows `version` of `item`.
    #[must_use]
    pub fn knows(&self, item: ItemId, version: &VersionVector) -> bool {
        if !self.vector.covers(version) {
            return false;
        }
        match self.exceptions.get(&item) {
            Some(missing) => !version.covers(missing),
            None => true,
        }
    }

    /// Merges a version this replica now holds into the vector.
    pub fn observe(&mut self, version: &VersionVector) {
        self.vector.merge_in(version);
    }

    /// Returns the next own tick for `replica` and records it.
    pub fn tick(&mut self, replica: ReplicaId) -> u64 {
        let next = self.vector.get(replica) + 1;
        self.vector.set(replica, next);
        next
    }

    /// Raises the own component for `replica` to `tick`.
    pub fn advance(&mut self, replica: ReplicaId, tick: u64) {
        self.vector.set(replica, tick);
    }

    /// Records that `version` of `item` was offered but not learned.
    ///
    /// Keeps the older excepted version when one already exists, so the
    /// item is re-offered from the earliest version that was missed.
    pub fn add_exception(&mut self, item: ItemId, version: VersionVector) {
        self.exceptions
            .entry(item)
            .and_modify(|existing| {
                if existing.covers(&version) {
                    *existing = version.clone();
                }
            })
            .or_insert(version);
    }

    /// Drops the exception for `item` if `version` supersedes it.
    pub fn clear_exception_if_covered(&mut self, item: ItemId, version: &VersionVector) {
        if let Some(missing) = self.exceptions.get(&item) {
            if version.covers(missing) {
                self.exceptions.remove(&item);
            }
        }
    }

    /// Absorbs another replica's knowledge at the end of a session.
    ///
    /// The other side's exceptions are inherited unless this side already
    /// knew those versions before the merge.
    pub fn absorb(&mut self, other: &Knowledge) {
        let inherited: Vec<(ItemId, VersionVector)> = other
            .exceptions
            .iter()
            .filter(|(item, version)| !self.knows(**item, version))
            .map(|(item, version)| (*item, version.clone()))
            .collect();

        self.vector.merge_in(&other.vector);
        for (item, version) in inherited {
            self.add_exception(item, version);
        }
    }

    /// Returns true if `other` adds nothing to this knowledge.
    #[must_use]
    pub fn contains(&self, other: &Knowledge) -> bool {
        self.vector.covers(&other.vector)
            && other
                .exceptions
                .iter()
                .all(|(item, version)| self.exceptions.get(item).is_some_and(|v| v == version))
    }
}

mod exception_pairs {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<ItemId, VersionVector>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let pairs: Vec<(&ItemId, &VersionVector)> = map.iter().collect();
        pairs.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<ItemId, VersionVector>, D::Error> {
        let pairs: Vec<(ItemId, VersionVector)> = Vec::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}
