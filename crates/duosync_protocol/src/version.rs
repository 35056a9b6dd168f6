//! Version vectors.

use crate::ids::ReplicaId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Causal relation between two version vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    /// Both vectors are identical.
    Equal,
    /// The left vector happened before the right one.
    Before,
    /// The left vector happened after the right one.
    After,
    /// Neither vector dominates the other.
    Concurrent,
}

/// A mapping from replica to the most recent change tick known from it.
///
/// Missing entries read as zero, so an empty vector is "knows nothing".
/// Ticks only grow: [`VersionVector::set`] never lowers a component.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<(ReplicaId, u64)>", into = "Vec<(ReplicaId, u64)>")]
pub struct VersionVector {
    ticks: BTreeMap<ReplicaId, u64>,
}

impl VersionVector {
    /// Creates an empty vector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a vector with a single component.
    #[must_use]
    pub fn single(replica: ReplicaId, tick: u64) -> Self {
        let mut vector = Self::new();
        vector.set(replica, tick);
        vector
    }

    /// Returns the tick for a replica (zero if absent).
    #[must_use]
    pub fn get(&self, replica: ReplicaId) -> u64 {
        self.ticks.get(&replica).copied().unwrap_or(0)
    }

    /// Raises the component for `replica` to `tick`. Lower values are ignored.
    pub fn set(&mut self, replica: ReplicaId, tick: u64) {
        if tick == 0 {
            return;
        }
        let entry = self.ticks.entry(replica).or_insert(0);
        *entry = (*entry).max(tick);
    }

    /// Returns a copy with the component for `replica` incremented by one.
    #[must_use]
    pub fn tick(&self, replica: ReplicaId) -> VersionVector {
        let mut next = self.clone();
        let value = next.get(replica) + 1;
        next.ticks.insert(replica, value);
        next
    }

    /// Returns the pointwise maximum of both vectors.
    #[must_use]
    pub fn merge(&self, other: &VersionVector) -> VersionVector {
        let mut merged = self.clone();
        merged.merge_in(other);
        merged
    }

    /// Merges `other` into this vector in place.
    pub fn merge_in(&mut self, other: &VersionVector) {
        for (&replica, &tick) in &other.ticks {
            self.set(replica, tick);
        }
    }

    /// Returns true if every component is `>=` the other's.
    #[must_use]
    pub fn covers(&self, other: &VersionVector) -> bool {
        other
            .ticks
            .iter()
            .all(|(&replica, &tick)| self.get(replica) >= tick)
    }

    /// Returns true if this vector strictly dominates `other`.
    ///
    /// Every component is `>=` and at least one is strictly greater.
    #[must_use]
    pub fn dominates(&self, other: &VersionVector) -> bool {
        self.covers(other) && self != other
    }

    /// Returns true if neither vector dominates the other and they differ.
    #[must_use]
    pub fn is_concurrent_with(&self, other: &VersionVector) -> bool {
        self.compare(other) == Causality::Concurrent
    }

    /// Compares two vectors causally.
    #[must_use]
    pub fn compare(&self, other: &VersionVector) -> Causality {
        match (self.covers(other), other.covers(self)) {
            (true, true) => Causality::Equal,
            (true, false) => Causality::After,
            (false, true) => Causality::Before,
            (false, false) => Causality::Concurrent,
        }
    }

    /// Returns true if no component is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    /// Iterates over the non-zero components in replica order.
    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, u64)> + '_ {
        self.ticks.iter().map(|(&replica, &tick)| (replica, tick))
    }

    /// Sum of all components; a cheap progress indicator for logs.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.ticks.values().sum()
    }
}

impl PartialOrd for VersionVector {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match self.compare(other) {
            Causality::Equal => Some(Ordering::Equal),
            Causality::Before => Some(Ordering::Less),
            Causality::After => Some(Ordering::Greater),
            Causality::Concurrent => None,
        }
    }
}

impl fmt::Debug for VersionVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.ticks.iter().map(|(r, t)| (r.to_uuid(), t)))
            .finish()
    }
}

impl From<Vec<(ReplicaId, u64)>> for VersionVector {
    fn from(pairs: Vec<(ReplicaId, u64)>) -> Self {
        let mut vector = Self::new();
        for (replica, tick) in pairs {
            vector.set(replica, tick);
        }
        vector
    }
}

impl From<VersionVector> for Vec<(ReplicaId, u64)> {
    fn from(vector: VersionVector) -> Self {
        vector.ticks.into_iter().collect()
    }
}
