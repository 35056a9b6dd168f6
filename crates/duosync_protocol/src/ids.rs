//! Replica and item identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a replica.
///
/// Replica IDs are 128-bit UUIDs that are:
/// - Globally unique
/// - Immutable for the replica's lifetime
/// - Totally ordered, so lock acquisition and tie-breaks are deterministic
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId([u8; 16]);

impl ReplicaId {
    /// Creates a replica ID from raw bytes.
    #[inline]
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Creates a new random replica ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    /// Returns the raw bytes.
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Converts to a UUID.
    #[must_use]
    pub fn to_uuid(&self) -> Uuid {
        Uuid::from_bytes(self.0)
    }

    /// Parses the hyphenated UUID text form.
    pub fn parse_str(text: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(text.trim()).map(|u| Self(u.into_bytes()))
    }
}

impl Default for ReplicaId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicaId({})", self.to_uuid())
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_uuid())
    }
}

impl From<Uuid> for ReplicaId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid.into_bytes())
    }
}

/// Unique identifier for a synchronized item (a file).
///
/// Assigned when the item is first detected and never changed afterwards,
/// so it survives renames and moves.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemId([u8; 16]);

impl ItemId {
    /// Creates an item ID from raw bytes.
    #[inline]
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Creates a new random item ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    /// Returns the raw bytes.
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Converts to a UUID.
    #[must_use]
    pub fn to_uuid(&self) -> Uuid {
        Uuid::from_bytes(self.0)
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ItemId({})", self.to_uuid())
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_uuid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_ids_are_unique() {
        assert_ne!(ReplicaId::new(), ReplicaId::new());
        assert_ne!(ItemId::new(), ItemId::new());
    }

    #[test]
    fn replica_id_text_form() {
        let id = ReplicaId::parse_str("181517DE-B950-4e62-9582-56F01884288D").unwrap();
        assert_eq!(id.to_string(), "181517de-b950-4e62-9582-56f01884288d");
        assert_eq!(ReplicaId::parse_str(&id.to_string()).unwrap(), id);
        assert!(ReplicaId::parse_str("not-a-uuid").is_err());
    }

    #[test]
    fn replica_ids_order_by_bytes() {
        let low = ReplicaId::from_bytes([1u8; 16]);
        let high = ReplicaId::from_bytes([2u8; 16]);
        assert!(low < high);
    }

    #[test]
    fn debug_format_includes_uuid() {
        let id = ItemId::from_bytes([0xAB; 16]);
        let text = format!("{:?}", id);
        assert!(text.starts_with("ItemId("));
        assert!(text.contains("abababab"));
    }
}
