//! Property-based test generators using proptest.
//!
//! Provides strategies for causality types and for sequences of user edits
//! on a replica.

use crate::fixtures::TestReplica;
use duosync_protocol::{ItemId, Knowledge, ReplicaId, VersionVector};
use proptest::prelude::*;

/// A fixed set of replica ids, so generated vectors overlap.
pub const REPLICAS: [ReplicaId; 3] = [
    ReplicaId::from_bytes([1; 16]),
    ReplicaId::from_bytes([2; 16]),
    ReplicaId::from_bytes([3; 16]),
];

/// Strategy for generating replica ids.
pub fn replica_id_strategy() -> impl Strategy<Value = ReplicaId> {
    prop::array::uniform16(any::<u8>()).prop_map(ReplicaId::from_bytes)
}

/// Strategy for generating item ids.
pub fn item_id_strategy() -> impl Strategy<Value = ItemId> {
    prop::array::uniform16(any::<u8>()).prop_map(ItemId::from_bytes)
}

/// Strategy for version vectors over [`REPLICAS`].
pub fn version_vector_strategy() -> impl Strategy<Value = VersionVector> {
    prop::array::uniform3(0u64..8).prop_map(|ticks| {
        let mut vector = VersionVector::new();
        for (replica, tick) in REPLICAS.iter().zip(ticks) {
            vector.set(*replica, tick);
        }
        vector
    })
}

/// Strategy for knowledge with a few exceptions.
pub fn knowledge_strategy() -> impl Strategy<Value = Knowledge> {
    (
        version_vector_strategy(),
        prop::collection::vec((item_id_strategy(), version_vector_strategy()), 0..3),
    )
        .prop_map(|(vector, exceptions)| {
            let mut knowledge = Knowledge::from_vector(vector);
            for (item, version) in exceptions {
                knowledge.add_exception(item, version);
            }
            knowledge
        })
}

/// A user edit on one replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOp {
    /// Create or overwrite a file.
    Write {
        /// Path.
        path: String,
        /// New content.
        content: String,
    },
    /// Overwrite a file if it exists.
    Update {
        /// Path.
        path: String,
        /// New content.
        content: String,
    },
    /// Delete a file if it exists.
    Remove {
        /// Path.
        path: String,
    },
    /// Move a file if the source exists and the target does not.
    Rename {
        /// Current path.
        from: String,
        /// New path.
        to: String,
    },
}

impl FileOp {
    /// Applies the edit; edits that do not fit the current files are
    /// ignored.
    pub fn apply(&self, replica: &TestReplica) {
        match self {
            FileOp::Write { path, content } => replica.write(path, content),
            FileOp::Update { path, content } => {
                if replica.medium.file(path).is_some() {
                    replica.write(path, content);
                }
            }
            FileOp::Remove { path } => {
                replica.medium.remove_file(path);
            }
            FileOp::Rename { from, to } => {
                if replica.medium.file(to).is_none() {
                    replica.medium.move_file(from, to);
                }
            }
        }
    }
}

/// Strategy for a path written in `round`, from a small namespace.
pub fn path_strategy(prefix: &'static str, round: u8) -> impl Strategy<Value = String> {
    (0u8..3).prop_map(move |n| format!("{prefix}{round}-{n}.txt"))
}

/// Strategy for any path written in `round` or before.
pub fn existing_path_strategy(prefix: &'static str, round: u8) -> BoxedStrategy<String> {
    (0..=round)
        .prop_flat_map(move |r| path_strategy(prefix, r))
        .boxed()
}

/// Strategy for short file contents.
pub fn content_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z]{1,8}").expect("Invalid regex")
}

/// Strategy for edits on one replica of a pair during `round`.
///
/// New files are created under `own` with names fresh to the round; renames
/// move a file to a fresh name under `own`. Existing files anywhere may be
/// updated or deleted, so the two replicas' edits overlap without ever
/// reusing a path for a different item concurrently.
pub fn file_op_strategy(
    own: &'static str,
    shared: &'static str,
    round: u8,
) -> impl Strategy<Value = FileOp> {
    let any_path = prop_oneof![
        existing_path_strategy(own, round),
        existing_path_strategy(shared, round)
    ];
    prop_oneof![
        3 => (path_strategy(own, round), content_strategy())
            .prop_map(|(path, content)| FileOp::Write { path, content }),
        3 => (any_path.clone(), content_strategy())
            .prop_map(|(path, content)| FileOp::Update { path, content }),
        2 => any_path.clone().prop_map(|path| FileOp::Remove { path }),
        1 => (any_path, any::<u32>()).prop_map(move |(from, n)| FileOp::Rename {
            from,
            to: format!("{own}moved-{n}.txt"),
        }),
    ]
}

/// Strategy for edits that never rename.
pub fn edit_op_strategy(
    own: &'static str,
    shared: &'static str,
    round: u8,
) -> impl Strategy<Value = FileOp> {
    let any_path = prop_oneof![
        existing_path_strategy(own, round),
        existing_path_strategy(shared, round)
    ];
    prop_oneof![
        3 => (path_strategy(own, round), content_strategy())
            .prop_map(|(path, content)| FileOp::Write { path, content }),
        3 => (any_path.clone(), content_strategy())
            .prop_map(|(path, content)| FileOp::Update { path, content }),
        2 => any_path.prop_map(|path| FileOp::Remove { path }),
    ]
}

/// Strategy for a path both replicas of a pair may claim.
pub fn shared_path_strategy() -> impl Strategy<Value = String> {
    (0u8..3).prop_map(|n| format!("shared-{n}.txt"))
}

/// Strategy for edits that land on shared paths during `round`.
///
/// With `renames` an existing file under `own` is moved onto a shared path,
/// otherwise a shared path is written directly. Pairing one of each makes
/// a rename and a create of different items meet on one path.
pub fn shared_op_strategy(own: &'static str, round: u8, renames: bool) -> BoxedStrategy<FileOp> {
    if renames {
        (existing_path_strategy(own, round), shared_path_strategy())
            .prop_map(|(from, to)| FileOp::Rename { from, to })
            .boxed()
    } else {
        (shared_path_strategy(), content_strategy())
            .prop_map(|(path, content)| FileOp::Write { path, content })
            .boxed()
    }
}
