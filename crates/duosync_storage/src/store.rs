//! Metadata store trait and its journaled implementation.

use crate::backend::JournalBackend;
use crate::error::{StoreError, StoreResult};
use crate::file::FileJournal;
use crate::frame::{decode_frames, encode_frame, FrameScan};
use crate::memory::MemoryJournal;
use duosync_protocol::{ItemId, ItemRecord, Knowledge, ReplicaId, VersionVector};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Current journal format version.
pub const JOURNAL_FORMAT: u16 = 1;

/// Lazy iterator over a consistent snapshot of item records.
pub type RecordIter = Box<dyn Iterator<Item = ItemRecord> + Send>;

/// Persistent per-replica metadata: item records, knowledge and the last
/// knowledge seen from each peer.
///
/// Every method is atomic with respect to concurrent callers. A failing
/// store must be treated as fatal by the session using it.
///
/// # Invariants
///
/// - `knowledge().vector` covers the version of every stored record;
///   `put` observes the record's version as part of the same write
/// - at most one live record per path
pub trait MetadataStore: Send + Sync {
    /// Replica this store belongs to.
    fn replica_id(&self) -> ReplicaId;

    /// Returns the record for `item`, live or tombstoned.
    fn get(&self, item: ItemId) -> StoreResult<Option<ItemRecord>>;

    /// Returns the live record currently at `path`.
    fn find_live_by_path(&self, path: &str) -> StoreResult<Option<ItemRecord>>;

    /// Inserts or replaces a record.
    ///
    /// Also merges the record's version into the knowledge and clears a
    /// knowledge exception the new version supersedes.
    fn put(&self, record: ItemRecord) -> StoreResult<()>;

    /// Physically removes a record. Returns false if it was unknown.
    fn purge(&self, item: ItemId) -> StoreResult<bool>;

    /// Iterates over a snapshot of all records.
    fn all(&self) -> StoreResult<RecordIter>;

    /// Returns the replica's knowledge.
    fn knowledge(&self) -> StoreResult<Knowledge>;

    /// Raises the knowledge component of `replica` to `tick`.
    fn advance_knowledge(&self, replica: ReplicaId, tick: u64) -> StoreResult<()>;

    /// Reserves and persists the next own tick.
    fn allocate_tick(&self) -> StoreResult<u64>;

    /// Merges `version` into the knowledge.
    fn observe(&self, version: &VersionVector) -> StoreResult<()>;

    /// Absorbs a peer's knowledge at session commit.
    fn absorb_knowledge(&self, other: &Knowledge) -> StoreResult<()>;

    /// Records that `version` of `item` was offered but not learned.
    fn add_exception(&self, item: ItemId, version: VersionVector) -> StoreResult<()> {
        self.add_exceptions(&[(item, version)])
    }

    /// Records several exceptions in one write.
    fn add_exceptions(&self, items: &[(ItemId, VersionVector)]) -> StoreResult<()>;

    /// Last knowledge remembered for each peer.
    fn peer_knowledge(&self) -> StoreResult<BTreeMap<ReplicaId, Knowledge>>;

    /// Remembers a peer's knowledge as of the last completed session.
    fn remember_peer(&self, replica: ReplicaId, knowledge: &Knowledge) -> StoreResult<()>;
}

/// Configuration for a journaled store.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Sync the journal after every appended frame.
    pub sync_on_write: bool,
    /// Rewrite the journal once this many frames are superseded.
    pub compact_after: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            compact_after: 4096,
        }
    }
}

impl JournalConfig {
    /// Sets whether each frame is synced.
    #[must_use]
    pub fn with_sync_on_write(mut self, sync: bool) -> Self {
        self.sync_on_write = sync;
        self
    }

    /// Sets the compaction threshold.
    #[must_use]
    pub fn with_compact_after(mut self, frames: u64) -> Self {
        self.compact_after = frames;
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum JournalEntry {
    Header { replica: ReplicaId, format: u16 },
    Put(ItemRecord),
    Purge(ItemId),
    Knowledge(Knowledge),
    Peer { replica: ReplicaId, knowledge: Knowledge },
}

#[derive(Debug, Default)]
struct Snapshot {
    records: BTreeMap<ItemId, ItemRecord>,
    paths: HashMap<String, ItemId>,
    knowledge: Knowledge,
    peers: BTreeMap<ReplicaId, Knowledge>,
}

impl Snapshot {
    fn apply(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::Header { .. } => {}
            JournalEntry::Put(record) => self.put(record),
            JournalEntry::Purge(item) => {
                self.purge(item);
            }
            JournalEntry::Knowledge(knowledge) => self.knowledge = knowledge,
            JournalEntry::Peer { replica, knowledge } => {
                self.peers.insert(replica, knowledge);
            }
        }
    }

    fn put(&mut self, record: ItemRecord) {
        if let Some(previous) = self.records.get(&record.item_id) {
            if previous.is_live() && self.paths.get(&previous.path) == Some(&record.item_id) {
                self.paths.remove(&previous.path);
            }
        }
        if record.is_live() {
            self.paths.insert(record.path.clone(), record.item_id);
        }
        self.knowledge.observe(&record.version);
        self.knowledge
            .clear_exception_if_covered(record.item_id, &record.version);
        self.records.insert(record.item_id, record);
    }

    fn purge(&mut self, item: ItemId) -> bool {
        match self.records.remove(&item) {
            Some(previous) => {
                if self.paths.get(&previous.path) == Some(&item) {
                    self.paths.remove(&previous.path);
                }
                true
            }
            None => false,
        }
    }

    fn live_frames(&self) -> u64 {
        2 + self.records.len() as u64 + self.peers.len() as u64
    }
}

struct StoreInner<B> {
    backend: B,
    state: Snapshot,
    frames: u64,
    closed: bool,
}

/// A [`MetadataStore`] that keeps its state in memory and appends every
/// mutation to a journal before applying it.
///
/// Opening replays the journal. A torn tail frame left by a crash is
/// truncated; damage before the last valid frame is an error.
pub struct JournalStore<B: JournalBackend> {
    replica_id: ReplicaId,
    config: JournalConfig,
    inner: RwLock<StoreInner<B>>,
}

impl<B: JournalBackend> JournalStore<B> {
    /// Opens a store over `backend`, replaying any existing frames.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ReplicaMismatch` if the journal was written for
    /// another replica, or a corruption/codec error if replay fails.
    pub fn open(mut backend: B, replica_id: ReplicaId, config: JournalConfig) -> StoreResult<Self> {
        let data = backend.read_all()?;
        let scan: FrameScan<JournalEntry> = decode_frames(&data)?;

        if scan.torn {
            tracing::warn!(
                replica = %replica_id,
                valid_len = scan.valid_len,
                size = data.len(),
                "dropping torn journal tail"
            );
            backend.truncate(scan.valid_len)?;
        }

        let mut entries = scan.entries.into_iter();
        let mut state = Snapshot::default();
        let mut frames = 0u64;

        match entries.next() {
            Some(JournalEntry::Header { replica, format }) => {
                if replica != replica_id {
                    return Err(StoreError::ReplicaMismatch {
                        expected: replica_id,
                        found: replica,
                    });
                }
                if format > JOURNAL_FORMAT {
                    return Err(StoreError::corrupted(format!(
                        "unsupported journal format {format}"
                    )));
                }
                frames += 1;
            }
            Some(_) => return Err(StoreError::corrupted("journal does not start with a header")),
            None => {
                let header = encode_frame(&JournalEntry::Header {
                    replica: replica_id,
                    format: JOURNAL_FORMAT,
                })?;
                backend.append(&header)?;
                backend.sync()?;
                frames += 1;
            }
        }

        for entry in entries {
            state.apply(entry);
            frames += 1;
        }

        tracing::debug!(
            replica = %replica_id,
            records = state.records.len(),
            frames,
            "metadata journal replayed"
        );

        Ok(Self {
            replica_id,
            config,
            inner: RwLock::new(StoreInner {
                backend,
                state,
                frames,
                closed: false,
            }),
        })
    }

    /// Closes the store. Later calls fail with `StoreError::Closed`.
    pub fn close(&self) {
        self.inner.write().closed = true;
    }

    /// Returns true if the store has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.read().closed
    }

    /// Number of frames currently in the journal.
    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.inner.read().frames
    }

    /// Rewrites the journal as a minimal snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub fn compact(&self) -> StoreResult<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        self.rewrite(&mut inner)
    }

    fn rewrite(&self, inner: &mut StoreInner<B>) -> StoreResult<()> {
        let mut data = encode_frame(&JournalEntry::Header {
            replica: self.replica_id,
            format: JOURNAL_FORMAT,
        })?;
        for record in inner.state.records.values() {
            data.extend(encode_frame(&JournalEntry::Put(record.clone()))?);
        }
        data.extend(encode_frame(&JournalEntry::Knowledge(
            inner.state.knowledge.clone(),
        ))?);
        for (replica, knowledge) in &inner.state.peers {
            data.extend(encode_frame(&JournalEntry::Peer {
                replica: *replica,
                knowledge: knowledge.clone(),
            })?);
        }

        let before = inner.frames;
        inner.backend.replace(&data)?;
        inner.frames = inner.state.live_frames();
        tracing::info!(
            replica = %self.replica_id,
            before,
            after = inner.frames,
            bytes = data.len(),
            "metadata journal compacted"
        );
        Ok(())
    }

    /// Appends the entry `plan` builds from the current state, then applies
    /// it in memory. Returns false if `plan` had nothing to write.
    fn commit(&self, plan: impl FnOnce(&Snapshot) -> Option<JournalEntry>) -> StoreResult<bool> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        let Some(entry) = plan(&inner.state) else {
            return Ok(false);
        };

        let frame = encode_frame(&entry)?;
        let offset = inner.backend.size()?;
        if let Err(e) = inner.backend.append(&frame) {
            // Leave no partial frame behind a later append.
            let _ = inner.backend.truncate(offset);
            return Err(e);
        }
        if self.config.sync_on_write {
            inner.backend.sync()?;
        }
        inner.state.apply(entry);
        inner.frames += 1;

        let superseded = inner.frames.saturating_sub(inner.state.live_frames());
        if superseded >= self.config.compact_after {
            self.rewrite(&mut inner)?;
        }
        Ok(true)
    }

    /// Writes a knowledge frame if `change` alters the knowledge.
    fn update_knowledge(&self, change: impl FnOnce(&mut Knowledge)) -> StoreResult<()> {
        self.commit(|state| {
            let mut knowledge = state.knowledge.clone();
            change(&mut knowledge);
            (knowledge != state.knowledge).then_some(JournalEntry::Knowledge(knowledge))
        })?;
        Ok(())
    }

    fn read<R>(&self, f: impl FnOnce(&Snapshot) -> R) -> StoreResult<R> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        Ok(f(&inner.state))
    }
}

impl<B: JournalBackend> MetadataStore for JournalStore<B> {
    fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    fn get(&self, item: ItemId) -> StoreResult<Option<ItemRecord>> {
        self.read(|state| state.records.get(&item).cloned())
    }

    fn find_live_by_path(&self, path: &str) -> StoreResult<Option<ItemRecord>> {
        self.read(|state| {
            state
                .paths
                .get(path)
                .and_then(|item| state.records.get(item))
                .cloned()
        })
    }

    fn put(&self, record: ItemRecord) -> StoreResult<()> {
        tracing::trace!(
            replica = %self.replica_id,
            item = %record.item_id,
            path = %record.path,
            tombstone = record.tombstone,
            "put record"
        );
        self.commit(|_| Some(JournalEntry::Put(record)))?;
        Ok(())
    }

    fn purge(&self, item: ItemId) -> StoreResult<bool> {
        self.commit(|state| {
            state
                .records
                .contains_key(&item)
                .then_some(JournalEntry::Purge(item))
        })
    }

    fn all(&self) -> StoreResult<RecordIter> {
        let records: Vec<ItemRecord> =
            self.read(|state| state.records.values().cloned().collect())?;
        Ok(Box::new(records.into_iter()))
    }

    fn knowledge(&self) -> StoreResult<Knowledge> {
        self.read(|state| state.knowledge.clone())
    }

    fn advance_knowledge(&self, replica: ReplicaId, tick: u64) -> StoreResult<()> {
        self.update_knowledge(|knowledge| knowledge.advance(replica, tick))
    }

    fn allocate_tick(&self) -> StoreResult<u64> {
        let replica = self.replica_id;
        let mut tick = 0;
        self.commit(|state| {
            let mut knowledge = state.knowledge.clone();
            tick = knowledge.tick(replica);
            Some(JournalEntry::Knowledge(knowledge))
        })?;
        Ok(tick)
    }

    fn observe(&self, version: &VersionVector) -> StoreResult<()> {
        self.update_knowledge(|knowledge| knowledge.observe(version))
    }

    fn absorb_knowledge(&self, other: &Knowledge) -> StoreResult<()> {
        self.update_knowledge(|knowledge| knowledge.absorb(other))
    }

    fn add_exceptions(&self, items: &[(ItemId, VersionVector)]) -> StoreResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        self.update_knowledge(|knowledge| {
            for (item, version) in items {
                knowledge.add_exception(*item, version.clone());
            }
        })
    }

    fn peer_knowledge(&self) -> StoreResult<BTreeMap<ReplicaId, Knowledge>> {
        self.read(|state| state.peers.clone())
    }

    fn remember_peer(&self, replica: ReplicaId, knowledge: &Knowledge) -> StoreResult<()> {
        self.commit(|state| {
            (state.peers.get(&replica) != Some(knowledge)).then(|| JournalEntry::Peer {
                replica,
                knowledge: knowledge.clone(),
            })
        })?;
        Ok(())
    }
}

/// Opens (or creates) a file-backed store.
///
/// # Errors
///
/// See [`FileJournal::open`] and [`JournalStore::open`].
pub fn open_file_store(
    path: &Path,
    replica_id: ReplicaId,
    config: JournalConfig,
) -> StoreResult<JournalStore<FileJournal>> {
    JournalStore::open(FileJournal::open(path)?, replica_id, config)
}

/// Creates an empty in-memory store.
///
/// Frames are kept in a private [`MemoryJournal`]; nothing is persisted.
#[must_use]
pub fn memory_store(replica_id: ReplicaId) -> JournalStore<MemoryJournal> {
    let header = JournalEntry::Header {
        replica: replica_id,
        format: JOURNAL_FORMAT,
    };
    let backend = encode_frame(&header)
        .map(MemoryJournal::with_data)
        .unwrap_or_default();
    JournalStore {
        replica_id,
        config: JournalConfig::default().with_sync_on_write(false),
        inner: RwLock::new(StoreInner {
            backend,
            state: Snapshot::default(),
            frames: 1,
            closed: false,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duosync_protocol::{ChangeKind, Fingerprint};
    use tempfile::tempdir;

    fn replica() -> ReplicaId {
        ReplicaId::from_bytes([7u8; 16])
    }

    fn record(path: &str, tick: u64) -> ItemRecord {
        ItemRecord::live(
            ItemId::new(),
            path,
            Fingerprint::new([tick as u8; 32], tick, tick),
            VersionVector::single(replica(), tick),
            replica(),
            ChangeKind::Create,
        )
    }

    fn open_memory(journal: &MemoryJournal) -> JournalStore<MemoryJournal> {
        JournalStore::open(journal.clone(), replica(), JournalConfig::default()).unwrap()
    }

    #[test]
    fn put_get_and_find_by_path() {
        let store = memory_store(replica());
        let r = record("a.txt", 1);
        store.put(r.clone()).unwrap();

        assert_eq!(store.get(r.item_id).unwrap(), Some(r.clone()));
        assert_eq!(store.find_live_by_path("a.txt").unwrap(), Some(r.clone()));
        assert_eq!(store.find_live_by_path("b.txt").unwrap(), None);
        assert_eq!(store.all().unwrap().count(), 1);
    }

    #[test]
    fn put_observes_version() {
        let store = memory_store(replica());
        store.put(record("a.txt", 5)).unwrap();
        assert_eq!(store.knowledge().unwrap().vector.get(replica()), 5);
    }

    #[test]
    fn rename_and_tombstone_update_path_index() {
        let store = memory_store(replica());
        let r = record("a.txt", 1);
        store.put(r.clone()).unwrap();

        let mut moved = r.clone();
        moved.path = "b.txt".into();
        moved.version = VersionVector::single(replica(), 2);
        store.put(moved.clone()).unwrap();
        assert_eq!(store.find_live_by_path("a.txt").unwrap(), None);
        assert_eq!(store.find_live_by_path("b.txt").unwrap(), Some(moved.clone()));

        let tomb = moved.into_tombstone(VersionVector::single(replica(), 3), replica(), 10);
        store.put(tomb.clone()).unwrap();
        assert_eq!(store.find_live_by_path("b.txt").unwrap(), None);
        assert_eq!(store.get(r.item_id).unwrap(), Some(tomb));
    }

    #[test]
    fn allocate_tick_is_monotonic() {
        let store = memory_store(replica());
        assert_eq!(store.allocate_tick().unwrap(), 1);
        assert_eq!(store.allocate_tick().unwrap(), 2);
        store.advance_knowledge(replica(), 10).unwrap();
        assert_eq!(store.allocate_tick().unwrap(), 11);
    }

    #[test]
    fn put_clears_covered_exception() {
        let store = memory_store(replica());
        let r = record("a.txt", 3);
        store.add_exception(r.item_id, VersionVector::single(replica(), 3)).unwrap();
        assert!(!store.knowledge().unwrap().exceptions.is_empty());

        store.put(r).unwrap();
        assert!(store.knowledge().unwrap().exceptions.is_empty());
    }

    #[test]
    fn batched_exceptions_write_one_frame() {
        let store = memory_store(replica());
        let before = store.frame_count();
        let items: Vec<(ItemId, VersionVector)> = (1..=5)
            .map(|tick| (ItemId::new(), VersionVector::single(replica(), tick)))
            .collect();
        store.add_exceptions(&items).unwrap();
        assert_eq!(store.frame_count(), before + 1);
        assert_eq!(store.knowledge().unwrap().exceptions.len(), 5);
        store.add_exceptions(&[]).unwrap();
        assert_eq!(store.frame_count(), before + 1);
    }

    #[test]
    fn purge_removes_record() {
        let store = memory_store(replica());
        let r = record("a.txt", 1);
        store.put(r.clone()).unwrap();
        assert!(store.purge(r.item_id).unwrap());
        assert!(!store.purge(r.item_id).unwrap());
        assert_eq!(store.get(r.item_id).unwrap(), None);
        assert_eq!(store.find_live_by_path("a.txt").unwrap(), None);
    }

    #[test]
    fn all_is_a_snapshot() {
        let store = memory_store(replica());
        store.put(record("a.txt", 1)).unwrap();
        let iter = store.all().unwrap();
        store.put(record("b.txt", 2)).unwrap();
        assert_eq!(iter.count(), 1);
    }

    #[test]
    fn replay_restores_everything() {
        let journal = MemoryJournal::new();
        let peer = ReplicaId::from_bytes([9u8; 16]);
        let kept = record("kept.txt", 1);
        let purged = record("purged.txt", 2);
        let skipped = ItemId::new();

        {
            let store = open_memory(&journal);
            store.put(kept.clone()).unwrap();
            store.put(purged.clone()).unwrap();
            store.purge(purged.item_id).unwrap();
            store.observe(&VersionVector::single(peer, 4)).unwrap();
            store.add_exception(skipped, VersionVector::single(peer, 3)).unwrap();
            store
                .remember_peer(peer, &Knowledge::from_vector(VersionVector::single(peer, 4)))
                .unwrap();
        }

        let store = open_memory(&journal);
        assert_eq!(store.get(kept.item_id).unwrap(), Some(kept));
        assert_eq!(store.get(purged.item_id).unwrap(), None);
        let knowledge = store.knowledge().unwrap();
        assert_eq!(knowledge.vector.get(peer), 4);
        assert_eq!(knowledge.vector.get(replica()), 2);
        assert!(knowledge.exceptions.contains_key(&skipped));
        assert_eq!(store.peer_knowledge().unwrap()[&peer].vector.get(peer), 4);
    }

    #[test]
    fn torn_tail_is_dropped_on_open() {
        let journal = MemoryJournal::new();
        let first = record("first.txt", 1);
        {
            let store = open_memory(&journal);
            store.put(first.clone()).unwrap();
            store.put(record("second.txt", 2)).unwrap();
        }
        let mut data = journal.data();
        data.truncate(data.len() - 3);
        let damaged = MemoryJournal::with_data(data);

        let store = open_memory(&damaged);
        assert_eq!(store.get(first.item_id).unwrap(), Some(first));
        assert_eq!(store.all().unwrap().count(), 1);

        store.put(record("third.txt", 3)).unwrap();
        let reopened = open_memory(&damaged);
        assert_eq!(reopened.all().unwrap().count(), 2);
    }

    #[test]
    fn journal_of_other_replica_is_rejected() {
        let journal = MemoryJournal::new();
        drop(open_memory(&journal));
        let other = ReplicaId::from_bytes([8u8; 16]);
        let result = JournalStore::open(journal, other, JournalConfig::default());
        assert!(matches!(result, Err(StoreError::ReplicaMismatch { .. })));
    }

    #[test]
    fn compaction_keeps_state_and_shrinks_journal() {
        let journal = MemoryJournal::new();
        let config = JournalConfig::default().with_compact_after(8);
        let store = JournalStore::open(journal.clone(), replica(), config).unwrap();

        let mut r = record("a.txt", 1);
        for tick in 2..=20 {
            r.version = VersionVector::single(replica(), tick);
            store.put(r.clone()).unwrap();
        }
        assert!(store.frame_count() < 12);

        let reopened = open_memory(&journal);
        assert_eq!(reopened.get(r.item_id).unwrap(), Some(r));
        assert_eq!(reopened.knowledge().unwrap().vector.get(replica()), 20);
    }

    #[test]
    fn closed_store_fails() {
        let store = memory_store(replica());
        store.close();
        assert!(store.is_closed());
        assert!(matches!(store.knowledge(), Err(StoreError::Closed)));
        assert!(matches!(store.put(record("a", 1)), Err(StoreError::Closed)));
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metadata.journal");
        let r = record("a.txt", 1);
        {
            let store = open_file_store(&path, replica(), JournalConfig::default()).unwrap();
            store.put(r.clone()).unwrap();
        }
        let store = open_file_store(&path, replica(), JournalConfig::default()).unwrap();
        assert_eq!(store.get(r.item_id).unwrap(), Some(r));
    }
}
