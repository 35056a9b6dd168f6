//! Replica fixtures and recording helpers.
//!
//! In-memory pairs are deterministic and fast; [`DirectoryPair`] runs the
//! same engine against real folders in temporary directories.

use duosync_engine::{
    AppliedChange, MemoryMedium, MemoryRecycleBin, Replica, ScopeFilter, SessionReport,
    SkippedChange, SyncConfig, SyncListener, SyncOrchestrator, SyncResult,
};
use duosync_protocol::{ItemId, ItemRecord, ReplicaId};
use duosync_storage::memory_store;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// An in-memory replica with direct access to its files and recycle bin.
pub struct TestReplica {
    /// The file medium.
    pub medium: Arc<MemoryMedium>,
    /// The recycle bin.
    pub bin: Arc<MemoryRecycleBin>,
    /// The replica handed to the engine.
    pub replica: Arc<Replica>,
}

impl TestReplica {
    /// Creates an empty in-memory replica.
    pub fn memory(name: &str) -> Self {
        let medium = Arc::new(MemoryMedium::new(name));
        let bin = Arc::new(MemoryRecycleBin::new());
        let replica = Replica::new(medium.clone(), Arc::new(memory_store(ReplicaId::new())))
            .with_recycle_bin(bin.clone())
            .with_label(name);
        Self {
            medium,
            bin,
            replica: Arc::new(replica),
        }
    }

    /// Replica id.
    pub fn id(&self) -> ReplicaId {
        self.replica.id()
    }

    /// Writes a file as a user edit.
    pub fn write(&self, path: &str, content: &str) {
        self.medium.put_file(path, content);
    }

    /// Removes a file as a user would.
    pub fn remove(&self, path: &str) {
        assert!(self.medium.remove_file(path), "{path} does not exist");
    }

    /// Renames a file as a user would.
    pub fn rename(&self, from: &str, to: &str) {
        assert!(self.medium.move_file(from, to), "{from} does not exist");
    }

    /// Content of a file, if present.
    pub fn read(&self, path: &str) -> Option<String> {
        self.medium
            .file(path)
            .map(|content| String::from_utf8_lossy(&content).into_owned())
    }

    /// Every file path, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.medium.paths()
    }

    /// Recycled contents of `path`, oldest first.
    pub fn recycled(&self, path: &str) -> Vec<String> {
        self.bin
            .contents_for(path)
            .into_iter()
            .map(|content| String::from_utf8_lossy(&content).into_owned())
            .collect()
    }

    /// The stored record of the live item at `path`.
    pub fn record_at(&self, path: &str) -> Option<ItemRecord> {
        self.replica
            .store()
            .find_live_by_path(path)
            .expect("metadata store")
    }

    /// The stored record of `item`.
    pub fn record(&self, item: ItemId) -> Option<ItemRecord> {
        self.replica.store().get(item).expect("metadata store")
    }
}

/// Live state of a replica: path, content hash and size per item.
pub type LiveState = BTreeMap<ItemId, (String, [u8; 32], u64)>;

/// Collects the live records of a replica.
///
/// Modification times are left out; two replicas agree when they hold the
/// same items at the same paths with the same content.
pub fn live_state(replica: &Replica) -> LiveState {
    replica
        .store()
        .all()
        .expect("metadata store")
        .filter(ItemRecord::is_live)
        .filter_map(|record| {
            let fingerprint = record.fingerprint?;
            Some((record.item_id, (record.path, fingerprint.hash, fingerprint.size)))
        })
        .collect()
}

/// Records every event it receives.
#[derive(Default)]
pub struct RecordingListener {
    applied: Mutex<Vec<AppliedChange>>,
    skipped: Mutex<Vec<SkippedChange>>,
}

impl RecordingListener {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applied changes so far.
    pub fn applied(&self) -> Vec<AppliedChange> {
        self.applied.lock().clone()
    }

    /// Skipped changes so far.
    pub fn skipped(&self) -> Vec<SkippedChange> {
        self.skipped.lock().clone()
    }

    /// Applied changes on one replica.
    pub fn applied_to(&self, replica: ReplicaId) -> Vec<AppliedChange> {
        self.applied
            .lock()
            .iter()
            .filter(|change| change.replica == replica)
            .cloned()
            .collect()
    }

    /// Skipped changes on one replica.
    pub fn skipped_on(&self, replica: ReplicaId) -> Vec<SkippedChange> {
        self.skipped
            .lock()
            .iter()
            .filter(|change| change.replica == replica)
            .cloned()
            .collect()
    }

    /// Forgets everything recorded.
    pub fn clear(&self) {
        self.applied.lock().clear();
        self.skipped.lock().clear();
    }
}

impl SyncListener for RecordingListener {
    fn on_applied(&self, change: &AppliedChange) {
        self.applied.lock().push(change.clone());
    }

    fn on_skipped(&self, change: &SkippedChange) {
        self.skipped.lock().push(change.clone());
    }
}

/// Two in-memory replicas wired to an orchestrator.
pub struct ReplicaPair {
    /// Local side.
    pub left: TestReplica,
    /// Remote side.
    pub right: TestReplica,
    /// Every event of every session.
    pub recorder: Arc<RecordingListener>,
    /// The orchestrator under test.
    pub orchestrator: Arc<SyncOrchestrator>,
}

impl ReplicaPair {
    /// Creates a pair with the default configuration.
    pub fn new() -> Self {
        Self::with_config(SyncConfig::default())
    }

    /// Creates a pair with `config`.
    pub fn with_config(config: SyncConfig) -> Self {
        Self::with_setup(config, None)
    }

    /// Creates a pair with `config` and an optional scope filter.
    pub fn with_setup(config: SyncConfig, filter: Option<Arc<dyn ScopeFilter>>) -> Self {
        let left = TestReplica::memory("left");
        let right = TestReplica::memory("right");
        let recorder = Arc::new(RecordingListener::new());
        let orchestrator =
            Self::orchestrator_for(&left, &right, config, filter, recorder.clone());
        Self {
            left,
            right,
            recorder,
            orchestrator: Arc::new(orchestrator),
        }
    }

    /// Builds another orchestrator over the same replicas.
    pub fn rewire(&mut self, config: SyncConfig, filter: Option<Arc<dyn ScopeFilter>>) {
        self.orchestrator = Arc::new(Self::orchestrator_for(
            &self.left,
            &self.right,
            config,
            filter,
            self.recorder.clone(),
        ));
    }

    fn orchestrator_for(
        left: &TestReplica,
        right: &TestReplica,
        config: SyncConfig,
        filter: Option<Arc<dyn ScopeFilter>>,
        recorder: Arc<RecordingListener>,
    ) -> SyncOrchestrator {
        let mut builder = SyncOrchestrator::builder(left.replica.clone(), right.replica.clone())
            .config(config)
            .listener(recorder);
        if let Some(filter) = filter {
            builder = builder.filter(filter);
        }
        builder.build().expect("valid orchestrator")
    }

    /// Runs one detect+sync pass.
    pub fn try_sync(&self) -> SyncResult<SessionReport> {
        self.orchestrator.run_pass()
    }

    /// Runs one detect+sync pass, panicking on fatal errors.
    pub fn sync(&self) -> SessionReport {
        self.try_sync().expect("sync pass")
    }

    /// Returns true if both replicas hold the same live items and files.
    pub fn converged(&self) -> bool {
        let files = |side: &TestReplica| -> Vec<(String, Option<Vec<u8>>)> {
            side.paths()
                .into_iter()
                .map(|path| {
                    let content = side.medium.file(&path);
                    (path, content)
                })
                .collect()
        };
        live_state(&self.left.replica) == live_state(&self.right.replica)
            && files(&self.left) == files(&self.right)
    }

    /// Syncs until converged and returns the number of passes.
    ///
    /// # Panics
    ///
    /// Panics if the replicas still differ after `max_passes`.
    pub fn sync_until_converged(&self, max_passes: usize) -> usize {
        for pass in 1..=max_passes {
            self.sync();
            if self.converged() {
                return pass;
            }
        }
        panic!(
            "replicas did not converge after {max_passes} passes:\nleft:  {:?}\nright: {:?}",
            self.left.paths(),
            self.right.paths()
        );
    }
}

impl Default for ReplicaPair {
    fn default() -> Self {
        Self::new()
    }
}

/// Two folder replicas in temporary directories.
pub struct DirectoryPair {
    /// Local folder.
    pub left: TempDir,
    /// Remote folder.
    pub right: TempDir,
    /// Every event of every session.
    pub recorder: Arc<RecordingListener>,
    /// The orchestrator under test.
    pub orchestrator: Arc<SyncOrchestrator>,
}

impl DirectoryPair {
    /// Creates two empty folders with the default configuration.
    pub fn new() -> Self {
        Self::with_config(SyncConfig::default())
    }

    /// Creates two empty folders with `config`.
    pub fn with_config(config: SyncConfig) -> Self {
        let left = TempDir::new().expect("temp dir");
        let right = TempDir::new().expect("temp dir");
        let recorder = Arc::new(RecordingListener::new());
        let orchestrator = Self::open(left.path(), right.path(), config, recorder.clone());
        Self {
            left,
            right,
            recorder,
            orchestrator: Arc::new(orchestrator),
        }
    }

    fn open(
        left: &Path,
        right: &Path,
        config: SyncConfig,
        recorder: Arc<RecordingListener>,
    ) -> SyncOrchestrator {
        let left = Replica::open_directory(left).expect("open left");
        let right = Replica::open_directory(right).expect("open right");
        SyncOrchestrator::builder(Arc::new(left), Arc::new(right))
            .config(config)
            .listener(recorder)
            .build()
            .expect("valid orchestrator")
    }

    /// Closes and reopens both replicas from disk.
    ///
    /// The journals stay locked while any clone of the orchestrator is
    /// alive, so callers must not hold one.
    pub fn reopen(self) -> Self {
        let Self {
            left,
            right,
            recorder,
            orchestrator,
        } = self;
        let config = orchestrator.config().clone();
        drop(orchestrator);
        let orchestrator = Self::open(left.path(), right.path(), config, recorder.clone());
        Self {
            left,
            right,
            recorder,
            orchestrator: Arc::new(orchestrator),
        }
    }

    /// Path of a file in the left folder.
    pub fn left_path(&self, path: &str) -> PathBuf {
        self.left.path().join(path)
    }

    /// Path of a file in the right folder.
    pub fn right_path(&self, path: &str) -> PathBuf {
        self.right.path().join(path)
    }

    /// Runs one detect+sync pass, panicking on fatal errors.
    pub fn sync(&self) -> SessionReport {
        self.orchestrator.run_pass().expect("sync pass")
    }
}

impl Default for DirectoryPair {
    fn default() -> Self {
        Self::new()
    }
}
