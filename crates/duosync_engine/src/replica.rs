//! A replica: medium, metadata store and recycle bin behind one lock.

use crate::error::{SyncError, SyncResult};
use crate::medium::{FsMedium, ReplicaMedium};
use crate::recycle::{DirectoryRecycleBin, RecycleBin};
use duosync_protocol::ReplicaId;
use duosync_storage::{open_file_store, JournalConfig, MetadataStore, StoreError};
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Name of the control directory inside a directory replica.
pub const CONTROL_DIR: &str = ".duosync";

const REPLICA_ID_FILE: &str = "replica.id";
const JOURNAL_FILE: &str = "metadata.journal";
const RECYCLE_DIR: &str = "recycle";

/// Options for [`Replica::open_directory_with`].
#[derive(Debug, Clone, Default)]
pub struct DirectoryOptions {
    /// Identity to use. Must match a previously persisted one.
    pub replica_id: Option<ReplicaId>,
    /// Journal settings.
    pub journal: JournalConfig,
    /// Recycle directory, `<root>/.duosync/recycle` by default.
    pub recycle_dir: Option<PathBuf>,
}

impl DirectoryOptions {
    /// Sets the replica identity.
    pub fn with_replica_id(mut self, id: ReplicaId) -> Self {
        self.replica_id = Some(id);
        self
    }

    /// Sets the journal configuration.
    pub fn with_journal(mut self, journal: JournalConfig) -> Self {
        self.journal = journal;
        self
    }

    /// Sets the recycle directory.
    pub fn with_recycle_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.recycle_dir = Some(dir.into());
        self
    }
}

/// One side of a sync pair.
///
/// Detection and application on a replica both hold its lock, so they never
/// interleave.
pub struct Replica {
    id: ReplicaId,
    label: String,
    medium: Arc<dyn ReplicaMedium>,
    store: Arc<dyn MetadataStore>,
    recycle: Option<Arc<dyn RecycleBin>>,
    lock: Mutex<()>,
}

impl Replica {
    /// Creates a replica. Its id is the store's replica id.
    pub fn new(medium: Arc<dyn ReplicaMedium>, store: Arc<dyn MetadataStore>) -> Self {
        Self {
            id: store.replica_id(),
            label: medium.describe(),
            medium,
            store,
            recycle: None,
            lock: Mutex::new(()),
        }
    }

    /// Attaches a recycle bin.
    pub fn with_recycle_bin(mut self, bin: Arc<dyn RecycleBin>) -> Self {
        self.recycle = Some(bin);
        self
    }

    /// Sets the name used in logs.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Opens a directory replica with default options.
    ///
    /// The control directory `<root>/.duosync` holds the persisted replica
    /// id, the metadata journal and the recycle bin.
    pub fn open_directory(root: impl AsRef<Path>) -> SyncResult<Self> {
        Self::open_directory_with(root, DirectoryOptions::default())
    }

    /// Opens a directory replica.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Configuration` if `options.replica_id` differs from
    /// the persisted identity, and `SyncError::StoreUnavailable` if the
    /// control directory or journal cannot be opened.
    pub fn open_directory_with(root: impl AsRef<Path>, options: DirectoryOptions) -> SyncResult<Self> {
        let root = root.as_ref();
        let control = root.join(CONTROL_DIR);
        fs::create_dir_all(&control).map_err(StoreError::from)?;

        let id = load_or_create_id(&control, options.replica_id)?;
        let store = open_file_store(&control.join(JOURNAL_FILE), id, options.journal)?;
        let medium = FsMedium::open(root)
            .map_err(StoreError::from)?
            .with_excluded_dir(control.clone());
        let recycle_dir = options.recycle_dir.unwrap_or_else(|| control.join(RECYCLE_DIR));

        tracing::info!(replica = %id, root = %root.display(), "opened directory replica");
        Ok(Self::new(Arc::new(medium), Arc::new(store))
            .with_recycle_bin(Arc::new(DirectoryRecycleBin::new(recycle_dir))))
    }

    /// Replica id.
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    /// Name used in logs.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Content medium.
    pub fn medium(&self) -> &dyn ReplicaMedium {
        self.medium.as_ref()
    }

    /// Metadata store.
    pub fn store(&self) -> &dyn MetadataStore {
        self.store.as_ref()
    }

    /// Recycle bin, if any.
    pub fn recycle_bin(&self) -> Option<&dyn RecycleBin> {
        self.recycle.as_deref()
    }

    /// Takes the replica lock.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }
}

impl fmt::Debug for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replica")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("recycle", &self.recycle.is_some())
            .finish()
    }
}

fn load_or_create_id(control: &Path, requested: Option<ReplicaId>) -> SyncResult<ReplicaId> {
    let path = control.join(REPLICA_ID_FILE);
    match fs::read_to_string(&path) {
        Ok(text) => {
            let stored = ReplicaId::parse_str(text.trim()).map_err(|e| {
                SyncError::configuration(format!("invalid replica id in {}: {e}", path.display()))
            })?;
            match requested {
                Some(id) if id != stored => Err(SyncError::configuration(format!(
                    "replica at {} has id {stored}, not {id}",
                    control.display()
                ))),
                _ => Ok(stored),
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let id = requested.unwrap_or_default();
            write_id(&path, id).map_err(StoreError::from)?;
            Ok(id)
        }
        Err(e) => Err(StoreError::from(e).into()),
    }
}

fn write_id(path: &Path, id: ReplicaId) -> io::Result<()> {
    let temp = path.with_extension("tmp");
    let mut file = File::create(&temp)?;
    writeln!(file, "{id}")?;
    file.sync_all()?;
    fs::rename(&temp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::medium::MemoryMedium;
    use duosync_storage::memory_store;
    use tempfile::tempdir;

    #[test]
    fn memory_replica_takes_store_id() {
        let id = ReplicaId::new();
        let replica = Replica::new(
            Arc::new(MemoryMedium::new("left")),
            Arc::new(memory_store(id)),
        );
        assert_eq!(replica.id(), id);
        assert_eq!(replica.label(), "memory:left");
        assert!(replica.recycle_bin().is_none());
    }

    #[test]
    fn directory_replica_persists_its_id() {
        let dir = tempdir().unwrap();
        let first = Replica::open_directory(dir.path()).unwrap();
        let id = first.id();
        drop(first);

        let again = Replica::open_directory(dir.path()).unwrap();
        assert_eq!(again.id(), id);
        assert!(again.recycle_bin().is_some());
        assert!(dir.path().join(CONTROL_DIR).join(REPLICA_ID_FILE).is_file());
        assert!(dir.path().join(CONTROL_DIR).join(JOURNAL_FILE).is_file());
    }

    #[test]
    fn directory_replica_rejects_other_id() {
        let dir = tempdir().unwrap();
        let id = Replica::open_directory(dir.path()).unwrap().id();

        let wrong = DirectoryOptions::default().with_replica_id(ReplicaId::new());
        let err = Replica::open_directory_with(dir.path(), wrong).unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));

        let right = DirectoryOptions::default().with_replica_id(id);
        assert_eq!(Replica::open_directory_with(dir.path(), right).unwrap().id(), id);
    }

    #[test]
    fn directory_replica_is_locked_while_open() {
        let dir = tempdir().unwrap();
        let _open = Replica::open_directory(dir.path()).unwrap();
        let second = Replica::open_directory(dir.path()).unwrap_err();
        assert!(matches!(
            second,
            SyncError::StoreUnavailable(StoreError::Locked(_))
        ));
    }

    #[test]
    fn control_directory_is_not_enumerated() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        let replica = Replica::open_directory(dir.path()).unwrap();
        let entries = replica.medium().enumerate(&crate::filter::AllowAll).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "a.txt");
    }
}
