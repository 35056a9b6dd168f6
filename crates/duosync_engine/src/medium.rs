//! Replica media: where a replica's file content lives.
//!
//! The detector and the applier only ever talk to [`ReplicaMedium`]. Paths
//! are `/`-separated and relative to the replica root.

use crate::filter::ScopeFilter;
use duosync_protocol::Fingerprint;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

/// Suffix of temporary files written by [`FsMedium`].
pub const TEMP_SUFFIX: &str = ".duosync-tmp";

/// One file seen by an enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedEntry {
    /// Relative path.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// Modification time, Unix milliseconds.
    pub modified_ms: u64,
}

/// Capability set a replica backend must provide.
pub trait ReplicaMedium: Send + Sync {
    /// Lists every file the filter includes, sorted by path.
    fn enumerate(&self, filter: &dyn ScopeFilter) -> io::Result<Vec<ScannedEntry>>;

    /// Hashes the file at `path`.
    fn fingerprint(&self, path: &str) -> io::Result<Fingerprint>;

    /// Reads the whole file.
    fn read(&self, path: &str) -> io::Result<Vec<u8>>;

    /// Replaces (or creates) the file and sets its modification time.
    ///
    /// Returns the modification time actually stored, which may be coarser
    /// than the one requested.
    fn write(&self, path: &str, content: &[u8], modified_ms: u64) -> io::Result<u64>;

    /// Removes the file.
    fn remove(&self, path: &str) -> io::Result<()>;

    /// Moves a file. Fails with `AlreadyExists` if `to` is taken.
    fn rename(&self, from: &str, to: &str) -> io::Result<()>;

    /// Returns true if a file exists at `path`.
    fn exists(&self, path: &str) -> io::Result<bool>;

    /// Human-readable location, for logs.
    fn describe(&self) -> String;
}

/// SHA-256 of `content`.
pub fn hash_bytes(content: &[u8]) -> [u8; 32] {
    Sha256::digest(content).into()
}

/// Current wall-clock time in Unix milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn modified_ms(metadata: &fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn invalid_path(path: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("invalid replica path: {path:?}"),
    )
}

/// A replica rooted at a local directory.
#[derive(Debug)]
pub struct FsMedium {
    root: PathBuf,
    excluded: Vec<PathBuf>,
    temp_seq: AtomicU64,
}

impl FsMedium {
    /// Creates a medium over `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            excluded: Vec::new(),
            temp_seq: AtomicU64::new(0),
        })
    }

    /// Hides a directory below the root from enumeration.
    pub fn with_excluded_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.excluded.push(dir.into());
        self
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let relative = Path::new(path);
        if path.is_empty() || !relative.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(invalid_path(path));
        }
        Ok(self.root.join(relative))
    }

    fn relative(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_str()?),
                _ => return None,
            }
        }
        Some(parts.join("/"))
    }

    fn temp_path(&self, target: &Path) -> PathBuf {
        let seq = self.temp_seq.fetch_add(1, Ordering::Relaxed);
        let name = target
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file");
        target.with_file_name(format!(".{name}.{seq}{TEMP_SUFFIX}"))
    }

    fn prune_empty_parents(&self, path: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == self.root || !dir.starts_with(&self.root) {
                break;
            }
            if fs::remove_dir(dir).is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

impl ReplicaMedium for FsMedium {
    fn enumerate(&self, filter: &dyn ScopeFilter) -> io::Result<Vec<ScannedEntry>> {
        let mut entries = Vec::new();
        let walker = WalkDir::new(&self.root).into_iter().filter_entry(|entry| {
            let temp = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.ends_with(TEMP_SUFFIX));
            !temp && !self.excluded.iter().any(|dir| entry.path() == dir)
        });

        for entry in walker {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(path) = self.relative(entry.path()) else {
                tracing::warn!(path = %entry.path().display(), "skipping path that is not valid UTF-8");
                continue;
            };
            if !filter.includes(&path) {
                continue;
            }
            let metadata = entry.metadata().map_err(io::Error::from)?;
            entries.push(ScannedEntry {
                path,
                size: metadata.len(),
                modified_ms: modified_ms(&metadata),
            });
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    fn fingerprint(&self, path: &str) -> io::Result<Fingerprint> {
        let mut file = File::open(self.resolve(path)?)?;
        let metadata = file.metadata()?;
        let mut hasher = Sha256::new();
        let size = io::copy(&mut file, &mut hasher)?;
        Ok(Fingerprint::new(
            hasher.finalize().into(),
            size,
            modified_ms(&metadata),
        ))
    }

    fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        fs::read(self.resolve(path)?)
    }

    fn write(&self, path: &str, content: &[u8], modified_ms_requested: u64) -> io::Result<u64> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp = self.temp_path(&target);
        let written = (|| {
            let mut file = File::create(&temp)?;
            file.write_all(content)?;
            file.set_modified(UNIX_EPOCH + Duration::from_millis(modified_ms_requested))?;
            file.sync_all()?;
            fs::rename(&temp, &target)
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&temp);
            return Err(e);
        }

        Ok(modified_ms(&fs::metadata(&target)?))
    }

    fn remove(&self, path: &str) -> io::Result<()> {
        let target = self.resolve(path)?;
        fs::remove_file(&target)?;
        self.prune_empty_parents(&target);
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;
        if target.try_exists()? {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{to} already exists"),
            ));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&source, &target)?;
        self.prune_empty_parents(&source);
        Ok(())
    }

    fn exists(&self, path: &str) -> io::Result<bool> {
        self.resolve(path)?.try_exists()
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

static MEMORY_CLOCK: AtomicU64 = AtomicU64::new(1_700_000_000_000);

#[derive(Debug, Clone)]
struct MemoryFile {
    content: Vec<u8>,
    modified_ms: u64,
}

/// An in-memory replica for tests.
///
/// Modification times come from a process-wide counter, so a file written
/// later is always newer. Faults can be injected per path.
#[derive(Debug, Default)]
pub struct MemoryMedium {
    name: String,
    files: RwLock<BTreeMap<String, MemoryFile>>,
    faults: RwLock<HashMap<String, io::ErrorKind>>,
    write_faults: RwLock<HashMap<String, io::ErrorKind>>,
    remove_faults: RwLock<HashMap<String, io::ErrorKind>>,
    scan_fault: RwLock<Option<io::ErrorKind>>,
}

impl MemoryMedium {
    /// Creates an empty medium.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Next modification time of the shared clock.
    pub fn tick_clock() -> u64 {
        MEMORY_CLOCK.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Writes a file as a user edit would, with a fresh modification time.
    pub fn put_file(&self, path: &str, content: impl Into<Vec<u8>>) {
        self.put_file_at(path, content, Self::tick_clock());
    }

    /// Writes a file with an explicit modification time.
    pub fn put_file_at(&self, path: &str, content: impl Into<Vec<u8>>, modified_ms: u64) {
        self.files.write().insert(
            path.to_string(),
            MemoryFile {
                content: content.into(),
                modified_ms,
            },
        );
    }

    /// Removes a file as a user would. Returns false if it did not exist.
    pub fn remove_file(&self, path: &str) -> bool {
        self.files.write().remove(path).is_some()
    }

    /// Moves a file as a user would, keeping its modification time.
    pub fn move_file(&self, from: &str, to: &str) -> bool {
        let mut files = self.files.write();
        match files.remove(from) {
            Some(file) => {
                files.insert(to.to_string(), file);
                true
            }
            None => false,
        }
    }

    /// Returns the content of a file.
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.read().get(path).map(|f| f.content.clone())
    }

    /// Returns every path, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.files.read().keys().cloned().collect()
    }

    /// Makes every operation on `path` fail with `kind`.
    pub fn fail_on(&self, path: &str, kind: io::ErrorKind) {
        self.faults.write().insert(path.to_string(), kind);
    }

    /// Makes only writes to `path` fail with `kind`.
    pub fn fail_writes_on(&self, path: &str, kind: io::ErrorKind) {
        self.write_faults.write().insert(path.to_string(), kind);
    }

    /// Makes only removal of `path` fail with `kind`.
    pub fn fail_removes_on(&self, path: &str, kind: io::ErrorKind) {
        self.remove_faults.write().insert(path.to_string(), kind);
    }

    /// Removes injected faults on `path`.
    pub fn clear_fault(&self, path: &str) {
        self.faults.write().remove(path);
        self.write_faults.write().remove(path);
        self.remove_faults.write().remove(path);
    }

    /// Makes enumeration fail with `kind`, or succeed again with `None`.
    pub fn fail_scan(&self, kind: Option<io::ErrorKind>) {
        *self.scan_fault.write() = kind;
    }

    fn check(&self, path: &str) -> io::Result<()> {
        match self.faults.read().get(path) {
            Some(kind) => Err(io::Error::new(*kind, format!("injected fault on {path}"))),
            None => Ok(()),
        }
    }

    fn not_found(path: &str) -> io::Error {
        io::Error::new(io::ErrorKind::NotFound, format!("{path} not found"))
    }
}

impl ReplicaMedium for MemoryMedium {
    fn enumerate(&self, filter: &dyn ScopeFilter) -> io::Result<Vec<ScannedEntry>> {
        if let Some(kind) = *self.scan_fault.read() {
            return Err(io::Error::new(kind, "injected scan fault"));
        }
        Ok(self
            .files
            .read()
            .iter()
            .filter(|(path, _)| filter.includes(path))
            .map(|(path, file)| ScannedEntry {
                path: path.clone(),
                size: file.content.len() as u64,
                modified_ms: file.modified_ms,
            })
            .collect())
    }

    fn fingerprint(&self, path: &str) -> io::Result<Fingerprint> {
        self.check(path)?;
        let files = self.files.read();
        let file = files.get(path).ok_or_else(|| Self::not_found(path))?;
        Ok(Fingerprint::new(
            hash_bytes(&file.content),
            file.content.len() as u64,
            file.modified_ms,
        ))
    }

    fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        self.check(path)?;
        self.file(path).ok_or_else(|| Self::not_found(path))
    }

    fn write(&self, path: &str, content: &[u8], modified_ms: u64) -> io::Result<u64> {
        self.check(path)?;
        if let Some(kind) = self.write_faults.read().get(path) {
            return Err(io::Error::new(*kind, format!("injected write fault on {path}")));
        }
        self.put_file_at(path, content.to_vec(), modified_ms);
        Ok(modified_ms)
    }

    fn remove(&self, path: &str) -> io::Result<()> {
        self.check(path)?;
        if let Some(kind) = self.remove_faults.read().get(path) {
            return Err(io::Error::new(*kind, format!("injected remove fault on {path}")));
        }
        if self.remove_file(path) {
            Ok(())
        } else {
            Err(Self::not_found(path))
        }
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        self.check(from)?;
        self.check(to)?;
        let mut files = self.files.write();
        if files.contains_key(to) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{to} already exists"),
            ));
        }
        let file = files.remove(from).ok_or_else(|| Self::not_found(from))?;
        files.insert(to.to_string(), file);
        Ok(())
    }

    fn exists(&self, path: &str) -> io::Result<bool> {
        self.check(path)?;
        Ok(self.files.read().contains_key(path))
    }

    fn describe(&self) -> String {
        format!("memory:{}", self.name)
    }
}
