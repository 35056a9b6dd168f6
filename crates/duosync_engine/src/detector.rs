//! Change detection: compares a replica's files with its metadata.

use crate::error::{SyncError, SyncResult};
use crate::filter::ScopeFilter;
use crate::medium::now_ms;
use crate::replica::Replica;
use duosync_protocol::{
    ChangeKind, ChangeRecord, Fingerprint, ItemId, ItemRecord, ReplicaId, VersionVector,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Outcome of one detection pass.
#[derive(Debug, Clone)]
pub struct DetectionReport {
    /// Replica that was scanned.
    pub replica: ReplicaId,
    /// Changes recorded, each already persisted.
    pub changes: Vec<ChangeRecord>,
    /// Records whose metadata was refreshed without a content change.
    pub refreshed: usize,
    /// Number of files enumerated.
    pub scanned: usize,
    /// Time spent.
    pub duration: Duration,
}

impl DetectionReport {
    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Number of changes of `kind`.
    pub fn count(&self, kind: ChangeKind) -> usize {
        self.changes.iter().filter(|c| c.kind == kind).count()
    }
}

/// Detects what changed on a replica since the last pass.
///
/// A pass enumerates the replica, matches files to live records by path and
/// classifies the differences. A vanished path and an appeared path with
/// identical content are paired into a rename; pairing is one-to-one in
/// sorted path order, so surplus duplicates become deletes and creates.
///
/// Every change first reserves a tick from the store and is then persisted,
/// so a crash can waste a tick but never lose a change.
pub struct ChangeDetector {
    filter: Arc<dyn ScopeFilter>,
}

impl ChangeDetector {
    /// Creates a detector with the given scope filter.
    pub fn new(filter: Arc<dyn ScopeFilter>) -> Self {
        Self { filter }
    }

    /// Runs one pass under the replica lock.
    pub fn detect(&self, replica: &Replica) -> SyncResult<DetectionReport> {
        let _guard = replica.lock();
        self.detect_locked(replica)
    }

    /// Runs detection on both replicas concurrently.
    pub fn detect_pair(
        &self,
        a: &Replica,
        b: &Replica,
    ) -> SyncResult<(DetectionReport, DetectionReport)> {
        std::thread::scope(|scope| {
            let first = scope.spawn(|| self.detect(a));
            let second = self.detect(b);
            let first = first
                .join()
                .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
            Ok((first?, second?))
        })
    }

    fn detect_locked(&self, replica: &Replica) -> SyncResult<DetectionReport> {
        let start = Instant::now();
        let id = replica.id();
        let medium = replica.medium();
        let store = replica.store();

        let scanned = medium
            .enumerate(self.filter.as_ref())
            .map_err(|source| SyncError::Scan { replica: id, source })?;

        let mut prior: HashMap<String, ItemRecord> = store
            .all()?
            .filter(ItemRecord::is_live)
            .map(|record| (record.path.clone(), record))
            .collect();

        let mut changes = Vec::new();
        let mut refreshed = 0;
        let mut appeared: Vec<(String, Fingerprint)> = Vec::new();

        for entry in &scanned {
            let Some(record) = prior.remove(&entry.path) else {
                match medium.fingerprint(&entry.path) {
                    Ok(fingerprint) => appeared.push((entry.path.clone(), fingerprint)),
                    Err(e) => warn!(replica = %id, path = %entry.path, error = %e, "cannot hash new file"),
                }
                continue;
            };

            let unchanged = record
                .fingerprint
                .as_ref()
                .is_some_and(|fp| fp.size == entry.size && fp.modified_ms == entry.modified_ms);
            if unchanged {
                continue;
            }

            let current = match medium.fingerprint(&entry.path) {
                Ok(fingerprint) => fingerprint,
                Err(e) => {
                    warn!(replica = %id, path = %entry.path, error = %e, "cannot hash file");
                    continue;
                }
            };

            if record
                .fingerprint
                .as_ref()
                .is_some_and(|old| old.same_content(&current))
            {
                store.put(ItemRecord {
                    fingerprint: Some(current),
                    ..record
                })?;
                refreshed += 1;
                continue;
            }

            let version = advance(store.allocate_tick()?, &record.version, id);
            let change = ChangeRecord::update(
                record.item_id,
                entry.path.clone(),
                current.clone(),
                version.clone(),
                id,
            );
            store.put(ItemRecord {
                fingerprint: Some(current),
                version,
                last_writer: id,
                last_kind: ChangeKind::Update,
                ..record
            })?;
            debug!(replica = %id, path = %entry.path, "detected update");
            changes.push(change);
        }

        // Records at excluded paths stay as they are.
        let mut vanished: Vec<ItemRecord> = prior
            .into_values()
            .filter(|record| self.filter.includes(&record.path))
            .collect();
        vanished.sort_by(|a, b| a.path.cmp(&b.path));

        let mut by_content: BTreeMap<([u8; 32], u64), VecDeque<usize>> = BTreeMap::new();
        for (index, (_, fingerprint)) in appeared.iter().enumerate() {
            by_content
                .entry((fingerprint.hash, fingerprint.size))
                .or_default()
                .push_back(index);
        }
        let mut paired = vec![false; appeared.len()];

        for record in vanished {
            let candidate = record.fingerprint.as_ref().and_then(|fp| {
                by_content
                    .get_mut(&(fp.hash, fp.size))
                    .and_then(VecDeque::pop_front)
            });

            let version = advance(store.allocate_tick()?, &record.version, id);
            match candidate {
                Some(index) => {
                    paired[index] = true;
                    let (new_path, fingerprint) = appeared[index].clone();
                    let change = ChangeRecord::rename(
                        record.item_id,
                        record.path.clone(),
                        new_path.clone(),
                        fingerprint.clone(),
                        version.clone(),
                        id,
                    );
                    debug!(replica = %id, from = %record.path, to = %new_path, "detected rename");
                    store.put(ItemRecord {
                        path: new_path,
                        fingerprint: Some(fingerprint),
                        version,
                        last_writer: id,
                        last_kind: ChangeKind::Rename,
                        ..record
                    })?;
                    changes.push(change);
                }
                None => {
                    let change =
                        ChangeRecord::delete(record.item_id, record.path.clone(), version.clone(), id);
                    debug!(replica = %id, path = %record.path, "detected delete");
                    store.put(record.into_tombstone(version, id, now_ms()))?;
                    changes.push(change);
                }
            }
        }

        for ((path, fingerprint), paired) in appeared.into_iter().zip(paired) {
            if paired {
                continue;
            }
            let tick = store.allocate_tick()?;
            let item_id = ItemId::new();
            let version = VersionVector::single(id, tick);
            let change =
                ChangeRecord::create(item_id, path.clone(), fingerprint.clone(), version.clone(), id);
            debug!(replica = %id, path = %path, "detected create");
            store.put(ItemRecord::live(
                item_id,
                path,
                fingerprint,
                version,
                id,
                ChangeKind::Create,
            ))?;
            changes.push(change);
        }

        let report = DetectionReport {
            replica: id,
            changes,
            refreshed,
            scanned: scanned.len(),
            duration: start.elapsed(),
        };
        if report.is_empty() {
            debug!(replica = %id, scanned = report.scanned, "no changes detected");
        } else {
            info!(
                replica = %id,
                scanned = report.scanned,
                changes = report.changes.len(),
                "detected changes"
            );
        }
        Ok(report)
    }
}

fn advance(tick: u64, version: &VersionVector, replica: ReplicaId) -> VersionVector {
    let mut next = version.clone();
    next.set(replica, tick);
    next
}
