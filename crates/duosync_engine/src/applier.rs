//! Change application onto one replica.
//!
//! Every item is applied in isolation: an I/O failure turns into a skipped
//! change and the batch goes on. Only metadata store failures and
//! cancellation stop the batch.

use crate::config::SyncOptions;
use crate::error::{ApplyError, ItemFailure, SkipReason, SyncError, SyncResult};
use crate::events::{AppliedChange, EventBus, SkippedChange, SyncEvent};
use crate::medium::{hash_bytes, now_ms};
use crate::planner::{Action, PlannedChange, SidePlan};
use crate::recycle::RecycleReason;
use crate::replica::Replica;
use duosync_protocol::{ChangeKind, ItemRecord};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// What happened to the changes of one batch.
#[derive(Debug, Default)]
pub(crate) struct ApplyOutcome {
    pub applied: Vec<AppliedChange>,
    pub skipped: Vec<SkippedChange>,
}

pub(crate) struct Applier<'a> {
    pub options: SyncOptions,
    pub events: &'a EventBus,
    pub cancelled: &'a AtomicBool,
}

impl Applier<'_> {
    /// Applies `plan` to `target`, reading content from `source`.
    ///
    /// Renames run in rounds so that a chain (`b -> c`, then `a -> b`) lands
    /// in one batch; a rename whose destination never frees up is skipped.
    pub(crate) fn apply(
        &self,
        target: &Replica,
        source: &Replica,
        plan: &SidePlan,
        outcome: &mut ApplyOutcome,
    ) -> SyncResult<()> {
        let (renames, rest): (Vec<&PlannedChange>, Vec<&PlannedChange>) = plan
            .changes
            .iter()
            .partition(|change| change.action == Action::Rename);
        let (early, late): (Vec<&PlannedChange>, Vec<&PlannedChange>) =
            rest.into_iter().partition(|change| change.runs_before_renames());

        for change in early {
            self.apply_one(target, source, change, outcome)?;
        }

        let mut pending = renames;
        while !pending.is_empty() {
            let (ready, blocked): (Vec<&PlannedChange>, Vec<&PlannedChange>) =
                pending.into_iter().partition(|change| {
                    !target.medium().exists(&change.record.path).unwrap_or(false)
                });
            if ready.is_empty() {
                for change in blocked {
                    self.apply_one(target, source, change, outcome)?;
                }
                break;
            }
            for change in ready {
                self.apply_one(target, source, change, outcome)?;
            }
            pending = blocked;
        }

        for change in late {
            self.apply_one(target, source, change, outcome)?;
        }
        Ok(())
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn apply_one(
        &self,
        target: &Replica,
        source: &Replica,
        change: &PlannedChange,
        outcome: &mut ApplyOutcome,
    ) -> SyncResult<()> {
        self.check_cancelled()?;

        match self.execute(target, source, change) {
            Ok(Some(applied)) => {
                debug!(
                    replica = %target.id(),
                    kind = ?applied.kind,
                    path = %applied.path(),
                    "applied change"
                );
                self.events.emit(SyncEvent::Applied(applied.clone()));
                outcome.applied.push(applied);
            }
            Ok(None) => {}
            Err(ApplyError::Skip(failure)) => {
                let skipped = SkippedChange {
                    replica: target.id(),
                    kind: change.kind(),
                    path: reported_path(change).to_string(),
                    reason: failure.reason,
                    cause: failure.cause,
                };
                if skipped.reason == SkipReason::FilteredOut {
                    debug!(replica = %target.id(), path = %skipped.path, "filtered out");
                } else {
                    warn!(
                        replica = %target.id(),
                        kind = ?skipped.kind,
                        path = %skipped.path,
                        reason = %skipped.reason,
                        cause = skipped.cause.as_deref().unwrap_or(""),
                        "skipped change"
                    );
                }
                self.events.emit(SyncEvent::Skipped(skipped.clone()));
                outcome.skipped.push(skipped);
            }
            Err(ApplyError::Fatal(error)) => return Err(error),
        }
        Ok(())
    }

    fn execute(
        &self,
        target: &Replica,
        source: &Replica,
        change: &PlannedChange,
    ) -> Result<Option<AppliedChange>, ApplyError> {
        let applied = match &change.action {
            Action::Stamp => {
                target.store().put(change.record.clone())?;
                None
            }
            Action::Defer => None,
            Action::Skip { failure, .. } => return Err(ApplyError::Skip(failure.clone())),
            Action::Delete => Some(self.delete(target, change)?),
            Action::Rename => Some(self.rename(target, change)?),
            Action::Update => Some(self.update(target, source, change)?),
            Action::Create => Some(self.create(target, source, change)?),
            Action::ReplaceLoser { loser, kind } => {
                Some(self.replace(target, source, change, loser, *kind)?)
            }
        };

        if let Some(follow_up) = &change.follow_up {
            source.store().put(follow_up.record.clone())?;
        }
        Ok(applied)
    }

    fn delete(&self, target: &Replica, change: &PlannedChange) -> Result<AppliedChange, ApplyError> {
        let medium = target.medium();
        let current = live_current(change)?;

        match medium.read(&current.path) {
            Ok(content) => {
                verify(&content, current)?;
                self.recycle(target, &current.path, &content, change.recycle)?;
                match medium.remove(&current.path) {
                    Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                    _ => {}
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        target.store().put(ItemRecord {
            tombstoned_at_ms: Some(now_ms()),
            ..change.record.clone()
        })?;
        Ok(applied(target, ChangeKind::Delete, Some(&current.path), None))
    }

    fn rename(&self, target: &Replica, change: &PlannedChange) -> Result<AppliedChange, ApplyError> {
        let medium = target.medium();
        let current = live_current(change)?;

        let on_disk = medium.fingerprint(&current.path)?;
        let unchanged = current
            .fingerprint
            .as_ref()
            .is_some_and(|fp| fp.same_content(&on_disk));
        if !unchanged {
            return Err(changed_since_scan(&current.path));
        }

        medium.rename(&current.path, &change.record.path)?;
        target.store().put(change.record.clone())?;
        Ok(applied(
            target,
            ChangeKind::Rename,
            Some(&current.path),
            Some(&change.record.path),
        ))
    }

    fn update(
        &self,
        target: &Replica,
        source: &Replica,
        change: &PlannedChange,
    ) -> Result<AppliedChange, ApplyError> {
        let medium = target.medium();
        let current = live_current(change)?;
        let record = &change.record;

        let previous = medium.read(&current.path)?;
        verify(&previous, current)?;
        let content = read_source(source, record)?;

        let moving = current.path != record.path;
        if moving && medium.exists(&record.path)? {
            return Err(occupied(&record.path));
        }

        self.recycle(target, &current.path, &previous, change.recycle)?;
        if moving {
            medium.rename(&current.path, &record.path)?;
        }
        let stored = match write_content(target, record, &content) {
            Ok(stored) => stored,
            Err(error) => {
                if moving {
                    if let Err(e) = medium.rename(&record.path, &current.path) {
                        warn!(replica = %target.id(), path = %record.path, error = %e, "could not move file back");
                    }
                }
                return Err(error);
            }
        };
        target.store().put(stored)?;
        Ok(applied(
            target,
            ChangeKind::Update,
            Some(&current.path),
            Some(&record.path),
        ))
    }

    fn create(
        &self,
        target: &Replica,
        source: &Replica,
        change: &PlannedChange,
    ) -> Result<AppliedChange, ApplyError> {
        let record = &change.record;
        if target.medium().exists(&record.path)? {
            return Err(occupied(&record.path));
        }
        let content = read_source(source, record)?;
        let stored = write_content(target, record, &content)?;
        target.store().put(stored)?;
        Ok(applied(target, ChangeKind::Create, None, Some(&record.path)))
    }

    /// Writes over an item that lost a path conflict, keeping the loser as
    /// a tombstone on this replica. An item moved onto the path leaves its
    /// old one; if that fails the loser's content is put back.
    fn replace(
        &self,
        target: &Replica,
        source: &Replica,
        change: &PlannedChange,
        loser: &ItemRecord,
        kind: ChangeKind,
    ) -> Result<AppliedChange, ApplyError> {
        let medium = target.medium();
        let record = &change.record;
        let previous = medium.read(&loser.path)?;
        verify(&previous, loser)?;
        let content = read_source(source, record)?;

        let moving = change
            .current
            .as_ref()
            .filter(|current| current.is_live() && current.path != record.path);
        if let Some(current) = moving {
            let before = medium.read(&current.path)?;
            verify(&before, current)?;
            if kind == ChangeKind::Update {
                self.recycle(target, &current.path, &before, Some(RecycleReason::PreviousOnUpdate))?;
            }
        }

        self.recycle(target, &loser.path, &previous, change.recycle)?;
        let stored = write_content(target, record, &content)?;
        if let Some(current) = moving {
            match medium.remove(&current.path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => {
                    let mtime = loser.fingerprint.map_or_else(now_ms, |fp| fp.modified_ms);
                    if let Err(restore) = medium.write(&loser.path, &previous, mtime) {
                        warn!(replica = %target.id(), path = %loser.path, error = %restore, "could not restore replaced file");
                    }
                    return Err(e.into());
                }
                _ => {}
            }
        }

        let store = target.store();
        let mut version = loser.version.clone();
        version.set(target.id(), store.allocate_tick()?);
        store.put(loser.clone().into_tombstone(version, target.id(), now_ms()))?;
        store.put(stored)?;
        Ok(applied(
            target,
            kind,
            moving.map(|current| current.path.as_str()),
            Some(&record.path),
        ))
    }

    fn recycle(
        &self,
        target: &Replica,
        path: &str,
        content: &[u8],
        reason: Option<RecycleReason>,
    ) -> Result<(), ApplyError> {
        let Some(reason) = reason.filter(|reason| self.options.recycles(*reason)) else {
            return Ok(());
        };
        let Some(bin) = target.recycle_bin() else {
            return Err(ItemFailure::io(format!("no recycle bin to keep {path}")).into());
        };
        bin.recycle(path, content, reason)?;
        Ok(())
    }
}

fn reported_path(change: &PlannedChange) -> &str {
    match change.kind() {
        ChangeKind::Delete => change.current_path().unwrap_or(&change.record.path),
        _ => &change.record.path,
    }
}

fn applied(
    target: &Replica,
    kind: ChangeKind,
    old_path: Option<&str>,
    new_path: Option<&str>,
) -> AppliedChange {
    AppliedChange {
        replica: target.id(),
        kind,
        old_path: old_path.map(str::to_string),
        new_path: new_path.map(str::to_string),
    }
}

fn live_current(change: &PlannedChange) -> Result<&ItemRecord, ApplyError> {
    change
        .current
        .as_ref()
        .filter(|record| record.is_live())
        .ok_or_else(|| ItemFailure::io(format!("no live record for {}", change.record.path)).into())
}

fn changed_since_scan(path: &str) -> ApplyError {
    ItemFailure::io(format!("{path} changed since it was last scanned")).into()
}

fn occupied(path: &str) -> ApplyError {
    ItemFailure::io(format!("{path} already exists")).into()
}

/// Checks that `content` is what `record` describes.
fn verify(content: &[u8], record: &ItemRecord) -> Result<(), ApplyError> {
    let matches = record
        .fingerprint
        .as_ref()
        .is_some_and(|fp| fp.size == content.len() as u64 && fp.hash == hash_bytes(content));
    if matches {
        Ok(())
    } else {
        Err(changed_since_scan(&record.path))
    }
}

fn read_source(source: &Replica, record: &ItemRecord) -> Result<Vec<u8>, ApplyError> {
    let content = source.medium().read(&record.path)?;
    verify(&content, record)?;
    Ok(content)
}

/// Writes `content` and returns the record to store, carrying the
/// modification time the target actually kept.
fn write_content(target: &Replica, record: &ItemRecord, content: &[u8]) -> Result<ItemRecord, ApplyError> {
    let mut stored = record.clone();
    let Some(fingerprint) = stored.fingerprint.as_mut() else {
        return Err(ItemFailure::io(format!("{} has no content", record.path)).into());
    };
    fingerprint.modified_ms = target
        .medium()
        .write(&record.path, content, fingerprint.modified_ms)?;
    Ok(stored)
}
