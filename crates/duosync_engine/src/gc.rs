//! Tombstone garbage collection.

use crate::error::SyncResult;
use crate::replica::Replica;
use std::time::Duration;
use tracing::{debug, info};

/// Result of a collection run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Tombstones looked at.
    pub examined: usize,
    /// Tombstones removed.
    pub purged: usize,
}

/// Purges tombstones older than `retention` that every known peer has seen.
///
/// A tombstone may only go once no replica can still offer the live item
/// back: the replica's own knowledge and the remembered knowledge of every
/// peer must all know the deletion. A replica that has never completed a
/// session has no peers and keeps all of its tombstones.
pub fn collect_tombstones(replica: &Replica, retention: Duration, now_ms: u64) -> SyncResult<GcReport> {
    let _guard = replica.lock();
    let store = replica.store();
    let peers = store.peer_knowledge()?;
    let mut report = GcReport::default();
    if peers.is_empty() {
        debug!(replica = %replica.id(), "no peers yet, keeping tombstones");
        return Ok(report);
    }

    let own = store.knowledge()?;
    let cutoff = now_ms.saturating_sub(u64::try_from(retention.as_millis()).unwrap_or(u64::MAX));

    let tombstones: Vec<_> = store.all()?.filter(|record| record.tombstone).collect();
    for record in tombstones {
        report.examined += 1;
        let old_enough = record.tombstoned_at_ms.is_some_and(|at| at <= cutoff);
        let known = own.knows(record.item_id, &record.version)
            && peers
                .values()
                .all(|peer| peer.knows(record.item_id, &record.version));
        if old_enough && known && store.purge(record.item_id)? {
            report.purged += 1;
        }
    }

    if report.purged > 0 {
        info!(
            replica = %replica.id(),
            examined = report.examined,
            purged = report.purged,
            "purged tombstones"
        );
    }
    Ok(report)
}
