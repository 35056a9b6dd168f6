//! Run command implementation.

use super::{open_pair, ConsoleListener};
use crate::PairArgs;
use duosync_engine::SyncScheduler;
use std::sync::Arc;
use std::time::Duration;

/// Runs the polling loop until Ctrl-C.
pub fn run(pair: &PairArgs, interval_ms: u64) -> Result<(), Box<dyn std::error::Error>> {
    let orchestrator = Arc::new(open_pair(pair, Some(Arc::new(ConsoleListener)))?);
    println!(
        "Synchronizing {} and {} every {interval_ms} ms (Ctrl-C to stop)",
        pair.left.display(),
        pair.right.display()
    );

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let scheduler = SyncScheduler::spawn(orchestrator.clone(), Duration::from_millis(interval_ms));
        let signal = tokio::signal::ctrl_c().await;
        scheduler.shutdown().await;
        signal
    })?;

    let stats = orchestrator.stats();
    println!(
        "Stopped after {} sessions: {} applied, {} skipped, {} conflicts",
        stats.sessions_completed, stats.changes_applied, stats.changes_skipped, stats.conflicts
    );
    Ok(())
}
