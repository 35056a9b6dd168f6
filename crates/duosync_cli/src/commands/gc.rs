//! Gc command implementation.

use super::open_existing;
use duosync_engine::{collect_tombstones, now_ms};
use std::path::Path;
use std::time::Duration;

/// Runs the gc command.
pub fn run(path: &Path, retention_days: u64) -> Result<(), Box<dyn std::error::Error>> {
    let replica = open_existing(path)?;
    let retention = Duration::from_secs(retention_days.saturating_mul(86_400));
    let report = collect_tombstones(&replica, retention, now_ms())?;

    println!(
        "Examined {} tombstones, purged {}",
        report.examined, report.purged
    );
    if report.examined == 0 && replica.store().peer_knowledge()?.is_empty() {
        println!("(no completed session yet; tombstones are kept)");
    }
    Ok(())
}
