//! Once command implementation.

use super::{open_pair, ConsoleListener};
use crate::PairArgs;
use duosync_engine::SyncListener;
use serde::Serialize;
use std::sync::Arc;

/// Summary of a single pass.
#[derive(Debug, Serialize)]
pub struct OnceResult {
    /// Changes applied to the left folder.
    pub applied_to_left: Vec<String>,
    /// Changes applied to the right folder.
    pub applied_to_right: Vec<String>,
    /// Skipped changes.
    pub skipped: Vec<String>,
    /// Number of conflicts.
    pub conflicts: usize,
    /// Duration in milliseconds.
    pub duration_ms: u128,
}

/// Runs the once command.
pub fn run(pair: &PairArgs, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let json = format == "json";
    let listener: Option<Arc<dyn SyncListener>> = if json {
        None
    } else {
        Some(Arc::new(ConsoleListener))
    };
    let orchestrator = open_pair(pair, listener)?;
    let report = orchestrator.run_pass()?;

    match format {
        "json" => {
            let result = OnceResult {
                applied_to_left: report.applied_to_local.iter().map(ToString::to_string).collect(),
                applied_to_right: report.applied_to_remote.iter().map(ToString::to_string).collect(),
                skipped: report.skipped.iter().map(ToString::to_string).collect(),
                conflicts: report.conflicts.len(),
                duration_ms: report.duration.as_millis(),
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            if report.is_noop() {
                println!("Folders are in sync.");
            } else {
                println!(
                    "{} applied, {} skipped, {} conflicts in {:?}",
                    report.applied_count(),
                    report.skipped.len(),
                    report.conflicts.len(),
                    report.duration
                );
            }
        }
    }

    Ok(())
}
