//! Polling loop driving repeated sync passes.

use crate::error::SyncError;
use crate::session::SyncOrchestrator;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// A background task running one detect+sync pass per interval.
///
/// Passes run on the blocking pool. A failed pass is logged and the next
/// tick tries again.
pub struct SyncScheduler {
    orchestrator: Arc<SyncOrchestrator>,
    shutdown: watch::Sender<bool>,
    passes: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl SyncScheduler {
    /// Spawns the loop on the current tokio runtime.
    ///
    /// The first pass runs immediately.
    pub fn spawn(orchestrator: Arc<SyncOrchestrator>, interval: Duration) -> Self {
        let (shutdown, mut stop) = watch::channel(false);
        let passes = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn({
            let orchestrator = orchestrator.clone();
            let passes = passes.clone();
            async move {
                let mut ticks = tokio::time::interval(interval);
                ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
                info!(interval = ?interval, "sync scheduler started");

                loop {
                    tokio::select! {
                        _ = ticks.tick() => {}
                        _ = stop.changed() => break,
                    }
                    if *stop.borrow() {
                        break;
                    }

                    let pass = orchestrator.clone();
                    match tokio::task::spawn_blocking(move || pass.run_pass()).await {
                        Ok(Ok(report)) => {
                            debug!(applied = report.applied_count(), "pass finished");
                        }
                        Ok(Err(SyncError::Cancelled)) => break,
                        Ok(Err(e)) => warn!(error = %e, "sync pass failed, retrying next tick"),
                        Err(e) => warn!(error = %e, "sync pass panicked"),
                    }
                    passes.fetch_add(1, Ordering::Relaxed);
                }
                info!("sync scheduler stopped");
            }
        });

        Self {
            orchestrator,
            shutdown,
            passes,
            task,
        }
    }

    /// Number of passes run so far.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Stops the loop and waits for it.
    ///
    /// A running pass is cancelled at its next item boundary.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        self.orchestrator.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "sync scheduler task failed");
        }
    }
}

impl std::fmt::Debug for SyncScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncScheduler")
            .field("passes", &self.passes())
            .finish()
    }
}
