//! Sync session orchestration.
//!
//! A [`SyncOrchestrator`] owns one ordered replica pair and drives sessions
//! between them:
//!
//! ```text
//! Idle -> ExchangeKnowledge -> ComputeDelta -> ApplyRemoteToLocal
//!      -> ApplyLocalToRemote -> CommitKnowledge -> Idle
//! ```
//!
//! Any fatal error moves the orchestrator to `Failed`, from which the next
//! session may start again.

use crate::applier::{Applier, ApplyOutcome};
use crate::config::SyncConfig;
use crate::detector::{ChangeDetector, DetectionReport};
use crate::error::{SyncError, SyncResult};
use crate::events::{AppliedChange, EventBus, SkippedChange, SyncListener};
use crate::filter::{AllowAll, ScopeFilter};
use crate::planner::{self, PlanInput, Side};
use crate::replica::Replica;
use duosync_protocol::{Conflict, ConflictResolver};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// The current step of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session is running.
    Idle,
    /// Reading both replicas' knowledge.
    ExchangeKnowledge,
    /// Computing deltas and resolving conflicts.
    ComputeDelta,
    /// Applying remote changes to the local replica.
    ApplyRemoteToLocal,
    /// Applying local changes to the remote replica.
    ApplyLocalToRemote,
    /// Merging knowledge after application.
    CommitKnowledge,
    /// The last session hit a fatal error.
    Failed,
}

impl SessionState {
    /// Returns true if a session is running.
    pub fn is_active(&self) -> bool {
        !matches!(self, SessionState::Idle | SessionState::Failed)
    }

    /// Returns true if a new session may start.
    pub fn can_start(&self) -> bool {
        !self.is_active()
    }
}

/// Cumulative statistics of an orchestrator.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Sessions that reached `Idle` through the commit.
    pub sessions_completed: u64,
    /// Sessions that ended in `Failed`.
    pub sessions_failed: u64,
    /// Sessions stopped by [`SyncOrchestrator::cancel`].
    pub sessions_cancelled: u64,
    /// Changes applied across all sessions.
    pub changes_applied: u64,
    /// Changes skipped across all sessions.
    pub changes_skipped: u64,
    /// Conflicts encountered across all sessions.
    pub conflicts: u64,
    /// When the last session completed.
    pub last_session: Option<Instant>,
    /// Message of the last fatal error.
    pub last_error: Option<String>,
}

/// Result of one session.
#[derive(Debug, Clone, Default)]
pub struct SessionReport {
    /// Changes applied to the local replica.
    pub applied_to_local: Vec<AppliedChange>,
    /// Changes applied to the remote replica.
    pub applied_to_remote: Vec<AppliedChange>,
    /// Changes skipped on either replica.
    pub skipped: Vec<SkippedChange>,
    /// Conflicts found while computing the delta, with their resolution.
    pub conflicts: Vec<Conflict>,
    /// Wall time of the session.
    pub duration: Duration,
}

impl SessionReport {
    /// Returns true if nothing was applied or skipped.
    pub fn is_noop(&self) -> bool {
        self.applied_to_local.is_empty()
            && self.applied_to_remote.is_empty()
            && self.skipped.is_empty()
            && self.conflicts.is_empty()
    }

    /// Number of applied changes on both replicas.
    pub fn applied_count(&self) -> usize {
        self.applied_to_local.len() + self.applied_to_remote.len()
    }
}

/// Builder for [`SyncOrchestrator`].
pub struct SyncOrchestratorBuilder {
    local: Arc<Replica>,
    remote: Arc<Replica>,
    config: SyncConfig,
    resolver: Option<Arc<dyn ConflictResolver>>,
    filter: Arc<dyn ScopeFilter>,
    listeners: Vec<Arc<dyn SyncListener>>,
}

impl SyncOrchestratorBuilder {
    /// Sets the configuration.
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides the conflict resolver. Defaults to the configured policy.
    pub fn resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Sets the scope filter used by detection and planning.
    pub fn filter(mut self, filter: Arc<dyn ScopeFilter>) -> Self {
        self.filter = filter;
        self
    }

    /// Attaches a listener.
    pub fn listener(mut self, listener: Arc<dyn SyncListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Validates the pair and builds the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Configuration` if both replicas share an id, or if
    /// a recycle option is enabled for a replica that receives changes but
    /// has no recycle bin.
    pub fn build(self) -> SyncResult<SyncOrchestrator> {
        if self.local.id() == self.remote.id() {
            return Err(SyncError::configuration(format!(
                "both replicas have id {}",
                self.local.id()
            )));
        }

        let direction = self.config.direction;
        if self.config.options.recycles_anything() {
            let targets = [
                (direction.applies_to_local(), &self.local),
                (direction.applies_to_remote(), &self.remote),
            ];
            for (_, replica) in targets.iter().filter(|(permitted, _)| *permitted) {
                if replica.recycle_bin().is_none() {
                    return Err(SyncError::configuration(format!(
                        "recycling is enabled but {} has no recycle bin",
                        replica.label()
                    )));
                }
            }
        }

        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(self.config.policy));
        let events = EventBus::new();
        for listener in self.listeners {
            events.add_listener(listener);
        }

        Ok(SyncOrchestrator {
            detector: ChangeDetector::new(self.filter.clone()),
            local: self.local,
            remote: self.remote,
            config: self.config,
            resolver,
            filter: self.filter,
            events,
            session: Mutex::new(()),
            state: RwLock::new(SessionState::Idle),
            stats: RwLock::new(SyncStats::default()),
            cancelled: AtomicBool::new(false),
        })
    }
}

/// Drives sync sessions between a local and a remote replica.
pub struct SyncOrchestrator {
    local: Arc<Replica>,
    remote: Arc<Replica>,
    config: SyncConfig,
    resolver: Arc<dyn ConflictResolver>,
    filter: Arc<dyn ScopeFilter>,
    detector: ChangeDetector,
    events: EventBus,
    session: Mutex<()>,
    state: RwLock<SessionState>,
    stats: RwLock<SyncStats>,
    cancelled: AtomicBool,
}

impl SyncOrchestrator {
    /// Starts building an orchestrator for the given pair.
    pub fn builder(local: Arc<Replica>, remote: Arc<Replica>) -> SyncOrchestratorBuilder {
        SyncOrchestratorBuilder {
            local,
            remote,
            config: SyncConfig::default(),
            resolver: None,
            filter: Arc::new(AllowAll),
            listeners: Vec::new(),
        }
    }

    /// Local replica.
    pub fn local(&self) -> &Arc<Replica> {
        &self.local
    }

    /// Remote replica.
    pub fn remote(&self) -> &Arc<Replica> {
        &self.remote
    }

    /// Configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Event bus for listeners and subscribers.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Cumulative statistics.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Requests cancellation of the running session.
    ///
    /// The item being applied completes first; the session then stops
    /// without committing knowledge. A request made while no session runs
    /// cancels the next one. The request is consumed when a session ends.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, state: SessionState) {
        debug!(?state, "session state");
        *self.state.write() = state;
    }

    /// Runs change detection on both replicas.
    pub fn detect_changes(&self) -> SyncResult<(DetectionReport, DetectionReport)> {
        let reports = self.detector.detect_pair(&self.local, &self.remote)?;
        debug!(
            local = reports.0.changes.len(),
            remote = reports.1.changes.len(),
            "detected changes"
        );
        Ok(reports)
    }

    /// Runs detection (if it is explicit) followed by a session.
    pub fn run_pass(&self) -> SyncResult<SessionReport> {
        if self.config.options.explicit_detect_changes {
            if let Err(e) = self.detect_changes() {
                self.handle_error(&e);
                return Err(e);
            }
        }
        self.sync()
    }

    /// Runs one session.
    ///
    /// # Errors
    ///
    /// - `SessionBusy` if a session is already running.
    /// - `Cancelled` if [`cancel`](Self::cancel) was called; knowledge is
    ///   not committed.
    /// - `StoreUnavailable` or `Scan` on fatal failures; the orchestrator
    ///   moves to `Failed`.
    pub fn sync(&self) -> SyncResult<SessionReport> {
        let Some(_session) = self.session.try_lock() else {
            return Err(SyncError::SessionBusy);
        };
        let state = self.state();
        if !state.can_start() {
            return Err(SyncError::InvalidStateTransition {
                from: format!("{state:?}"),
                to: "ExchangeKnowledge".into(),
            });
        }

        let start = Instant::now();
        let result = self.run_session(start);
        self.reset_cancel();

        match result {
            Ok(report) => {
                self.set_state(SessionState::Idle);
                let mut stats = self.stats.write();
                stats.sessions_completed += 1;
                stats.changes_applied += report.applied_count() as u64;
                stats.changes_skipped += report.skipped.len() as u64;
                stats.conflicts += report.conflicts.len() as u64;
                stats.last_session = Some(Instant::now());
                if report.is_noop() {
                    debug!(duration = ?report.duration, "session found nothing to do");
                } else {
                    info!(
                        to_local = report.applied_to_local.len(),
                        to_remote = report.applied_to_remote.len(),
                        skipped = report.skipped.len(),
                        conflicts = report.conflicts.len(),
                        duration = ?report.duration,
                        "session completed"
                    );
                }
                Ok(report)
            }
            Err(SyncError::Cancelled) => {
                self.set_state(SessionState::Idle);
                self.stats.write().sessions_cancelled += 1;
                info!("session cancelled");
                Err(SyncError::Cancelled)
            }
            Err(e) => {
                self.handle_error(&e);
                Err(e)
            }
        }
    }

    fn handle_error(&self, error: &SyncError) {
        error!(error = %error, "session failed");
        self.set_state(SessionState::Failed);
        let mut stats = self.stats.write();
        stats.sessions_failed += 1;
        stats.last_error = Some(error.to_string());
    }

    fn run_session(&self, start: Instant) -> SyncResult<SessionReport> {
        if !self.config.options.explicit_detect_changes {
            self.detect_changes()?;
        }
        self.check_cancelled()?;

        let (first, second) = if self.local.id() < self.remote.id() {
            (&self.local, &self.remote)
        } else {
            (&self.remote, &self.local)
        };
        let _first = first.lock();
        let _second = second.lock();

        let local_store = self.local.store();
        let remote_store = self.remote.store();
        let direction = self.config.direction;

        self.set_state(SessionState::ExchangeKnowledge);
        let local_knowledge = local_store.knowledge()?;
        let remote_knowledge = remote_store.knowledge()?;
        self.check_cancelled()?;

        self.set_state(SessionState::ComputeDelta);
        let plan = planner::compute(&PlanInput {
            local: local_store,
            remote: remote_store,
            local_knowledge: &local_knowledge,
            remote_knowledge: &remote_knowledge,
            direction,
            resolver: self.resolver.as_ref(),
            filter: self.filter.as_ref(),
        })?;
        local_store.add_exceptions(&plan.exceptions(Side::Local))?;
        remote_store.add_exceptions(&plan.exceptions(Side::Remote))?;
        self.check_cancelled()?;

        let mut report = SessionReport {
            conflicts: plan.conflicts.clone(),
            ..SessionReport::default()
        };
        let applier = Applier {
            options: self.config.options,
            events: &self.events,
            cancelled: &self.cancelled,
        };

        if direction.applies_to_local() {
            self.set_state(SessionState::ApplyRemoteToLocal);
            let mut outcome = ApplyOutcome::default();
            applier.apply(&self.local, &self.remote, plan.side(Side::Local), &mut outcome)?;
            report.applied_to_local = outcome.applied;
            report.skipped.extend(outcome.skipped);
        }
        if direction.applies_to_remote() {
            self.set_state(SessionState::ApplyLocalToRemote);
            let mut outcome = ApplyOutcome::default();
            applier.apply(&self.remote, &self.local, plan.side(Side::Remote), &mut outcome)?;
            report.applied_to_remote = outcome.applied;
            report.skipped.extend(outcome.skipped);
        }
        self.check_cancelled()?;

        self.set_state(SessionState::CommitKnowledge);
        if direction.applies_to_local() && plan.local.incoming > 0 {
            local_store.absorb_knowledge(&remote_knowledge)?;
        }
        if direction.applies_to_remote() && plan.remote.incoming > 0 {
            remote_store.absorb_knowledge(&local_knowledge)?;
        }
        local_store.remember_peer(self.remote.id(), &remote_store.knowledge()?)?;
        remote_store.remember_peer(self.local.id(), &local_store.knowledge()?)?;

        report.duration = start.elapsed();
        Ok(report)
    }
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SyncDirection, SyncOptions};
    use crate::medium::MemoryMedium;
    use crate::recycle::MemoryRecycleBin;
    use duosync_protocol::{ChangeKind, ReplicaId};
    use duosync_storage::memory_store;
    use std::io;
    use std::sync::OnceLock;

    fn replica(name: &str) -> (Arc<MemoryMedium>, Arc<Replica>) {
        let medium = Arc::new(MemoryMedium::new(name));
        let replica = Replica::new(medium.clone(), Arc::new(memory_store(ReplicaId::new())))
            .with_recycle_bin(Arc::new(MemoryRecycleBin::new()));
        (medium, Arc::new(replica))
    }

    #[test]
    fn same_replica_twice_is_rejected() {
        let (_, a) = replica("a");
        let err = SyncOrchestrator::builder(a.clone(), a).build().unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));
    }

    #[test]
    fn recycling_needs_a_bin_on_receiving_replicas() {
        let (_, a) = replica("a");
        let bare = Arc::new(Replica::new(
            Arc::new(MemoryMedium::new("bare")),
            Arc::new(memory_store(ReplicaId::new())),
        ));

        let err = SyncOrchestrator::builder(a.clone(), bare.clone())
            .build()
            .unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));

        // Download-only never writes to the remote side.
        let config = SyncConfig::default().with_direction(SyncDirection::DownloadOnly);
        assert!(SyncOrchestrator::builder(a.clone(), bare.clone())
            .config(config)
            .build()
            .is_ok());

        let config = SyncConfig::default().with_options(SyncOptions::none());
        assert!(SyncOrchestrator::builder(a, bare).config(config).build().is_ok());
    }

    #[test]
    fn create_propagates_and_second_session_is_noop() {
        let (left_files, left) = replica("left");
        let (right_files, right) = replica("right");
        let orchestrator = SyncOrchestrator::builder(left.clone(), right.clone())
            .build()
            .unwrap();
        left_files.put_file("notes.txt", "hello");

        let report = orchestrator.run_pass().unwrap();
        assert_eq!(report.applied_to_remote.len(), 1);
        assert_eq!(report.applied_to_remote[0].kind, ChangeKind::Create);
        assert_eq!(report.applied_to_remote[0].new_path.as_deref(), Some("notes.txt"));
        assert_eq!(right_files.file("notes.txt").unwrap(), b"hello");
        assert_eq!(orchestrator.state(), SessionState::Idle);

        let before = (
            left.store().knowledge().unwrap(),
            right.store().knowledge().unwrap(),
        );
        let again = orchestrator.run_pass().unwrap();
        assert!(again.is_noop());
        assert_eq!(left.store().knowledge().unwrap(), before.0);
        assert_eq!(right.store().knowledge().unwrap(), before.1);
        assert_eq!(orchestrator.stats().sessions_completed, 2);
    }

    #[test]
    fn upload_only_leaves_local_untouched() {
        let (left_files, left) = replica("left");
        let (right_files, right) = replica("right");
        let config = SyncConfig::default().with_direction(SyncDirection::UploadOnly);
        let orchestrator = SyncOrchestrator::builder(left, right)
            .config(config)
            .build()
            .unwrap();
        left_files.put_file("up.txt", "up");
        right_files.put_file("down.txt", "down");

        let report = orchestrator.run_pass().unwrap();
        assert!(report.applied_to_local.is_empty());
        assert_eq!(right_files.file("up.txt").unwrap(), b"up");
        assert!(left_files.file("down.txt").is_none());
    }

    #[test]
    fn scan_failure_moves_to_failed_and_recovers() {
        let (left_files, left) = replica("left");
        let (_, right) = replica("right");
        let orchestrator = SyncOrchestrator::builder(left, right).build().unwrap();

        left_files.fail_scan(Some(io::ErrorKind::Other));
        let err = orchestrator.run_pass().unwrap_err();
        assert!(matches!(err, SyncError::Scan { .. }));
        assert_eq!(orchestrator.state(), SessionState::Failed);
        assert_eq!(orchestrator.stats().sessions_failed, 1);
        assert!(orchestrator.stats().last_error.is_some());

        left_files.fail_scan(None);
        orchestrator.run_pass().unwrap();
        assert_eq!(orchestrator.state(), SessionState::Idle);
    }

    #[derive(Default)]
    struct CancelOnFirst {
        orchestrator: OnceLock<Arc<SyncOrchestrator>>,
        fired: AtomicBool,
    }

    impl SyncListener for CancelOnFirst {
        fn on_applied(&self, _change: &AppliedChange) {
            if self.fired.swap(true, Ordering::SeqCst) {
                return;
            }
            if let Some(orchestrator) = self.orchestrator.get() {
                orchestrator.cancel();
            }
        }
    }

    #[test]
    fn cancellation_stops_after_the_current_item() {
        let (left_files, left) = replica("left");
        let (right_files, right) = replica("right");
        let canceller = Arc::new(CancelOnFirst::default());
        let orchestrator = Arc::new(
            SyncOrchestrator::builder(left, right.clone())
                .listener(canceller.clone())
                .build()
                .unwrap(),
        );
        assert!(canceller.orchestrator.set(orchestrator.clone()).is_ok());
        for path in ["a", "b", "c"] {
            left_files.put_file(path, path);
        }

        let err = orchestrator.run_pass().unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
        assert_eq!(right_files.paths().len(), 1);
        assert_eq!(orchestrator.state(), SessionState::Idle);
        assert_eq!(orchestrator.stats().sessions_cancelled, 1);
        assert!(right.store().peer_knowledge().unwrap().is_empty());

        let report = orchestrator.run_pass().unwrap();
        assert_eq!(report.applied_to_remote.len(), 2);
        assert_eq!(right_files.paths(), vec!["a", "b", "c"]);
    }

    #[test]
    fn cancel_before_a_session_is_not_lost() {
        let (left_files, left) = replica("left");
        let (right_files, right) = replica("right");
        let orchestrator = SyncOrchestrator::builder(left, right).build().unwrap();
        left_files.put_file("a", "a");

        orchestrator.cancel();
        let err = orchestrator.run_pass().unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
        assert!(right_files.paths().is_empty());

        orchestrator.run_pass().unwrap();
        assert_eq!(right_files.paths(), vec!["a"]);
    }

    #[test]
    fn concurrent_sync_is_busy() {
        let (_, left) = replica("left");
        let (_, right) = replica("right");
        let orchestrator = SyncOrchestrator::builder(left, right).build().unwrap();
        let _running = orchestrator.session.lock();
        assert!(matches!(orchestrator.sync(), Err(SyncError::SessionBusy)));
    }
}
