//! Configuration for sync sessions.

use crate::recycle::RecycleReason;
use duosync_protocol::ConflictPolicy;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Which way changes may flow in a session.
///
/// "Upload" moves changes from the local replica to the remote one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncDirection {
    /// Local changes are applied to the remote replica only.
    UploadOnly,
    /// Remote changes are applied to the local replica only.
    DownloadOnly,
    /// Changes flow both ways.
    #[default]
    Bidirectional,
}

impl SyncDirection {
    /// Returns true if changes may be applied to the local replica.
    pub fn applies_to_local(&self) -> bool {
        matches!(self, SyncDirection::DownloadOnly | SyncDirection::Bidirectional)
    }

    /// Returns true if changes may be applied to the remote replica.
    pub fn applies_to_remote(&self) -> bool {
        matches!(self, SyncDirection::UploadOnly | SyncDirection::Bidirectional)
    }

    /// Name used in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::UploadOnly => "upload",
            SyncDirection::DownloadOnly => "download",
            SyncDirection::Bidirectional => "both",
        }
    }
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "upload" | "upload-only" => Ok(SyncDirection::UploadOnly),
            "download" | "download-only" => Ok(SyncDirection::DownloadOnly),
            "both" | "bidirectional" => Ok(SyncDirection::Bidirectional),
            other => Err(format!("unknown sync direction: {other}")),
        }
    }
}

/// Independently toggleable session options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Detection runs only when the caller asks for it.
    pub explicit_detect_changes: bool,
    /// Recycle files removed by a propagated delete.
    pub recycle_deleted_files: bool,
    /// Recycle the previous content of files overwritten by an update.
    pub recycle_previous_file_on_updates: bool,
    /// Recycle the content that lost a conflict.
    pub recycle_conflict_loser_files: bool,
}

impl SyncOptions {
    /// Every option enabled.
    pub fn all() -> Self {
        Self {
            explicit_detect_changes: true,
            recycle_deleted_files: true,
            recycle_previous_file_on_updates: true,
            recycle_conflict_loser_files: true,
        }
    }

    /// Every option disabled.
    pub fn none() -> Self {
        Self {
            explicit_detect_changes: false,
            recycle_deleted_files: false,
            recycle_previous_file_on_updates: false,
            recycle_conflict_loser_files: false,
        }
    }

    /// Sets whether detection must be invoked explicitly.
    pub fn with_explicit_detect_changes(mut self, enabled: bool) -> Self {
        self.explicit_detect_changes = enabled;
        self
    }

    /// Sets whether deleted files are recycled.
    pub fn with_recycle_deleted_files(mut self, enabled: bool) -> Self {
        self.recycle_deleted_files = enabled;
        self
    }

    /// Sets whether overwritten content is recycled on updates.
    pub fn with_recycle_previous_file_on_updates(mut self, enabled: bool) -> Self {
        self.recycle_previous_file_on_updates = enabled;
        self
    }

    /// Sets whether conflict losers are recycled.
    pub fn with_recycle_conflict_loser_files(mut self, enabled: bool) -> Self {
        self.recycle_conflict_loser_files = enabled;
        self
    }

    /// Returns true if content displaced for `reason` must be recycled.
    pub fn recycles(&self, reason: RecycleReason) -> bool {
        match reason {
            RecycleReason::Deleted => self.recycle_deleted_files,
            RecycleReason::PreviousOnUpdate => self.recycle_previous_file_on_updates,
            RecycleReason::ConflictLoser => self.recycle_conflict_loser_files,
        }
    }

    /// Returns true if any recycle option is enabled.
    pub fn recycles_anything(&self) -> bool {
        self.recycle_deleted_files
            || self.recycle_previous_file_on_updates
            || self.recycle_conflict_loser_files
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::all()
    }
}

/// Configuration for a [`SyncOrchestrator`](crate::SyncOrchestrator).
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Which way changes flow.
    pub direction: SyncDirection,
    /// Session options.
    pub options: SyncOptions,
    /// Conflict policy used when no custom resolver is installed.
    pub policy: ConflictPolicy,
    /// Pause between passes of the polling scheduler.
    pub poll_interval: Duration,
}

impl SyncConfig {
    /// Creates a bidirectional configuration with every option enabled.
    pub fn new() -> Self {
        Self {
            direction: SyncDirection::Bidirectional,
            options: SyncOptions::all(),
            policy: ConflictPolicy::NewestWins,
            poll_interval: Duration::from_millis(25),
        }
    }

    /// Sets the direction.
    pub fn with_direction(mut self, direction: SyncDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Sets the options.
    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the conflict policy.
    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the polling interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}
