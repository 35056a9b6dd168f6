//! Error types for the sync engine.

use duosync_protocol::ReplicaId;
use duosync_storage::StoreError;
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that end a detection pass or a session.
///
/// Failures of a single item are not `SyncError`s: they become
/// [`ItemFailure`]s and are reported as skipped changes.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The metadata store failed; the session cannot continue.
    #[error("metadata store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// Enumerating a replica failed.
    #[error("scan of replica {replica} failed: {source}")]
    Scan {
        /// Replica being scanned.
        replica: ReplicaId,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The engine was wired up incorrectly.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A session is already running.
    #[error("a sync session is already active")]
    SessionBusy,

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

impl SyncError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Returns true if the error leaves the session in `Failed`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::StoreUnavailable(_) | SyncError::Scan { .. } | SyncError::Configuration(_)
        )
    }
}

/// Why a change was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// An I/O operation failed.
    IoError,
    /// The operating system denied access.
    AccessDenied,
    /// A conflict the policy declined to resolve, or a path collision.
    UnresolvableConflict,
    /// The path is excluded by the scope filter.
    FilteredOut,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SkipReason::IoError => "I/O error",
            SkipReason::AccessDenied => "access denied",
            SkipReason::UnresolvableConflict => "unresolvable conflict",
            SkipReason::FilteredOut => "filtered out",
        };
        f.write_str(text)
    }
}

/// A per-item failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    /// Classification.
    pub reason: SkipReason,
    /// Underlying cause, if any.
    pub cause: Option<String>,
}

impl ItemFailure {
    /// Creates a failure with a reason and a cause.
    pub fn new(reason: SkipReason, cause: impl Into<String>) -> Self {
        Self {
            reason,
            cause: Some(cause.into()),
        }
    }

    /// An unresolvable conflict.
    pub fn conflict(cause: impl Into<String>) -> Self {
        Self::new(SkipReason::UnresolvableConflict, cause)
    }

    /// A path excluded by the scope filter.
    pub fn filtered_out() -> Self {
        Self {
            reason: SkipReason::FilteredOut,
            cause: None,
        }
    }

    /// An I/O failure that did not come from an `io::Error`.
    pub fn io(cause: impl Into<String>) -> Self {
        Self::new(SkipReason::IoError, cause)
    }
}

impl From<&io::Error> for ItemFailure {
    fn from(error: &io::Error) -> Self {
        let reason = match error.kind() {
            io::ErrorKind::PermissionDenied => SkipReason::AccessDenied,
            _ => SkipReason::IoError,
        };
        Self::new(reason, error.to_string())
    }
}

impl fmt::Display for ItemFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}: {}", self.reason, cause),
            None => write!(f, "{}", self.reason),
        }
    }
}

/// Outcome of a failed apply: skip the item or abort the session.
#[derive(Debug)]
pub(crate) enum ApplyError {
    Skip(ItemFailure),
    Fatal(SyncError),
}

impl From<io::Error> for ApplyError {
    fn from(error: io::Error) -> Self {
        ApplyError::Skip(ItemFailure::from(&error))
    }
}

impl From<ItemFailure> for ApplyError {
    fn from(failure: ItemFailure) -> Self {
        ApplyError::Skip(failure)
    }
}

impl From<StoreError> for ApplyError {
    fn from(error: StoreError) -> Self {
        ApplyError::Fatal(SyncError::StoreUnavailable(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_denied_maps_to_access_denied() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(ItemFailure::from(&err).reason, SkipReason::AccessDenied);

        let err = io::Error::new(io::ErrorKind::Other, "disk full");
        let failure = ItemFailure::from(&err);
        assert_eq!(failure.reason, SkipReason::IoError);
        assert_eq!(failure.cause.as_deref(), Some("disk full"));
    }

    #[test]
    fn fatal_errors() {
        assert!(SyncError::StoreUnavailable(StoreError::Closed).is_fatal());
        assert!(SyncError::configuration("same replica twice").is_fatal());
        assert!(!SyncError::Cancelled.is_fatal());
        assert!(!SyncError::SessionBusy.is_fatal());
    }

    #[test]
    fn error_display() {
        let err = SyncError::SessionBusy;
        assert_eq!(err.to_string(), "a sync session is already active");

        let failure = ItemFailure::conflict("divergent renames");
        assert_eq!(failure.to_string(), "unresolvable conflict: divergent renames");
        assert_eq!(ItemFailure::filtered_out().to_string(), "filtered out");
    }

    #[test]
    fn apply_error_conversions() {
        let skip: ApplyError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(skip, ApplyError::Skip(ItemFailure { reason: SkipReason::IoError, .. })));

        let fatal: ApplyError = StoreError::Closed.into();
        assert!(matches!(fatal, ApplyError::Fatal(SyncError::StoreUnavailable(_))));
    }
}
