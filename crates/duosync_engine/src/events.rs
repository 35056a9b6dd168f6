//! Applied and skipped change notifications.
//!
//! The applier publishes to an [`EventBus`]; callers attach any number of
//! [`SyncListener`]s or channel subscribers.
//!
//! # Usage
//!
//! ```rust,ignore
//! let events = orchestrator.events().subscribe();
//! std::thread::spawn(move || {
//!     while let Ok(event) = events.recv() {
//!         println!("{event}");
//!     }
//! });
//! orchestrator.sync()?;
//! ```

use crate::error::SkipReason;
use duosync_protocol::{ChangeKind, ReplicaId};
use parking_lot::RwLock;
use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

/// A change applied to a replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedChange {
    /// Replica the change was applied to.
    pub replica: ReplicaId,
    /// Kind of change.
    pub kind: ChangeKind,
    /// Path before the change.
    pub old_path: Option<String>,
    /// Path after the change.
    pub new_path: Option<String>,
}

impl AppliedChange {
    /// The path the change ended at, or the removed path.
    pub fn path(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or_default()
    }
}

impl fmt::Display for AppliedChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self.kind.as_str().to_ascii_uppercase();
        match (self.kind, &self.old_path, &self.new_path) {
            (ChangeKind::Rename, Some(old), Some(new)) => {
                write!(f, "-- Applied {kind} for file {old} as {new}")
            }
            _ => write!(f, "-- Applied {kind} for file {}", self.path()),
        }
    }
}

/// A change that was not applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedChange {
    /// Replica the change was meant for.
    pub replica: ReplicaId,
    /// Kind of change.
    pub kind: ChangeKind,
    /// Path of the item.
    pub path: String,
    /// Classification.
    pub reason: SkipReason,
    /// Underlying error, if any.
    pub cause: Option<String>,
}

impl fmt::Display for SkippedChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self.kind.as_str().to_ascii_uppercase();
        write!(f, "-- Skipped applying {kind} for {} due to error", self.path)?;
        match &self.cause {
            Some(cause) => write!(f, "\n   [{}: {cause}]", self.reason),
            None => write!(f, "\n   [{}]", self.reason),
        }
    }
}

/// A session event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A change was applied.
    Applied(AppliedChange),
    /// A change was skipped.
    Skipped(SkippedChange),
}

impl fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncEvent::Applied(change) => fmt::Display::fmt(change, f),
            SyncEvent::Skipped(change) => fmt::Display::fmt(change, f),
        }
    }
}

/// Receives session events.
pub trait SyncListener: Send + Sync {
    /// Called after a change was applied.
    fn on_applied(&self, _change: &AppliedChange) {}

    /// Called after a change was skipped.
    fn on_skipped(&self, _change: &SkippedChange) {}
}

/// Distributes events to listeners and channel subscribers.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn SyncListener>>>,
    subscribers: RwLock<Vec<Sender<SyncEvent>>>,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a listener.
    pub fn add_listener(&self, listener: Arc<dyn SyncListener>) {
        self.listeners.write().push(listener);
    }

    /// Subscribes to all future events.
    ///
    /// The receiver should be drained regularly; dropped receivers are
    /// removed on the next emit.
    pub fn subscribe(&self) -> Receiver<SyncEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Publishes an event.
    pub fn emit(&self, event: SyncEvent) {
        for listener in self.listeners.read().iter() {
            match &event {
                SyncEvent::Applied(change) => listener.on_applied(change),
                SyncEvent::Skipped(change) => listener.on_skipped(change),
            }
        }
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of attached listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Number of live channel subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Counter {
        applied: Mutex<Vec<AppliedChange>>,
        skipped: Mutex<usize>,
    }

    impl SyncListener for Counter {
        fn on_applied(&self, change: &AppliedChange) {
            self.applied.lock().push(change.clone());
        }

        fn on_skipped(&self, _change: &SkippedChange) {
            *self.skipped.lock() += 1;
        }
    }

    fn create(path: &str) -> AppliedChange {
        AppliedChange {
            replica: ReplicaId::from_bytes([3; 16]),
            kind: ChangeKind::Create,
            old_path: None,
            new_path: Some(path.to_string()),
        }
    }

    #[test]
    fn listeners_and_subscribers_receive_events() {
        let bus = EventBus::new();
        let counter = Arc::new(Counter::default());
        bus.add_listener(counter.clone());
        let rx = bus.subscribe();

        bus.emit(SyncEvent::Applied(create("a.txt")));
        bus.emit(SyncEvent::Skipped(SkippedChange {
            replica: ReplicaId::from_bytes([3; 16]),
            kind: ChangeKind::Update,
            path: "b.txt".into(),
            reason: SkipReason::IoError,
            cause: None,
        }));

        assert_eq!(counter.applied.lock().len(), 1);
        assert_eq!(*counter.skipped.lock(), 1);
        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn dropped_subscribers_are_removed() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);
        bus.emit(SyncEvent::Applied(create("a")));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn console_format() {
        assert_eq!(create("notes.txt").to_string(), "-- Applied CREATE for file notes.txt");

        let rename = AppliedChange {
            kind: ChangeKind::Rename,
            old_path: Some("a.txt".into()),
            new_path: Some("b.txt".into()),
            ..create("")
        };
        assert_eq!(rename.to_string(), "-- Applied RENAME for file a.txt as b.txt");

        let skipped = SkippedChange {
            replica: ReplicaId::from_bytes([3; 16]),
            kind: ChangeKind::Delete,
            path: "c.txt".into(),
            reason: SkipReason::AccessDenied,
            cause: Some("denied".into()),
        };
        assert_eq!(
            skipped.to_string(),
            "-- Skipped applying DELETE for c.txt due to error\n   [access denied: denied]"
        );
    }
}
