use basesync_core::{CollapsedEntry, StatusEvent, StatusKind, StatusLog};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Status(StatusEvent),
    /// Running total of records fetched in the current cycle.
    Progress(usize),
}

/// Owns the status log. [`StatusFeed::transition`] is the only way to change
/// status; every transition is appended and broadcast under one lock so
/// subscribers observe events in uid order.
#[derive(Debug, Default)]
pub struct StatusFeed {
    inner: Mutex<FeedInner>,
}

#[derive(Debug, Default)]
struct FeedInner {
    log: StatusLog,
    subscribers: Vec<mpsc::UnboundedSender<SyncEvent>>,
}

impl FeedInner {
    fn broadcast(&mut self, event: SyncEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl StatusFeed {
    pub fn new(log: StatusLog) -> Self {
        Self {
            inner: Mutex::new(FeedInner {
                log,
                subscribers: Vec::new(),
            }),
        }
    }

    pub fn transition(&self, status: StatusKind) -> StatusEvent {
        let mut inner = self.inner.lock();
        let event = inner.log.record(status);
        inner.broadcast(SyncEvent::Status(event.clone()));
        event
    }

    pub fn progress(&self, count: usize) {
        self.inner.lock().broadcast(SyncEvent::Progress(count));
    }

    /// Receives every event appended after this call. Dropping the receiver
    /// unsubscribes.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SyncEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().subscribers.push(tx);
        rx
    }

    pub fn current(&self) -> Option<StatusEvent> {
        self.inner.lock().log.current().cloned()
    }

    /// Raw log, newest first.
    pub fn log(&self) -> Vec<StatusEvent> {
        self.inner.lock().log.to_vec()
    }

    pub fn collapsed(&self) -> Vec<CollapsedEntry> {
        self.inner.lock().log.collapsed()
    }
}
