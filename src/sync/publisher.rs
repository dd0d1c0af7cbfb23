use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::trace;

use super::{
    feed::FeedHealth,
    reconciler::{verify_order, Phase},
    record::Record,
};

/// An immutable view of the list at one commit, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub records: Vec<Record>,
    pub phase: Phase,
    /// The last walk stopped before reaching the end of the list, so older
    /// records may be missing.
    pub partial: bool,
    pub feed: FeedHealth,
    /// Increases by one with every commit.
    pub version: u64,
    pub committed_at: DateTime<Utc>,
}

impl Snapshot {
    pub(crate) fn initial() -> Self {
        Self {
            records: Vec::new(),
            phase: Phase::Bootstrapping,
            partial: false,
            feed: FeedHealth::Connected,
            version: 0,
            committed_at: Utc::now(),
        }
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_live(&self) -> bool {
        self.phase == Phase::Live
    }

    /// Every record's predecessor is either absent or directly after it.
    pub fn is_consistent(&self) -> bool {
        verify_order(&self.records).is_ok()
    }
}

pub type ChangeCallback = Box<dyn FnMut(&Snapshot) + Send>;

/// Write side of the view. Owned by the engine task: every commit replaces
/// the current snapshot and then runs the registered callbacks in order.
pub(crate) struct ViewPublisher {
    tx: watch::Sender<Arc<Snapshot>>,
    callbacks: Vec<ChangeCallback>,
    version: u64,
}

impl ViewPublisher {
    pub fn new() -> (Self, ViewReader) {
        let (tx, rx) = watch::channel(Arc::new(Snapshot::initial()));
        (
            Self {
                tx,
                callbacks: Vec::new(),
                version: 0,
            },
            ViewReader { rx },
        )
    }

    pub fn register(&mut self, callback: ChangeCallback) {
        self.callbacks.push(callback);
    }

    pub fn publish(
        &mut self,
        records: Vec<Record>,
        phase: Phase,
        partial: bool,
        feed: FeedHealth,
    ) {
        self.version += 1;
        let snapshot = Arc::new(Snapshot {
            records,
            phase,
            partial,
            feed,
            version: self.version,
            committed_at: Utc::now(),
        });
        trace!(
            version = snapshot.version,
            records = snapshot.records.len(),
            "publishing view"
        );
        self.tx.send_replace(snapshot.clone());
        for callback in self.callbacks.iter_mut() {
            callback(&snapshot);
        }
    }

    /// Drops every callback. Nothing is invoked after this.
    pub fn close(&mut self) {
        self.callbacks.clear();
    }
}

/// Read side of the view. Cheap to clone; reading never waits on the engine.
#[derive(Clone)]
pub struct ViewReader {
    rx: watch::Receiver<Arc<Snapshot>>,
}

impl ViewReader {
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.rx.borrow().clone()
    }

    /// A receiver that is notified on every commit.
    pub fn changes(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.rx.clone()
    }
}
