use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{error::StoreError, record::RecordId};

pub type SharedStore = Arc<dyn RemoteStore>;

/// The remote record store as the sync core sees it. Implementations wrap
/// whatever RPC client talks to the ledger; the core only reads.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Returns the raw account data for `id`, or `None` when no account
    /// exists at that address.
    async fn fetch_account(
        &self,
        id: &RecordId,
    ) -> Result<Option<Vec<u8>>, StoreError>;

    /// The most recently created record, or `ORIGIN` when the list is empty.
    async fn head_id(&self) -> Result<RecordId, StoreError>;

    /// Opens a change notification stream.
    async fn subscribe(&self) -> Result<Subscription, StoreError>;
}

/// A live change notification stream carrying raw event payloads.
///
/// Dropping the subscription unsubscribes and releases the underlying
/// connection. The stream ending on its own means the subscription was lost.
pub struct Subscription {
    events: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Subscription {
    pub fn new(events: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self { events }
    }

    /// The next raw payload, or `None` once the remote side has gone away.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.events.recv().await
    }

    pub fn unsubscribe(mut self) {
        self.events.close();
    }
}
