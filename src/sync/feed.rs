use std::time::Duration;

use rkyv::{AlignedVec, Archive, Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::{
    error::{FeedError, StoreError},
    hex::HexDisplayExt,
    record::RecordId,
    store::{SharedStore, Subscription},
};

pub const CREATE: &str = "CREATE";
pub const UPDATE: &str = "UPDATE";
pub const DELETE: &str = "DELETE";

/// A change to the remote list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedEvent {
    /// A record was appended as the new head.
    Created(RecordId),
    /// A record's content changed in place.
    Updated(RecordId),
    /// `id` was removed; whatever pointed at it now points at `repoint_to`
    /// (possibly the origin sentinel).
    Deleted { id: RecordId, repoint_to: RecordId },
}

impl FeedEvent {
    pub fn id(&self) -> RecordId {
        match self {
            FeedEvent::Created(id) | FeedEvent::Updated(id) => *id,
            FeedEvent::Deleted { id, .. } => *id,
        }
    }
}

/// The event as the remote store emits it.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct RawEvent {
    pub label: String,
    pub record: RecordId,
    pub repoint_to: Option<RecordId>,
}

impl RawEvent {
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        rkyv::to_bytes::<_, 128>(self)
            .map(|bytes| bytes.into_vec())
            .map_err(|e| StoreError::Rpc(format!("encoding event: {e:?}")))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FeedError> {
        let mut aligned = AlignedVec::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<RawEvent>(&aligned)
            .map_err(|_| FeedError::UndecodableEvent)
    }
}

impl From<FeedEvent> for RawEvent {
    fn from(event: FeedEvent) -> Self {
        match event {
            FeedEvent::Created(id) => RawEvent {
                label: CREATE.into(),
                record: id,
                repoint_to: None,
            },
            FeedEvent::Updated(id) => RawEvent {
                label: UPDATE.into(),
                record: id,
                repoint_to: None,
            },
            FeedEvent::Deleted { id, repoint_to } => RawEvent {
                label: DELETE.into(),
                record: id,
                repoint_to: Some(repoint_to),
            },
        }
    }
}

impl TryFrom<RawEvent> for FeedEvent {
    type Error = FeedError;

    fn try_from(raw: RawEvent) -> Result<Self, Self::Error> {
        match raw.label.as_str() {
            CREATE => Ok(FeedEvent::Created(raw.record)),
            UPDATE => Ok(FeedEvent::Updated(raw.record)),
            DELETE => match raw.repoint_to {
                Some(repoint_to) => Ok(FeedEvent::Deleted {
                    id: raw.record,
                    repoint_to,
                }),
                None => Err(FeedError::MissingRepointTarget(raw.record)),
            },
            _ => Err(FeedError::UnknownLabel(raw.label)),
        }
    }
}

/// Decodes one raw payload into an event.
pub fn decode_event(bytes: &[u8]) -> Result<FeedEvent, FeedError> {
    FeedEvent::try_from(RawEvent::decode(bytes)?)
}

/// State of the change subscription, as shown to readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedHealth {
    Connected,
    /// The feed dropped and automatic resubscription is under way.
    Reconnecting { attempt: u32 },
    /// Automatic resubscription gave up. Call `SyncHandle::resubscribe`.
    Lost,
}

/// Adapter over the store's subscription: owns the connection and turns raw
/// payloads into `FeedEvent`s, dropping anything malformed.
pub struct EventFeed {
    store: SharedStore,
    subscription: Option<Subscription>,
    timeout: Duration,
}

impl EventFeed {
    pub fn new(store: SharedStore, timeout: Duration) -> Self {
        Self {
            store,
            subscription: None,
            timeout,
        }
    }

    /// Opens a fresh subscription, replacing any existing one.
    pub async fn connect(&mut self) -> Result<(), FeedError> {
        self.disconnect();
        let subscription =
            match tokio::time::timeout(self.timeout, self.store.subscribe()).await {
                Ok(result) => result?,
                Err(_) => Err(StoreError::Rpc(format!(
                    "subscribe timed out after {:?}",
                    self.timeout
                )))?,
            };
        debug!("event feed connected");
        self.subscription = Some(subscription);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.subscription.is_some()
    }

    /// Unsubscribes. No further events are delivered afterwards.
    pub fn disconnect(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
            debug!("event feed disconnected");
        }
    }

    /// Waits for the next well-formed event. Returns
    /// `FeedError::SubscriptionLost` once the subscription has ended; the
    /// feed is disconnected at that point.
    ///
    /// Cancel safe: an event is only consumed when it is returned or
    /// dropped as malformed.
    pub async fn next(&mut self) -> Result<FeedEvent, FeedError> {
        loop {
            let Some(subscription) = self.subscription.as_mut() else {
                return Err(FeedError::SubscriptionLost);
            };
            let Some(bytes) = subscription.recv().await else {
                warn!("event feed closed by remote");
                self.subscription = None;
                return Err(FeedError::SubscriptionLost);
            };
            match decode_event(&bytes) {
                Ok(event) => {
                    trace!("event {:?} for {}", event, event.id().hex().abbrev());
                    return Ok(event);
                }
                Err(e) => warn!("dropping malformed event: {}", e),
            }
        }
    }
}
