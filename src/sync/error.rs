use std::time::Duration;

use thiserror::Error;

use super::{hex::HexDisplayExt, record::RecordId};

/// Failures reported by the remote store collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("rpc failure: {0}")]
    Rpc(String),
    #[error("remote store unavailable")]
    Unavailable,
    #[error("record {} does not exist", .0.hex())]
    UnknownRecord(RecordId),
}

/// Why fetched account data was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MalformedRecord {
    #[error("account data could not be decoded")]
    Undecodable,
    #[error("title is {len} bytes, limit is {limit}")]
    TitleTooLong { len: usize, limit: usize },
    #[error("body is {len} bytes, limit is {limit}")]
    BodyTooLong { len: usize, limit: usize },
    #[error("record names itself as its predecessor")]
    SelfReference,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("record {} not found", .0.hex())]
    NotFound(RecordId),
    /// The id names the genesis account that anchors the list. Not a live
    /// record, but not a dangling pointer either.
    #[error("{} is the genesis account", .0.hex())]
    Genesis(RecordId),
    #[error("transient fetch failure: {0}")]
    Transient(StoreError),
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed record {}: {1}", .0.hex())]
    Malformed(RecordId, MalformedRecord),
}

impl FetchError {
    /// Transient failures may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_) | FetchError::Timeout(_))
    }

    /// The id does not denote a live record.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::NotFound(_) | FetchError::Genesis(_))
    }
}

impl From<StoreError> for FetchError {
    fn from(error: StoreError) -> Self {
        FetchError::Transient(error)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("event payload could not be decoded")]
    UndecodableEvent,
    #[error("unknown event label {0:?}")]
    UnknownLabel(String),
    #[error("delete event for {} carries no repoint target", .0.hex())]
    MissingRepointTarget(RecordId),
    #[error("event subscription lost")]
    SubscriptionLost,
    #[error("subscribing failed: {0}")]
    Subscribe(#[from] StoreError),
}
