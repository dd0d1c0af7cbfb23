pub mod sync;

#[cfg(feature = "memory")]
pub use sync::memory::MemoryStore;
pub use sync::{
    error::{FeedError, FetchError, MalformedRecord, StoreError},
    hex::{parse_hex, HexDisplayExt},
    record::{AuthorId, Record, RecordId, ORIGIN},
    start_sync, FeedEvent, FeedHealth, Phase, RemoteStore, RetryPolicy,
    SharedStore, Snapshot, Subscription, SyncConfig, SyncEngine, SyncHandle,
};
