// Every synced list gets one engine task. That task exclusively owns the
// reconciler and with it the ordered view, the pending delete patches and the
// buffer of events held back during a walk. Nothing else ever touches that
// state, so there are no locks around it.
//
// Fetching is the only slow part, and it is pushed out of the state machine:
// fetches for live events run concurrently, but their results come back
// through an ordered queue so they are applied in the order the events
// arrived. Readers never wait on the task either. Each commit publishes an
// immutable snapshot through a watch channel and then runs the registered
// callbacks.

pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod fetch;
pub mod hex;
#[cfg(feature = "memory")]
pub mod memory;
pub mod publisher;
pub mod reconciler;
pub mod record;
pub mod store;
pub mod walker;

pub use config::{RetryPolicy, SyncConfig};
pub use engine::{start_sync, SyncEngine, SyncHandle};
pub use feed::{FeedEvent, FeedHealth};
pub use publisher::Snapshot;
pub use reconciler::Phase;
pub use store::{RemoteStore, SharedStore, Subscription};
