use futures::{stream, Stream};
use hashbrown::HashSet;
use tracing::{debug, warn};

use super::{
    error::FetchError,
    fetch::Fetcher,
    hex::HexDisplayExt,
    record::{Record, RecordId, ORIGIN},
};

/// One item of a walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkStep {
    Record(Record),
    /// Always the last item.
    Ended(WalkEnd),
}

/// Why a walk stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkEnd {
    /// The origin sentinel or the genesis account was reached.
    Origin,
    /// The next id did not resolve to a live record: a dangling pointer or a
    /// record deleted while the walk was running. Older records may exist
    /// past it.
    Missing(RecordId),
    /// The chain led back to an id already yielded.
    Cycle(RecordId),
    /// Fetching the next id failed for good.
    Failed(RecordId, FetchError),
}

impl WalkEnd {
    /// True when the walk stopped before reaching the real end of the list.
    pub fn is_truncated(&self) -> bool {
        matches!(self, WalkEnd::Cycle(_) | WalkEnd::Failed(..))
    }
}

struct WalkState {
    fetcher: Fetcher,
    next: Option<RecordId>,
    seen: HashSet<RecordId>,
}

/// Walks the list from `head` towards the origin, newest first.
///
/// The stream fetches lazily, one record per poll, and always finishes with
/// a single `WalkStep::Ended`. It cannot be restarted: walk again for a
/// fresh bootstrap.
pub fn walk(fetcher: Fetcher, head: RecordId) -> impl Stream<Item = WalkStep> {
    debug!("walking from {}", head.hex().abbrev());
    let state = WalkState {
        fetcher,
        next: Some(head),
        seen: HashSet::new(),
    };
    stream::unfold(state, |mut state| async move {
        let Some(id) = state.next.take() else {
            return None;
        };
        if id == ORIGIN {
            return Some((WalkStep::Ended(WalkEnd::Origin), state));
        }
        if !state.seen.insert(id) {
            warn!("walk revisited {}, stopping", id.hex().abbrev());
            return Some((WalkStep::Ended(WalkEnd::Cycle(id)), state));
        }
        let step = match state.fetcher.fetch_with_retry(id).await {
            Ok(record) => {
                state.next = Some(record.previous_id);
                WalkStep::Record(record)
            }
            Err(FetchError::Genesis(_)) => WalkStep::Ended(WalkEnd::Origin),
            Err(FetchError::NotFound(_)) => {
                debug!("walk ended at missing {}", id.hex().abbrev());
                WalkStep::Ended(WalkEnd::Missing(id))
            }
            Err(e) => {
                warn!("walk aborted at {}: {}", id.hex().abbrev(), e);
                WalkStep::Ended(WalkEnd::Failed(id, e))
            }
        };
        Some((step, state))
    })
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use std::{sync::Arc, time::Duration};

    use futures::StreamExt;

    use super::*;
    use crate::sync::{config::RetryPolicy, memory::MemoryStore};

    fn fetcher(store: &Arc<MemoryStore>) -> Fetcher {
        Fetcher::new(store.clone(), Duration::from_secs(1), RetryPolicy::once())
    }

    async fn collect(fetcher: Fetcher, head: RecordId) -> (Vec<String>, WalkEnd) {
        let steps: Vec<WalkStep> = walk(fetcher, head).collect().await;
        let mut titles = Vec::new();
        let mut end = None;
        for step in steps {
            match step {
                WalkStep::Record(r) => titles.push(r.title),
                WalkStep::Ended(e) => end = Some(e),
            }
        }
        (titles, end.unwrap())
    }

    #[tokio::test]
    async fn walks_newest_first() {
        let store = Arc::new(MemoryStore::new());
        store.create("a", "").await;
        store.create("b", "").await;
        let head = store.create("c", "").await;
        let (titles, end) = collect(fetcher(&store), head).await;
        assert_eq!(titles, ["c", "b", "a"]);
        assert_eq!(end, WalkEnd::Origin);
        assert!(!end.is_truncated());
    }

    #[tokio::test]
    async fn empty_list_yields_nothing() {
        let store = Arc::new(MemoryStore::new());
        let (titles, end) = collect(fetcher(&store), ORIGIN).await;
        assert!(titles.is_empty());
        assert_eq!(end, WalkEnd::Origin);

        let (titles, end) = collect(fetcher(&store), store.head().await).await;
        assert!(titles.is_empty());
        assert_eq!(end, WalkEnd::Origin);
    }

    #[tokio::test]
    async fn deleted_record_ends_as_missing() {
        let store = Arc::new(MemoryStore::new());
        store.create("a", "").await;
        let b = store.create("b", "").await;
        store.delete(b).await.unwrap();
        let (titles, end) = collect(fetcher(&store), b).await;
        assert!(titles.is_empty());
        assert_eq!(end, WalkEnd::Missing(b));
    }

    #[tokio::test]
    async fn transient_failure_truncates() {
        let store = Arc::new(MemoryStore::new());
        store.create("a", "").await;
        let b = store.create("b", "").await;
        let head = store.create("c", "").await;
        store.fail_fetches_of(b, 1).await;
        let (titles, end) = collect(fetcher(&store), head).await;
        assert_eq!(titles, ["c"]);
        assert!(matches!(end, WalkEnd::Failed(id, _) if id == b));
        assert!(end.is_truncated());
    }

    #[tokio::test]
    async fn stops_on_cycles() {
        let store = Arc::new(MemoryStore::new());
        let a = store.create("a", "").await;
        let b = store.create("b", "").await;
        // a -> b -> a
        store.relink(a, b).await;
        let (titles, end) = collect(fetcher(&store), b).await;
        assert_eq!(titles, ["b", "a"]);
        assert_eq!(end, WalkEnd::Cycle(b));
    }

    #[tokio::test]
    async fn stream_finishes_after_end() {
        let store = Arc::new(MemoryStore::new());
        let mut steps = Box::pin(walk(fetcher(&store), ORIGIN));
        assert_eq!(steps.next().await, Some(WalkStep::Ended(WalkEnd::Origin)));
        assert_eq!(steps.next().await, None);
    }
}
