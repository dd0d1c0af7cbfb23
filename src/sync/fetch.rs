use std::time::Duration;

use tracing::{debug, trace};

use super::{
    config::{RetryPolicy, SyncConfig},
    error::FetchError,
    hex::HexDisplayExt,
    record::{Record, RecordId, ORIGIN},
    store::SharedStore,
};

/// Turns record ids into validated records. Stateless apart from its
/// settings, so clones can fetch concurrently.
#[derive(Clone)]
pub struct Fetcher {
    store: SharedStore,
    timeout: Duration,
    retry: RetryPolicy,
}

impl Fetcher {
    pub fn new(store: SharedStore, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            store,
            timeout,
            retry,
        }
    }

    pub fn from_config(store: SharedStore, config: &SyncConfig) -> Self {
        Self::new(store, config.fetch_timeout, config.retry.clone())
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// A single bounded attempt.
    pub async fn fetch(&self, id: RecordId) -> Result<Record, FetchError> {
        if id == ORIGIN {
            return Err(FetchError::NotFound(id));
        }
        let bytes =
            match tokio::time::timeout(self.timeout, self.store.fetch_account(&id))
                .await
            {
                Ok(result) => result?,
                Err(_) => Err(FetchError::Timeout(self.timeout))?,
            };
        match bytes {
            Some(bytes) => Record::decode(id, &bytes),
            None => Err(FetchError::NotFound(id)),
        }
    }

    /// Retries transient failures according to the retry policy. Missing
    /// records and malformed data are returned straight away.
    pub async fn fetch_with_retry(
        &self,
        id: RecordId,
    ) -> Result<Record, FetchError> {
        let mut attempt = 1;
        loop {
            match self.fetch(id).await {
                Err(e) if e.is_transient() && self.retry.allows(attempt) => {
                    attempt += 1;
                    let delay = self.retry.backoff(attempt);
                    debug!(
                        "fetch of {} failed ({}), attempt {} in {:?}",
                        id.hex().abbrev(),
                        e,
                        attempt,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                other => {
                    trace!("fetched {} after {} attempt(s)", id.hex().abbrev(), attempt);
                    return other;
                }
            }
        }
    }
}
