// An in-process stand-in for the remote ledger. It follows the same rules as
// the on-chain program: a genesis account anchors the list, every new record
// points at the previous head, and deleting a record hands its predecessor to
// whichever record pointed at it. Events go out to every subscriber as raw
// payloads, exactly as a real subscription would deliver them.
//
// The fault knobs exist for tests and the demo binary.

use std::time::Duration;

use async_trait::async_trait;
use hashbrown::{HashMap, HashSet};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace};

use super::{
    error::StoreError,
    feed::{FeedEvent, RawEvent},
    hex::HexDisplayExt,
    record::{AuthorId, Record, RecordAccount, RecordId, ORIGIN},
    store::{RemoteStore, Subscription},
};

pub const DEFAULT_AUTHOR: AuthorId = [1u8; 32];

#[derive(Default)]
struct Faults {
    /// Fail this many upcoming fetches, whatever the id.
    failing_fetches: u32,
    failing_ids: HashMap<RecordId, u32>,
    delays: HashMap<RecordId, Duration>,
    /// Delay this many upcoming fetches, whatever the id.
    delayed_fetches: (u32, Duration),
    failing_subscribes: u32,
    corrupted: HashSet<RecordId>,
}

struct Ledger {
    accounts: HashMap<RecordId, RecordAccount>,
    head: RecordId,
    counter: u64,
    subscribers: Vec<mpsc::UnboundedSender<Vec<u8>>>,
    faults: Faults,
}

impl Ledger {
    fn emit(&mut self, event: FeedEvent) {
        self.emit_bytes(RawEvent::from(event).encode());
    }

    fn emit_bytes(&mut self, bytes: Result<Vec<u8>, StoreError>) {
        let Ok(bytes) = bytes else {
            return;
        };
        self.subscribers.retain(|tx| tx.send(bytes.clone()).is_ok());
    }

    fn next_id(&mut self, salt: &[u8]) -> RecordId {
        self.counter += 1;
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.counter.to_le_bytes());
        hasher.update(salt);
        *hasher.finalize().as_bytes()
    }

    fn live(&self, id: &RecordId) -> Option<&RecordAccount> {
        self.accounts.get(id).filter(|account| account.author != ORIGIN)
    }
}

pub struct MemoryStore {
    ledger: RwLock<Ledger>,
    genesis: RecordId,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// A store holding only the genesis account.
    pub fn new() -> Self {
        let mut ledger = Ledger {
            accounts: HashMap::new(),
            head: ORIGIN,
            counter: 0,
            subscribers: Vec::new(),
            faults: Faults::default(),
        };
        let genesis = ledger.next_id(b"genesis");
        ledger.accounts.insert(
            genesis,
            RecordAccount {
                title: String::new(),
                body: String::new(),
                author: ORIGIN,
                previous: ORIGIN,
                authority: ORIGIN,
            },
        );
        ledger.head = genesis;
        Self {
            ledger: RwLock::new(ledger),
            genesis,
        }
    }

    pub fn genesis_id(&self) -> RecordId {
        self.genesis
    }

    pub async fn head(&self) -> RecordId {
        self.ledger.read().await.head
    }

    pub async fn create(&self, title: &str, body: &str) -> RecordId {
        self.create_as(DEFAULT_AUTHOR, title, body).await
    }

    /// Appends a record as the new head and announces it.
    pub async fn create_as(
        &self,
        author: AuthorId,
        title: &str,
        body: &str,
    ) -> RecordId {
        let mut ledger = self.ledger.write().await;
        let id = ledger.next_id(title.as_bytes());
        let previous = ledger.head;
        ledger.accounts.insert(
            id,
            RecordAccount {
                title: title.into(),
                body: body.into(),
                author,
                previous,
                authority: author,
            },
        );
        ledger.head = id;
        ledger.emit(FeedEvent::Created(id));
        trace!("created {} on top of {}", id.hex().abbrev(), previous.hex().abbrev());
        id
    }

    pub async fn update(
        &self,
        id: RecordId,
        title: &str,
        body: &str,
    ) -> Result<(), StoreError> {
        let mut ledger = self.ledger.write().await;
        if ledger.live(&id).is_none() {
            return Err(StoreError::UnknownRecord(id));
        }
        if let Some(account) = ledger.accounts.get_mut(&id) {
            account.title = title.into();
            account.body = body.into();
        }
        ledger.emit(FeedEvent::Updated(id));
        Ok(())
    }

    /// Splices `id` out of the list and returns the id its successor now
    /// points at.
    pub async fn delete(&self, id: RecordId) -> Result<RecordId, StoreError> {
        let mut ledger = self.ledger.write().await;
        let repoint_to = ledger
            .live(&id)
            .map(|account| account.previous)
            .ok_or(StoreError::UnknownRecord(id))?;
        if let Some(successor) = ledger
            .accounts
            .values_mut()
            .find(|account| account.previous == id)
        {
            successor.previous = repoint_to;
        }
        if ledger.head == id {
            ledger.head = repoint_to;
        }
        ledger.accounts.remove(&id);
        ledger.faults.corrupted.remove(&id);
        ledger.emit(FeedEvent::Deleted { id, repoint_to });
        trace!("deleted {}", id.hex().abbrev());
        Ok(repoint_to)
    }

    /// The authoritative list, newest first.
    pub async fn true_order(&self) -> Vec<Record> {
        let ledger = self.ledger.read().await;
        let mut records = Vec::new();
        let mut next = ledger.head;
        while let Some(account) = ledger.live(&next) {
            if records.len() > ledger.accounts.len() {
                break;
            }
            records.push(Record {
                id: next,
                title: account.title.clone(),
                body: account.body.clone(),
                author_id: account.author,
                previous_id: account.previous,
            });
            next = account.previous;
        }
        records
    }

    /// Ids of live records, in no particular order.
    pub async fn live_ids(&self) -> Vec<RecordId> {
        let ledger = self.ledger.read().await;
        ledger
            .accounts
            .iter()
            .filter(|(_, account)| account.author != ORIGIN)
            .map(|(id, _)| *id)
            .collect()
    }

    pub async fn fail_next_fetches(&self, count: u32) {
        self.ledger.write().await.faults.failing_fetches = count;
    }

    pub async fn fail_fetches_of(&self, id: RecordId, count: u32) {
        self.ledger.write().await.faults.failing_ids.insert(id, count);
    }

    pub async fn delay_fetches_of(&self, id: RecordId, delay: Duration) {
        self.ledger.write().await.faults.delays.insert(id, delay);
    }

    pub async fn delay_next_fetches(&self, count: u32, delay: Duration) {
        self.ledger.write().await.faults.delayed_fetches = (count, delay);
    }

    pub async fn fail_next_subscribes(&self, count: u32) {
        self.ledger.write().await.faults.failing_subscribes = count;
    }

    /// Makes the account's data undecodable.
    pub async fn corrupt(&self, id: RecordId) {
        self.ledger.write().await.faults.corrupted.insert(id);
    }

    /// Points `id` at `previous` without emitting anything.
    pub async fn relink(&self, id: RecordId, previous: RecordId) {
        if let Some(account) = self.ledger.write().await.accounts.get_mut(&id) {
            account.previous = previous;
        }
    }

    /// Sends an arbitrary payload to every subscriber.
    pub async fn emit_raw(&self, bytes: Vec<u8>) {
        self.ledger.write().await.emit_bytes(Ok(bytes));
    }

    /// Drops every subscription from the remote side.
    pub async fn disconnect_subscribers(&self) {
        let mut ledger = self.ledger.write().await;
        debug!("dropping {} subscriber(s)", ledger.subscribers.len());
        ledger.subscribers.clear();
    }

    pub async fn subscriber_count(&self) -> usize {
        let mut ledger = self.ledger.write().await;
        ledger.subscribers.retain(|tx| !tx.is_closed());
        ledger.subscribers.len()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn fetch_account(
        &self,
        id: &RecordId,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let (result, delay) = {
            let mut ledger = self.ledger.write().await;
            let faults = &mut ledger.faults;
            let delay = match faults.delays.get(id) {
                Some(delay) => Some(*delay),
                None if faults.delayed_fetches.0 > 0 => {
                    faults.delayed_fetches.0 -= 1;
                    Some(faults.delayed_fetches.1)
                }
                None => None,
            };
            let failing = match faults.failing_ids.get_mut(id) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ if faults.failing_fetches > 0 => {
                    faults.failing_fetches -= 1;
                    true
                }
                _ => false,
            };
            let result = if failing {
                Err(StoreError::Unavailable)
            } else if ledger.faults.corrupted.contains(id) {
                Ok(Some(vec![0xba, 0xad]))
            } else {
                match ledger.accounts.get(id) {
                    Some(account) => account.encode().map(Some),
                    None => Ok(None),
                }
            };
            (result, delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }

    async fn head_id(&self) -> Result<RecordId, StoreError> {
        Ok(self.head().await)
    }

    async fn subscribe(&self) -> Result<Subscription, StoreError> {
        let mut ledger = self.ledger.write().await;
        if ledger.faults.failing_subscribes > 0 {
            ledger.faults.failing_subscribes -= 1;
            return Err(StoreError::Unavailable);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        ledger.subscribers.push(tx);
        Ok(Subscription::new(rx))
    }
}
