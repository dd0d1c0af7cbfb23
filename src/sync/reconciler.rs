// The reconciler is the only owner of the ordered view. It is a plain
// synchronous state machine: the engine task feeds it walk results and
// settled event outcomes one at a time, so no locking is needed anywhere
// inside it. Fetching happens outside, in the engine, and only the results
// are handed in here.
//
// The view is kept as an arena (id -> record) plus an explicit newest-first
// order index. Deletes splice the index and rewrite one predecessor link;
// there are no pointers between records to keep alive.

use std::{cmp::Reverse, collections::BinaryHeap, time::Duration};

use hashbrown::HashMap;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::{
    error::FetchError,
    feed::FeedEvent,
    hex::HexDisplayExt,
    record::{Record, RecordId, ORIGIN},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// The list walk is running. Events are held back until it finishes.
    Bootstrapping,
    /// Events are applied as they settle.
    Live,
}

/// An event whose fetch, if it needed one, has completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    Created(RecordId, Result<Record, FetchError>),
    Updated(RecordId, Result<Record, FetchError>),
    Deleted { id: RecordId, repoint_to: RecordId },
}

/// Whether a step changed what readers can see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed,
    Unchanged,
}

impl Applied {
    pub fn changed(self) -> bool {
        self == Applied::Changed
    }
}

#[derive(Default)]
struct Collection {
    records: HashMap<RecordId, Record>,
    order: Vec<RecordId>,
}

impl Collection {
    fn contains(&self, id: &RecordId) -> bool {
        self.records.contains_key(id)
    }

    fn front(&self) -> Option<RecordId> {
        self.order.first().copied()
    }

    fn back(&self) -> Option<&Record> {
        self.order.last().and_then(|id| self.records.get(id))
    }

    fn push_back(&mut self, record: Record) -> bool {
        if self.contains(&record.id) {
            return false;
        }
        self.order.push(record.id);
        self.records.insert(record.id, record);
        true
    }

    fn push_front(&mut self, record: Record) -> bool {
        if self.contains(&record.id) {
            return false;
        }
        self.order.insert(0, record.id);
        self.records.insert(record.id, record);
        true
    }

    fn remove(&mut self, id: &RecordId) -> Option<Record> {
        let record = self.records.remove(id)?;
        self.order.retain(|other| other != id);
        Some(record)
    }

    fn get_mut(&mut self, id: &RecordId) -> Option<&mut Record> {
        self.records.get_mut(id)
    }

    /// The newest entry naming `id` as its predecessor.
    fn successor_of(&mut self, id: &RecordId) -> Option<&mut Record> {
        let successor = *self.order.iter().find(|other| {
            self.records
                .get(*other)
                .map_or(false, |r| r.previous_id == *id)
        })?;
        self.records.get_mut(&successor)
    }

    fn to_vec(&self) -> Vec<Record> {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id).cloned())
            .collect()
    }
}

struct PendingPatch {
    repoint_to: RecordId,
    expires_at: Instant,
}

/// Ids that expire after a while. Used to remember deletes that have been
/// fully applied, so a repeated delete is a no-op.
struct ExpiringSet {
    set: HashMap<RecordId, Instant>,
    queue: BinaryHeap<(Reverse<Instant>, RecordId)>,
}

impl ExpiringSet {
    fn new() -> Self {
        Self {
            set: HashMap::new(),
            queue: BinaryHeap::new(),
        }
    }

    fn insert(&mut self, id: RecordId, expires_at: Instant) {
        self.set.insert(id, expires_at);
        self.queue.push((Reverse(expires_at), id));
    }

    fn contains(&self, id: &RecordId) -> bool {
        self.set.contains_key(id)
    }

    fn remove_expired(&mut self, now: Instant) {
        while self
            .queue
            .peek()
            .map_or(false, |(expiry, _)| expiry.0 <= now)
        {
            let Some((_, id)) = self.queue.pop() else {
                break;
            };
            // a later insert may have pushed the expiry out
            if self.set.get(&id).map_or(false, |expiry| *expiry <= now) {
                self.set.remove(&id);
            }
        }
    }
}

pub struct Reconciler {
    phase: Phase,
    /// What readers see.
    visible: Collection,
    /// Target of a re-bootstrap. Swapped in when the walk finishes.
    staging: Option<Collection>,
    /// Events that arrived while bootstrapping, in arrival order.
    buffered: Vec<FeedEvent>,
    /// Deletes whose successor has not been seen yet, keyed by deleted id.
    patches: HashMap<RecordId, PendingPatch>,
    settled: ExpiringSet,
    horizon: Duration,
    partial: bool,
    /// Where the last walk ran into a missing record. Older records may
    /// exist past it until the delete that explains it shows up.
    gap: Option<RecordId>,
    /// Where to walk from to fill a gap that a delete just closed.
    resume: Option<RecordId>,
}

impl Reconciler {
    pub fn new(horizon: Duration) -> Self {
        Self {
            phase: Phase::Bootstrapping,
            visible: Collection::default(),
            staging: None,
            buffered: Vec::new(),
            patches: HashMap::new(),
            settled: ExpiringSet::new(),
            horizon,
            partial: false,
            gap: None,
            resume: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_bootstrapping(&self) -> bool {
        self.phase == Phase::Bootstrapping
    }

    /// True when the last walk stopped early or an unexplained gap is
    /// still open at the tail.
    pub fn is_partial(&self) -> bool {
        self.partial || self.gap.is_some()
    }

    /// The visible collection, newest first.
    pub fn records(&self) -> Vec<Record> {
        self.visible.to_vec()
    }

    pub fn len(&self) -> usize {
        self.visible.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visible.order.is_empty()
    }

    pub fn pending_patches(&self) -> usize {
        self.patches.len()
    }

    pub fn buffered(&self) -> &[FeedEvent] {
        &self.buffered
    }

    /// Appends a walked record. Each walked record is older than the one
    /// before it, so appending keeps the order.
    pub fn seed(&mut self, record: Record, now: Instant) -> Applied {
        if !self.is_bootstrapping() {
            warn!("ignoring walked record {} while live", record.id.hex().abbrev());
            return Applied::Unchanged;
        }
        let record = self.resolve_patches(record, now);
        let id = record.id;
        let (target, visible) = match self.staging.as_mut() {
            Some(staging) => (staging, false),
            None => (&mut self.visible, true),
        };
        if !target.push_back(record) {
            debug!("walk yielded {} twice, skipping", id.hex().abbrev());
            return Applied::Unchanged;
        }
        if visible {
            Applied::Changed
        } else {
            Applied::Unchanged
        }
    }

    /// Appends a record from a walk that fills the tail while live.
    pub fn extend(&mut self, record: Record, now: Instant) -> Applied {
        if self.is_bootstrapping() {
            return self.seed(record, now);
        }
        let id = record.id;
        if self.settled.contains(&id) || self.patches.contains_key(&id) {
            debug!("tail walk yielded deleted {}, skipping", id.hex().abbrev());
            return Applied::Unchanged;
        }
        let record = self.resolve_patches(record, now);
        if self.visible.push_back(record) {
            trace!("appended {} at the tail", id.hex().abbrev());
            Applied::Changed
        } else {
            Applied::Unchanged
        }
    }

    /// Where a walk that stopped at the missing `id` should carry on, if the
    /// oldest record held has already been repointed past it.
    pub fn continuation(&self, id: &RecordId) -> Option<RecordId> {
        let target = self.staging.as_ref().unwrap_or(&self.visible);
        let previous = target.back()?.previous_id;
        if previous == *id || previous == ORIGIN || target.contains(&previous) {
            None
        } else {
            Some(previous)
        }
    }

    /// Records that the walk stopped at the missing `id`. A later delete of
    /// `id` reopens the walk from its repoint target.
    pub fn mark_gap(&mut self, id: RecordId) {
        debug!("walk stopped at missing {}, tail may be short", id.hex().abbrev());
        self.gap = Some(id);
    }

    /// Marks the view partial after a tail walk stopped early.
    pub fn mark_truncated(&mut self) {
        self.partial = true;
    }

    /// The start of a tail walk requested by a delete that closed the gap.
    pub fn take_resume(&mut self) -> Option<RecordId> {
        self.resume.take()
    }

    /// Holds an event back until the walk finishes.
    pub fn buffer(&mut self, event: FeedEvent) {
        trace!("buffering {:?} for {}", event, event.id().hex().abbrev());
        self.buffered.push(event);
    }

    /// The repoint target of a buffered delete of `id`, if one arrived.
    pub fn buffered_repoint(&self, id: &RecordId) -> Option<RecordId> {
        self.buffered.iter().rev().find_map(|event| match event {
            FeedEvent::Deleted {
                id: deleted,
                repoint_to,
            } if deleted == id => Some(*repoint_to),
            _ => None,
        })
    }

    /// Ends bootstrapping and hands back the buffered events, in arrival
    /// order, for replay.
    pub fn finish_bootstrap(&mut self, partial: bool) -> Vec<FeedEvent> {
        if let Some(staging) = self.staging.take() {
            self.visible = staging;
        }
        self.phase = Phase::Live;
        self.partial = partial;
        self.gap = None;
        debug!(
            records = self.visible.order.len(),
            buffered = self.buffered.len(),
            partial,
            "bootstrap finished"
        );
        std::mem::take(&mut self.buffered)
    }

    /// Starts over with a fresh walk. Readers keep the current collection
    /// until that walk finishes.
    pub fn restart_bootstrap(&mut self) {
        self.phase = Phase::Bootstrapping;
        self.staging = Some(Collection::default());
        self.buffered.clear();
        self.patches.clear();
        self.resume = None;
    }

    pub fn apply(&mut self, resolved: Resolved, now: Instant) -> Applied {
        match resolved {
            Resolved::Created(_, Ok(record)) => self.apply_created(record, now),
            Resolved::Updated(_, Ok(record)) => self.apply_updated(record),
            Resolved::Deleted { id, repoint_to } => {
                self.apply_deleted(id, repoint_to, now)
            }
            Resolved::Created(id, Err(e)) | Resolved::Updated(id, Err(e)) => {
                if e.is_not_found() {
                    debug!("{} is gone, dropping its event", id.hex().abbrev());
                } else {
                    warn!("dropping event for {}: {}", id.hex().abbrev(), e);
                }
                Applied::Unchanged
            }
        }
    }

    fn apply_created(&mut self, record: Record, now: Instant) -> Applied {
        let mut record = self.resolve_patches(record, now);
        if let Some(existing) = self.visible.get_mut(&record.id) {
            // walked and created at the same time
            return if existing.take_content(record) {
                Applied::Changed
            } else {
                Applied::Unchanged
            };
        }
        if self.settled.contains(&record.id) {
            debug!("{} was already deleted, not inserting", record.id.hex().abbrev());
            return Applied::Unchanged;
        }
        // The fetch may have seen deletes whose events are still queued
        // behind this one. Until they arrive the new head follows the
        // current local head.
        if let Some(front) = self.visible.front() {
            if record.previous_id != front && self.visible.contains(&record.previous_id) {
                trace!(
                    "{} links past {}, holding link until deletes arrive",
                    record.id.hex().abbrev(),
                    front.hex().abbrev()
                );
                record.previous_id = front;
            }
        }
        debug!("prepending {}", record.id.hex().abbrev());
        self.visible.push_front(record);
        Applied::Changed
    }

    fn apply_updated(&mut self, record: Record) -> Applied {
        let id = record.id;
        match self.visible.get_mut(&id) {
            Some(existing) => {
                if existing.take_content(record) {
                    debug!("updated {}", id.hex().abbrev());
                    Applied::Changed
                } else {
                    Applied::Unchanged
                }
            }
            None => {
                debug!("update for unknown {}, ignoring", id.hex().abbrev());
                Applied::Unchanged
            }
        }
    }

    fn apply_deleted(
        &mut self,
        id: RecordId,
        repoint_to: RecordId,
        now: Instant,
    ) -> Applied {
        let closed_gap = self.close_gap(&id, repoint_to);
        if self.settled.contains(&id) {
            trace!("delete of {} already applied", id.hex().abbrev());
            return if closed_gap {
                Applied::Changed
            } else {
                Applied::Unchanged
            };
        }
        let removed = self.visible.remove(&id).is_some() || closed_gap;
        if let Some(successor) = self.visible.successor_of(&id) {
            debug!(
                "deleted {}, {} now follows {}",
                id.hex().abbrev(),
                successor.id.hex().abbrev(),
                repoint_to.hex().abbrev()
            );
            successor.previous_id = repoint_to;
            self.patches.remove(&id);
            self.settled.insert(id, now + self.horizon);
            return Applied::Changed;
        }
        debug!(
            "deleted {}, holding patch to {} until its successor shows up",
            id.hex().abbrev(),
            repoint_to.hex().abbrev()
        );
        let expires_at = now + self.horizon;
        self.patches
            .entry(id)
            .and_modify(|patch| patch.repoint_to = repoint_to)
            .or_insert(PendingPatch {
                repoint_to,
                expires_at,
            });
        if removed {
            Applied::Changed
        } else {
            Applied::Unchanged
        }
    }

    /// A delete of the gap explains it: the list goes on at `repoint_to`.
    fn close_gap(&mut self, id: &RecordId, repoint_to: RecordId) -> bool {
        if self.gap != Some(*id) {
            return false;
        }
        self.gap = None;
        if repoint_to != ORIGIN && !self.visible.contains(&repoint_to) {
            debug!(
                "gap at {} closed, walking on from {}",
                id.hex().abbrev(),
                repoint_to.hex().abbrev()
            );
            self.resume = Some(repoint_to);
        }
        true
    }

    /// Rewrites the record's predecessor through any pending patches.
    fn resolve_patches(&mut self, mut record: Record, now: Instant) -> Record {
        // every hop consumes a patch, so this terminates
        while let Some(patch) = self.patches.remove(&record.previous_id) {
            debug!(
                "applying pending patch on {}: {} -> {}",
                record.id.hex().abbrev(),
                record.previous_id.hex().abbrev(),
                patch.repoint_to.hex().abbrev()
            );
            self.settled.insert(record.previous_id, now + self.horizon);
            record.previous_id = patch.repoint_to;
        }
        record
    }

    /// Abandons patches past their horizon. Returns how many were dropped.
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.patches.len();
        self.patches.retain(|id, patch| {
            if patch.expires_at <= now {
                warn!(
                    "abandoning unresolved delete patch {} -> {}",
                    id.hex().abbrev(),
                    patch.repoint_to.hex().abbrev()
                );
                false
            } else {
                true
            }
        });
        self.settled.remove_expired(now);
        before - self.patches.len()
    }
}

/// A break in the ordering or uniqueness of a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderViolation {
    Duplicate(RecordId),
    /// `record` names a present predecessor that does not directly follow it.
    Misplaced { record: RecordId, previous: RecordId },
}

/// Checks that ids are unique and that every present predecessor sits
/// directly after its successor.
pub fn verify_order(records: &[Record]) -> Result<(), OrderViolation> {
    let mut ids = HashMap::with_capacity(records.len());
    for (i, record) in records.iter().enumerate() {
        if ids.insert(record.id, i).is_some() {
            return Err(OrderViolation::Duplicate(record.id));
        }
    }
    for (i, record) in records.iter().enumerate() {
        if let Some(&position) = ids.get(&record.previous_id) {
            if position != i + 1 {
                return Err(OrderViolation::Misplaced {
                    record: record.id,
                    previous: record.previous_id,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HORIZON: Duration = Duration::from_secs(300);

    fn id(n: u8) -> RecordId {
        [n; 32]
    }

    fn rec(n: u8, prev: u8, title: &str) -> Record {
        Record::builder()
            .id(id(n))
            .title(title)
            .previous_id(if prev == 0 { ORIGIN } else { id(prev) })
            .build()
    }

    fn ids(reconciler: &Reconciler) -> Vec<u8> {
        reconciler.records().iter().map(|r| r.id[0]).collect()
    }

    fn prev_of(reconciler: &Reconciler, n: u8) -> RecordId {
        reconciler
            .records()
            .into_iter()
            .find(|r| r.id == id(n))
            .unwrap()
            .previous_id
    }

    /// A live reconciler seeded with `records` (newest first).
    fn live(records: &[Record]) -> Reconciler {
        let now = Instant::now();
        let mut reconciler = Reconciler::new(HORIZON);
        for record in records {
            reconciler.seed(record.clone(), now);
        }
        assert!(reconciler.finish_bootstrap(false).is_empty());
        reconciler
    }

    fn created(record: Record) -> Resolved {
        Resolved::Created(record.id, Ok(record))
    }

    fn deleted(n: u8, to: u8) -> Resolved {
        Resolved::Deleted {
            id: id(n),
            repoint_to: if to == 0 { ORIGIN } else { id(to) },
        }
    }

    #[test]
    fn seeding_appends_in_walk_order() {
        let reconciler = live(&[rec(3, 2, "c"), rec(2, 1, "b"), rec(1, 0, "a")]);
        assert_eq!(ids(&reconciler), [3, 2, 1]);
        assert_eq!(reconciler.phase(), Phase::Live);
        assert!(verify_order(&reconciler.records()).is_ok());
    }

    #[test]
    fn events_are_buffered_while_bootstrapping() {
        let now = Instant::now();
        let mut reconciler = Reconciler::new(HORIZON);
        reconciler.seed(rec(3, 2, "c"), now);
        reconciler.buffer(FeedEvent::Created(id(4)));
        reconciler.seed(rec(2, 1, "b"), now);
        reconciler.seed(rec(1, 0, "a"), now);
        let replay = reconciler.finish_bootstrap(false);
        assert_eq!(replay, [FeedEvent::Created(id(4))]);
        reconciler.apply(created(rec(4, 3, "d")), now);
        assert_eq!(ids(&reconciler), [4, 3, 2, 1]);
    }

    #[test]
    fn created_prepends() {
        let mut reconciler = live(&[rec(1, 0, "a")]);
        let applied = reconciler.apply(created(rec(2, 1, "b")), Instant::now());
        assert!(applied.changed());
        assert_eq!(ids(&reconciler), [2, 1]);
    }

    #[test]
    fn created_for_walked_record_is_not_duplicated() {
        let mut reconciler = live(&[rec(2, 1, "b"), rec(1, 0, "a")]);
        let now = Instant::now();
        assert_eq!(reconciler.apply(created(rec(2, 1, "b")), now), Applied::Unchanged);
        assert_eq!(reconciler.apply(created(rec(2, 1, "b2")), now), Applied::Changed);
        assert_eq!(ids(&reconciler), [2, 1]);
        assert_eq!(reconciler.records()[0].title, "b2");
    }

    #[test]
    fn missing_records_are_dropped() {
        let mut reconciler = live(&[rec(1, 0, "a")]);
        let now = Instant::now();
        let gone = Resolved::Created(id(2), Err(FetchError::NotFound(id(2))));
        assert_eq!(reconciler.apply(gone, now), Applied::Unchanged);
        let flaky = Resolved::Updated(id(1), Err(FetchError::Timeout(HORIZON)));
        assert_eq!(reconciler.apply(flaky, now), Applied::Unchanged);
        assert_eq!(ids(&reconciler), [1]);
    }

    #[test]
    fn update_replaces_content_in_place() {
        let mut reconciler = live(&[rec(3, 2, "c"), rec(2, 1, "b"), rec(1, 0, "a")]);
        // the fetched copy carries a different link; position stays put
        let fresh = rec(2, 0, "b2");
        let applied = reconciler.apply(Resolved::Updated(id(2), Ok(fresh)), Instant::now());
        assert!(applied.changed());
        assert_eq!(ids(&reconciler), [3, 2, 1]);
        assert_eq!(reconciler.records()[1].title, "b2");
        assert_eq!(prev_of(&reconciler, 2), id(1));
    }

    #[test]
    fn update_for_unknown_record_is_ignored() {
        let mut reconciler = live(&[rec(1, 0, "a")]);
        let applied =
            reconciler.apply(Resolved::Updated(id(9), Ok(rec(9, 1, "x"))), Instant::now());
        assert_eq!(applied, Applied::Unchanged);
        assert_eq!(ids(&reconciler), [1]);
    }

    #[test]
    fn delete_repoints_successor() {
        let mut reconciler = live(&[rec(3, 2, "c"), rec(2, 1, "b"), rec(1, 0, "a")]);
        assert!(reconciler.apply(deleted(2, 1), Instant::now()).changed());
        assert_eq!(ids(&reconciler), [3, 1]);
        assert_eq!(prev_of(&reconciler, 3), id(1));
        assert_eq!(prev_of(&reconciler, 1), ORIGIN);
        assert_eq!(reconciler.pending_patches(), 0);
    }

    #[test]
    fn delete_of_oldest_repoints_to_origin() {
        let mut reconciler = live(&[rec(2, 1, "b"), rec(1, 0, "a")]);
        reconciler.apply(deleted(1, 0), Instant::now());
        assert_eq!(ids(&reconciler), [2]);
        assert!(reconciler.records()[0].is_oldest());
    }

    #[test]
    fn delete_is_idempotent() {
        let now = Instant::now();
        let mut once = live(&[rec(3, 2, "c"), rec(2, 1, "b"), rec(1, 0, "a")]);
        once.apply(deleted(2, 1), now);
        let mut twice = live(&[rec(3, 2, "c"), rec(2, 1, "b"), rec(1, 0, "a")]);
        twice.apply(deleted(2, 1), now);
        assert_eq!(twice.apply(deleted(2, 1), now), Applied::Unchanged);
        assert_eq!(once.records(), twice.records());
        assert_eq!(once.pending_patches(), twice.pending_patches());
    }

    #[test]
    fn delete_of_unfetched_predecessor_patches_present_successor() {
        // C points at B, which was never fetched
        let mut reconciler = live(&[rec(3, 2, "c")]);
        let now = Instant::now();
        reconciler.apply(deleted(2, 1), now);
        assert_eq!(prev_of(&reconciler, 3), id(1));
        assert_eq!(reconciler.pending_patches(), 0);
        // a late fetch of B is skipped
        assert_eq!(reconciler.apply(created(rec(2, 1, "b")), now), Applied::Unchanged);
        assert_eq!(ids(&reconciler), [3]);
    }

    #[test]
    fn pending_patch_resolves_on_later_fetch() {
        let now = Instant::now();
        let mut reconciler = live(&[rec(1, 0, "a")]);
        // B is deleted before the create of C (which points at B) settles
        assert_eq!(reconciler.apply(deleted(2, 1), now), Applied::Unchanged);
        assert_eq!(reconciler.pending_patches(), 1);
        reconciler.apply(created(rec(3, 2, "c")), now);
        assert_eq!(ids(&reconciler), [3, 1]);
        assert_eq!(prev_of(&reconciler, 3), id(1));
        assert_eq!(reconciler.pending_patches(), 0);
        // the record itself showing up late is not reinserted
        assert_eq!(reconciler.apply(created(rec(2, 1, "b")), now), Applied::Unchanged);
    }

    #[test]
    fn chained_patches_resolve_transitively() {
        let now = Instant::now();
        let mut reconciler = live(&[rec(1, 0, "a")]);
        reconciler.apply(deleted(3, 2), now);
        reconciler.apply(deleted(2, 1), now);
        reconciler.apply(created(rec(4, 3, "d")), now);
        assert_eq!(prev_of(&reconciler, 4), id(1));
        assert_eq!(reconciler.pending_patches(), 0);
    }

    #[test]
    fn patches_expire_after_horizon() {
        let now = Instant::now();
        let mut reconciler = live(&[rec(1, 0, "a")]);
        reconciler.apply(deleted(2, 1), now);
        assert_eq!(reconciler.expire(now + HORIZON / 2), 0);
        assert_eq!(reconciler.expire(now + HORIZON), 1);
        assert_eq!(reconciler.pending_patches(), 0);
        // without the patch the late record keeps its stale link
        reconciler.apply(created(rec(3, 2, "c")), now + HORIZON);
        assert_eq!(prev_of(&reconciler, 3), id(2));
    }

    #[test]
    fn settled_deletes_are_forgotten_after_horizon() {
        let now = Instant::now();
        let mut reconciler = live(&[rec(2, 1, "b"), rec(1, 0, "a")]);
        reconciler.apply(deleted(1, 0), now);
        reconciler.expire(now + HORIZON);
        // a replayed delete now only leaves a patch behind
        assert_eq!(reconciler.apply(deleted(1, 0), now + HORIZON), Applied::Unchanged);
        assert_eq!(reconciler.pending_patches(), 1);
        assert_eq!(ids(&reconciler), [2]);
    }

    #[test]
    fn new_head_follows_local_head_until_deletes_arrive() {
        let now = Instant::now();
        let mut reconciler = live(&[rec(2, 1, "b"), rec(1, 0, "a")]);
        // C was created on top of B, and B deleted, before C's fetch ran
        reconciler.apply(created(rec(3, 1, "c")), now);
        assert_eq!(prev_of(&reconciler, 3), id(2));
        assert!(verify_order(&reconciler.records()).is_ok());
        reconciler.apply(deleted(2, 1), now);
        assert_eq!(ids(&reconciler), [3, 1]);
        assert_eq!(prev_of(&reconciler, 3), id(1));
    }

    #[test]
    fn restart_keeps_old_view_until_walk_finishes() {
        let now = Instant::now();
        let mut reconciler = live(&[rec(2, 1, "b"), rec(1, 0, "a")]);
        reconciler.restart_bootstrap();
        assert!(reconciler.is_bootstrapping());
        assert_eq!(reconciler.seed(rec(3, 2, "c"), now), Applied::Unchanged);
        assert_eq!(ids(&reconciler), [2, 1]);
        reconciler.seed(rec(2, 1, "b"), now);
        reconciler.seed(rec(1, 0, "a"), now);
        reconciler.finish_bootstrap(true);
        assert_eq!(ids(&reconciler), [3, 2, 1]);
        assert!(reconciler.is_partial());
    }

    #[test]
    fn buffered_repoint_finds_latest_delete() {
        let mut reconciler = Reconciler::new(HORIZON);
        reconciler.buffer(FeedEvent::Deleted {
            id: id(2),
            repoint_to: id(1),
        });
        reconciler.buffer(FeedEvent::Created(id(5)));
        assert_eq!(reconciler.buffered_repoint(&id(2)), Some(id(1)));
        assert_eq!(reconciler.buffered_repoint(&id(5)), None);
    }

    #[test]
    fn late_delete_of_gap_resumes_the_walk() {
        let now = Instant::now();
        // the walk got C, then found B already gone
        let mut reconciler = live(&[rec(3, 2, "c")]);
        reconciler.mark_gap(id(2));
        assert!(reconciler.is_partial());
        assert_eq!(reconciler.take_resume(), None);

        assert!(reconciler.apply(deleted(2, 1), now).changed());
        assert!(!reconciler.is_partial());
        assert_eq!(prev_of(&reconciler, 3), id(1));
        assert_eq!(reconciler.take_resume(), Some(id(1)));
        assert_eq!(reconciler.take_resume(), None);

        assert!(reconciler.extend(rec(1, 0, "a"), now).changed());
        assert_eq!(ids(&reconciler), [3, 1]);
        assert!(verify_order(&reconciler.records()).is_ok());
    }

    #[test]
    fn gap_closed_by_delete_to_origin_needs_no_walk() {
        let mut reconciler = live(&[rec(3, 2, "c")]);
        reconciler.mark_gap(id(2));
        reconciler.apply(deleted(2, 0), Instant::now());
        assert!(!reconciler.is_partial());
        assert_eq!(reconciler.take_resume(), None);
        assert!(reconciler.records()[0].is_oldest());
    }

    #[test]
    fn tail_walk_skips_deleted_records() {
        let now = Instant::now();
        let mut reconciler = live(&[rec(4, 3, "d")]);
        // C was fetched by the walk before its delete arrived
        reconciler.apply(deleted(3, 2), now);
        assert_eq!(reconciler.extend(rec(3, 2, "c"), now), Applied::Unchanged);
        reconciler.extend(rec(2, 1, "b"), now);
        assert_eq!(ids(&reconciler), [4, 2]);
        assert_eq!(prev_of(&reconciler, 4), id(2));
    }

    #[test]
    fn continuation_follows_a_repointed_tail() {
        let now = Instant::now();
        let mut reconciler = live(&[rec(3, 2, "c")]);
        assert_eq!(reconciler.continuation(&id(2)), None);
        reconciler.apply(deleted(2, 1), now);
        // the walk still stops at 2, but the tail now points past it
        assert_eq!(reconciler.continuation(&id(2)), Some(id(1)));
        reconciler.extend(rec(1, 0, "a"), now);
        assert_eq!(reconciler.continuation(&id(1)), None);
    }

    #[test]
    fn new_bootstrap_clears_the_gap() {
        let mut reconciler = live(&[rec(3, 2, "c")]);
        reconciler.mark_gap(id(2));
        reconciler.restart_bootstrap();
        reconciler.seed(rec(3, 0, "c"), Instant::now());
        reconciler.finish_bootstrap(false);
        assert!(!reconciler.is_partial());
    }

    #[test]
    fn failed_fetch_leaves_patch_for_the_sweep() {
        let now = Instant::now();
        let mut reconciler = live(&[rec(1, 0, "a")]);
        reconciler.apply(deleted(2, 1), now);
        let failed = Resolved::Created(id(3), Err(FetchError::Timeout(HORIZON)));
        assert_eq!(reconciler.apply(failed, now), Applied::Unchanged);
        assert_eq!(reconciler.pending_patches(), 1);
        assert_eq!(reconciler.expire(now + HORIZON), 1);
        assert_eq!(ids(&reconciler), [1]);
    }

    #[test]
    fn verify_order_catches_violations() {
        assert_eq!(
            verify_order(&[rec(1, 0, "a"), rec(1, 0, "a")]),
            Err(OrderViolation::Duplicate(id(1)))
        );
        assert_eq!(
            verify_order(&[rec(3, 1, "c"), rec(2, 1, "b"), rec(1, 0, "a")]),
            Err(OrderViolation::Misplaced {
                record: id(3),
                previous: id(1)
            })
        );
        // absent predecessors are allowed
        assert!(verify_order(&[rec(3, 2, "c"), rec(1, 0, "a")]).is_ok());
    }
}
