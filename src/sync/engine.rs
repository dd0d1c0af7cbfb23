use std::{pin::Pin, sync::Arc, time::Duration};

use futures::{
    future::{self, BoxFuture},
    stream::FuturesOrdered,
    FutureExt, Stream, StreamExt,
};
use tokio::{
    select,
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, debug_span, info, trace, warn, Instrument};

use super::{
    config::SyncConfig,
    error::{FeedError, StoreError},
    feed::{EventFeed, FeedEvent, FeedHealth},
    fetch::Fetcher,
    hex::HexDisplayExt,
    publisher::{ChangeCallback, Snapshot, ViewPublisher, ViewReader},
    reconciler::{Reconciler, Resolved},
    record::RecordId,
    store::SharedStore,
    walker::{walk, WalkEnd, WalkStep},
};

type Walk = Pin<Box<dyn Stream<Item = WalkStep> + Send>>;
type Op = BoxFuture<'static, Resolved>;

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

enum Command {
    OnChange(ChangeCallback),
    Resubscribe,
}

/// Entry point for keeping a local view of a remote list in sync.
pub struct SyncEngine {
    store: SharedStore,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(store: SharedStore, mut config: SyncConfig) -> Self {
        // a zero period panics in `interval`, and a zero limit never reads
        config.patch_sweep_interval =
            config.patch_sweep_interval.max(MIN_SWEEP_INTERVAL);
        config.max_in_flight = config.max_in_flight.max(1);
        Self { store, config }
    }

    /// Subscribes, then walks the list from `head`. Must be called from
    /// inside a tokio runtime.
    pub fn start(self, head: RecordId) -> SyncHandle {
        let (publisher, reader) = ViewPublisher::new();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task = EngineTask {
            fetcher: Fetcher::from_config(self.store.clone(), &self.config),
            feed: EventFeed::new(self.store, self.config.fetch_timeout),
            reconciler: Reconciler::new(self.config.patch_horizon),
            config: self.config,
            health: FeedHealth::Connected,
            walk: None,
            ops: FuturesOrdered::new(),
            publisher,
            reconnect: None,
        };
        let span = debug_span!("sync", head = %head.hex().abbrev());
        let join = tokio::spawn(
            task.run(head, commands_rx, shutdown_rx).instrument(span),
        );

        SyncHandle {
            reader,
            commands: commands_tx,
            shutdown: Some(shutdown_tx),
            join: Some(join),
        }
    }

    /// Like `start`, but asks the store for the current head first.
    pub async fn start_from_remote_head(self) -> Result<SyncHandle, StoreError> {
        let head = remote_head(self.store.clone(), self.config.fetch_timeout).await?;
        Ok(self.start(head))
    }
}

/// Starts syncing the list whose newest record is `head`.
pub fn start_sync(
    store: SharedStore,
    head: RecordId,
    config: SyncConfig,
) -> SyncHandle {
    SyncEngine::new(store, config).start(head)
}

/// Control surface of a running engine. Dropping it stops the engine.
pub struct SyncHandle {
    reader: ViewReader,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl SyncHandle {
    /// The latest committed view. Never waits on the engine.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.reader.snapshot()
    }

    /// Runs `callback` after every commit, on the engine task. Keep it short:
    /// the engine does nothing else while it runs.
    pub fn on_change<F>(&self, callback: F)
    where
        F: FnMut(&Snapshot) + Send + 'static,
    {
        if self.commands.send(Command::OnChange(Box::new(callback))).is_err() {
            debug!("engine stopped, dropping callback");
        }
    }

    pub fn changes(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.reader.changes()
    }

    /// Drops the current subscription, subscribes again and re-walks the
    /// list. Needed after the feed reports `FeedHealth::Lost`.
    pub fn resubscribe(&self) {
        if self.commands.send(Command::Resubscribe).is_err() {
            debug!("engine stopped, ignoring resubscribe");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.join.as_ref().map_or(true, |join| join.is_finished())
    }

    /// Halts fetching and event delivery and releases the subscription. No
    /// callback runs once this returns. Calling it again does nothing.
    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                warn!("sync engine task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

struct EngineTask {
    fetcher: Fetcher,
    feed: EventFeed,
    reconciler: Reconciler,
    config: SyncConfig,
    health: FeedHealth,
    walk: Option<Walk>,
    /// Settled in the order their events arrived, whatever order the
    /// fetches finish in.
    ops: FuturesOrdered<Op>,
    publisher: ViewPublisher,
    /// Next resubscribe attempt and when to make it.
    reconnect: Option<(u32, Instant)>,
}

impl EngineTask {
    async fn run(
        mut self,
        head: RecordId,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        debug!("sync engine started");
        // subscribe before walking so nothing that happens during the walk
        // is missed
        if let Err(e) = self.feed.connect().await {
            warn!("initial subscribe failed: {}", e);
            self.schedule_reconnect(1);
        }
        self.start_walk(head);
        self.publish();

        let mut sweep = tokio::time::interval(self.config.patch_sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let read_feed = self.feed.is_connected()
                && (self.reconciler.is_bootstrapping()
                    || self.ops.len() < self.config.max_in_flight);
            let reconnect_at = self
                .reconnect
                .map(|(_, at)| at)
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            select! {
                biased;
                _ = &mut shutdown => break,
                Some(command) = commands.recv() => match command {
                    Command::OnChange(callback) => self.publisher.register(callback),
                    Command::Resubscribe => {
                        info!("resubscribe requested");
                        self.feed.disconnect();
                        self.health = FeedHealth::Reconnecting { attempt: 1 };
                        self.reconnect = Some((1, Instant::now()));
                        self.publish();
                    }
                },
                Some(step) = next_step(&mut self.walk), if self.walk.is_some() => {
                    self.on_walk_step(step);
                }
                Some(resolved) = self.ops.next() => {
                    if self.reconciler.apply(resolved, Instant::now()).changed() {
                        self.publish();
                    }
                    self.resume_tail_walk();
                }
                event = self.feed.next(), if read_feed => self.on_event(event),
                _ = sweep.tick() => {
                    let abandoned = self.reconciler.expire(Instant::now());
                    if abandoned > 0 {
                        debug!("{} delete patch(es) expired", abandoned);
                    }
                }
                _ = tokio::time::sleep_until(reconnect_at), if self.reconnect.is_some() => {
                    if let Some((attempt, _)) = self.reconnect.take() {
                        self.resubscribe(attempt).await;
                    }
                }
            }
        }

        self.publisher.close();
        self.feed.disconnect();
        debug!("sync engine stopped");
    }

    fn start_walk(&mut self, head: RecordId) {
        self.walk = Some(Box::pin(walk(self.fetcher.clone(), head)));
    }

    /// Handles a step of the bootstrap walk, or of a tail walk while live.
    fn on_walk_step(&mut self, step: WalkStep) {
        match step {
            WalkStep::Record(record) => {
                if self.reconciler.extend(record, Instant::now()).changed() {
                    self.publish();
                }
            }
            WalkStep::Ended(WalkEnd::Missing(id)) => {
                // deleted under the walk: carry on from where the delete
                // repointed the chain
                if self.reconciler.is_bootstrapping() {
                    self.buffer_ready_events();
                }
                let next = self
                    .reconciler
                    .buffered_repoint(&id)
                    .or_else(|| self.reconciler.continuation(&id));
                match next {
                    Some(next) => {
                        debug!(
                            "walk hit deleted {}, continuing from {}",
                            id.hex().abbrev(),
                            next.hex().abbrev()
                        );
                        self.start_walk(next);
                    }
                    None => self.finish_walk(Some(id), false),
                }
            }
            WalkStep::Ended(end) => self.finish_walk(None, end.is_truncated()),
        }
    }

    /// Buffers whatever the feed already holds, without waiting.
    fn buffer_ready_events(&mut self) {
        while self.feed.is_connected() {
            match self.feed.next().now_or_never() {
                Some(event) => self.on_event(event),
                None => break,
            }
        }
    }

    /// Ends the bootstrap walk, or a tail walk while live. `gap` is the
    /// missing record the walk stopped at, if any.
    fn finish_walk(&mut self, gap: Option<RecordId>, truncated: bool) {
        self.walk = None;
        if truncated {
            warn!("walk ended early, older records may be missing");
        }
        let replay = if self.reconciler.is_bootstrapping() {
            self.reconciler.finish_bootstrap(truncated)
        } else {
            if truncated {
                self.reconciler.mark_truncated();
            }
            Vec::new()
        };
        if let Some(gap) = gap {
            self.reconciler.mark_gap(gap);
        }
        self.publish();
        for event in replay {
            self.dispatch(event);
        }
    }

    /// Starts a tail walk once a delete has explained where the last walk
    /// stopped.
    fn resume_tail_walk(&mut self) {
        if self.walk.is_some() || self.reconciler.is_bootstrapping() {
            return;
        }
        if let Some(from) = self.reconciler.take_resume() {
            debug!("resuming the walk from {}", from.hex().abbrev());
            self.start_walk(from);
        }
    }

    fn on_event(&mut self, event: Result<FeedEvent, FeedError>) {
        match event {
            Ok(event) if self.reconciler.is_bootstrapping() => {
                self.reconciler.buffer(event);
            }
            Ok(event) => self.dispatch(event),
            Err(e) => {
                warn!("event feed failed: {}", e);
                self.feed.disconnect();
                self.schedule_reconnect(1);
                self.publish();
            }
        }
    }

    /// Queues the work for one live event. Fetches start right away; the
    /// results are applied in queue order.
    fn dispatch(&mut self, event: FeedEvent) {
        trace!("dispatching {:?}", event);
        let op: Op = match event {
            FeedEvent::Created(id) => {
                let fetcher = self.fetcher.clone();
                async move { Resolved::Created(id, fetcher.fetch_with_retry(id).await) }
                    .boxed()
            }
            FeedEvent::Updated(id) => {
                let fetcher = self.fetcher.clone();
                async move { Resolved::Updated(id, fetcher.fetch_with_retry(id).await) }
                    .boxed()
            }
            FeedEvent::Deleted { id, repoint_to } => {
                future::ready(Resolved::Deleted { id, repoint_to }).boxed()
            }
        };
        self.ops.push_back(op);
    }

    fn schedule_reconnect(&mut self, attempt: u32) {
        let delay = self.config.resubscribe.backoff(attempt);
        self.health = FeedHealth::Reconnecting { attempt };
        self.reconnect = Some((attempt, Instant::now() + delay));
    }

    /// Subscribes again and, once that works, re-walks from the current
    /// remote head: anything emitted while disconnected is gone.
    async fn resubscribe(&mut self, attempt: u32) {
        debug!("resubscribe attempt {}", attempt);
        let head = match self.feed.connect().await {
            Ok(()) => {
                remote_head(self.fetcher.store().clone(), self.config.fetch_timeout)
                    .await
                    .map_err(FeedError::from)
            }
            Err(e) => Err(e),
        };
        match head {
            Ok(head) => {
                info!("resubscribed, re-walking from {}", head.hex().abbrev());
                self.health = FeedHealth::Connected;
                self.reconciler.restart_bootstrap();
                self.ops = FuturesOrdered::new();
                self.start_walk(head);
            }
            Err(e) if self.config.resubscribe.allows(attempt) => {
                debug!("resubscribe attempt {} failed: {}", attempt, e);
                self.feed.disconnect();
                self.schedule_reconnect(attempt + 1);
            }
            Err(e) => {
                warn!(
                    "giving up on the event feed after {} attempt(s): {}",
                    attempt, e
                );
                self.feed.disconnect();
                self.health = FeedHealth::Lost;
            }
        }
        self.publish();
    }

    fn publish(&mut self) {
        self.publisher.publish(
            self.reconciler.records(),
            self.reconciler.phase(),
            self.reconciler.is_partial(),
            self.health,
        );
    }
}

async fn remote_head(
    store: SharedStore,
    timeout: Duration,
) -> Result<RecordId, StoreError> {
    match tokio::time::timeout(timeout, store.head_id()).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Rpc(format!(
            "head lookup timed out after {:?}",
            timeout
        ))),
    }
}

async fn next_step(walk: &mut Option<Walk>) -> Option<WalkStep> {
    match walk {
        Some(steps) => steps.next().await,
        None => None,
    }
}
