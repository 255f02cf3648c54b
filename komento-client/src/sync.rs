use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::{
    sync::watch,
    time::{Instant, MissedTickBehavior},
};

use crate::{
    api::{EntityRef, Error, Time},
    build_tree,
    listener::{ChangeCallback, ListenerState, Subscription},
    mutation::{Overlay, PendingMutation, TurnQueue},
    store::StoreContext,
    Comment,
};

/// Why a refresh got requested
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncReason {
    Initial,
    /// Pull-to-refresh or the like
    Manual,
    /// The app came back to the foreground
    Foreground,
    Realtime,
    Poll,
    Mutation,
}

impl SyncReason {
    fn is_throttled(self) -> bool {
        matches!(self, SyncReason::Manual | SyncReason::Foreground)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SyncOutcome {
    Refreshed,
    /// Dropped, the previous sync is too recent
    Throttled,
    /// Folded into the sync already running, which will run once more
    Coalesced,
    /// The result arrived too late to be used
    Discarded,
    Failed(Error),
}

/// What a comment feed currently shows
#[derive(Clone, Debug, PartialEq)]
pub struct FeedState {
    pub entity: EntityRef,
    pub items: Vec<Comment>,
    /// No load completed yet, `items` may come from the cache
    pub loading: bool,
    /// Error of the last refresh, cleared by the next successful one
    pub error: Option<Error>,
    pub pending: Vec<PendingMutation>,
    pub listener: ListenerState,
    /// When `items`' confirmed part was fetched from the backend
    pub fetched_at: Option<Time>,
}

#[derive(Debug, Default)]
struct SyncFlags {
    in_flight: bool,
    rerun: bool,
    last_started: Option<Instant>,
}

#[derive(Debug)]
pub(crate) struct FeedData {
    pub overlay: Overlay,
    pub loading: bool,
    pub error: Option<Error>,
    pub listener: ListenerState,
    pub fetched_at: Option<Time>,
    sync: SyncFlags,
}

impl FeedData {
    fn snapshot(&self, entity: EntityRef) -> FeedState {
        FeedState {
            entity,
            items: self.overlay.view().to_vec(),
            loading: self.loading,
            error: self.error.clone(),
            pending: self.overlay.pending().to_vec(),
            listener: self.listener,
            fetched_at: self.fetched_at,
        }
    }
}

/// Shared state of the comment feed of one entity
pub(crate) struct FeedInner {
    pub entity: EntityRef,
    pub ctx: Arc<StoreContext>,
    pub queue: TurnQueue,
    data: parking_lot::Mutex<FeedData>,
    subscription: parking_lot::Mutex<Option<Subscription>>,
    alive: AtomicBool,
    publisher: watch::Sender<FeedState>,
}

struct InFlightSync<'a> {
    feed: &'a FeedInner,
    armed: bool,
}

impl Drop for InFlightSync<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.feed.data.lock().sync.in_flight = false;
        }
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => futures::future::pending().await,
    }
}

async fn changed_opt(
    listener: &mut Option<watch::Receiver<ListenerState>>,
) -> Result<(), watch::error::RecvError> {
    match listener {
        Some(l) => l.changed().await,
        None => futures::future::pending().await,
    }
}

impl FeedInner {
    pub fn new(entity: EntityRef, ctx: Arc<StoreContext>) -> Arc<FeedInner> {
        let data = FeedData {
            overlay: Overlay::default(),
            loading: true,
            error: None,
            listener: ListenerState::Idle,
            fetched_at: None,
            sync: SyncFlags::default(),
        };
        let (publisher, _) = watch::channel(data.snapshot(entity));
        Arc::new(FeedInner {
            entity,
            ctx,
            queue: TurnQueue::default(),
            data: parking_lot::Mutex::new(data),
            subscription: parking_lot::Mutex::new(None),
            alive: AtomicBool::new(true),
            publisher,
        })
    }

    pub fn watch(&self) -> watch::Receiver<FeedState> {
        self.publisher.subscribe()
    }

    pub fn state(&self) -> FeedState {
        self.data.lock().snapshot(self.entity)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Stops applying results and closes the live channel
    pub fn kill(&self) {
        self.alive.store(false, Ordering::Release);
        self.subscription.lock().take();
    }

    /// Runs `f` on the feed data, then publishes the new state
    pub fn update<R>(&self, f: impl FnOnce(&mut FeedData) -> R) -> R {
        let mut d = self.data.lock();
        let res = f(&mut d);
        if self.is_alive() {
            self.publisher.send_replace(d.snapshot(self.entity));
        }
        res
    }

    pub fn find<R>(&self, id: &crate::api::CommentId, f: impl FnOnce(&Comment) -> R) -> Option<R> {
        let d = self.data.lock();
        Comment::find_in(d.overlay.view(), id).map(f)
    }

    /// Shows the cached tree, if any, then fetches the real one
    pub async fn mount(self: Arc<Self>) {
        if let Some(entry) = self.ctx.cache.read(&self.entity).await {
            self.update(|d| {
                // a realtime-triggered refresh may have won the race
                if d.fetched_at.is_none() {
                    tracing::debug!(entity = %self.entity, fetched_at = %entry.fetched_at, "showing cached comments");
                    d.overlay.rebase(entry.tree);
                    d.fetched_at = Some(entry.fetched_at);
                }
            });
        }
        self.sync(SyncReason::Initial).await;
    }

    /// Refreshes the confirmed tree from the backend.
    ///
    /// At most one refresh runs at a time: requests arriving meanwhile make it
    /// run once more when done.
    pub async fn sync(self: &Arc<Self>, reason: SyncReason) -> SyncOutcome {
        {
            let mut d = self.data.lock();
            if reason.is_throttled() {
                if let Some(at) = d.sync.last_started {
                    if at.elapsed() < self.ctx.config.cooldown {
                        tracing::debug!(entity = %self.entity, ?reason, "sync throttled");
                        return SyncOutcome::Throttled;
                    }
                }
            }
            if d.sync.in_flight {
                d.sync.rerun = true;
                return SyncOutcome::Coalesced;
            }
            d.sync.in_flight = true;
        }
        let mut guard = InFlightSync {
            feed: self,
            armed: true,
        };
        let mut reason = reason;
        loop {
            {
                let mut d = self.data.lock();
                d.sync.rerun = false;
                d.sync.last_started = Some(Instant::now());
            }
            let outcome = self.refresh(reason).await;
            let mut d = self.data.lock();
            if !d.sync.rerun || !self.is_alive() {
                d.sync.in_flight = false;
                guard.armed = false;
                return outcome;
            }
            tracing::debug!(entity = %self.entity, "running coalesced sync");
            reason = SyncReason::Realtime;
        }
    }

    async fn refresh(self: &Arc<Self>, reason: SyncReason) -> SyncOutcome {
        let config = &self.ctx.config;
        let viewer = self.ctx.session.current_user().map(|u| u.id);
        let revision = self.data.lock().overlay.revision();
        tracing::debug!(entity = %self.entity, ?reason, "refreshing comments");

        let mut attempt = 0;
        let flat = loop {
            match self.ctx.gateway.fetch_by_entity(&self.entity, viewer).await {
                Ok(flat) => break flat,
                Err(err) if err.is_retryable() && attempt < config.max_retries => {
                    let delay = config.backoff(attempt);
                    tracing::warn!(%err, entity = %self.entity, attempt, ?delay, "comment fetch failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                    if !self.is_alive() {
                        return SyncOutcome::Discarded;
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, entity = %self.entity, ?reason, "comment fetch failed");
                    self.update(|d| {
                        d.loading = false;
                        d.error = Some(err.clone());
                    });
                    return SyncOutcome::Failed(err);
                }
            }
        };
        if !self.is_alive() {
            return SyncOutcome::Discarded;
        }

        let tree = build_tree(flat);
        let now = chrono::Utc::now();
        let applied = self.update(|d| {
            if d.overlay.revision() != revision {
                d.sync.rerun = true;
                return false;
            }
            d.overlay.rebase(tree.clone());
            d.loading = false;
            d.error = None;
            d.fetched_at = Some(now);
            true
        });
        if !applied {
            tracing::debug!(entity = %self.entity, "discarding refresh that started before a commit");
            return SyncOutcome::Discarded;
        }
        self.ctx.cache.write(&self.entity, &tree, now).await;
        SyncOutcome::Refreshed
    }

    /// Attaches to the live channel of the entity, reopening it if it failed
    fn resubscribe(self: &Arc<Self>) -> watch::Receiver<ListenerState> {
        let feed = Arc::downgrade(self);
        let on_change: ChangeCallback = Arc::new(move || {
            if let Some(feed) = feed.upgrade() {
                tokio::spawn(async move {
                    feed.sync(SyncReason::Realtime).await;
                });
            }
        });
        let sub = self.ctx.registry.attach(self.entity, on_change);
        let state = sub.watch();
        *self.subscription.lock() = Some(sub);
        state
    }

    /// Keeps the feed in sync for as long as it lives: through the live
    /// channel while it is up, by polling otherwise.
    pub async fn supervise(self: Arc<Self>) {
        let config = self.ctx.config.clone();
        let mut resubscribes = 0;
        let mut listener = Some(self.resubscribe());
        loop {
            let state = match &mut listener {
                Some(l) => *l.borrow_and_update(),
                None => ListenerState::Error,
            };
            self.update(|d| d.listener = state);

            if state == ListenerState::Subscribed {
                // events may have been missed before the acknowledgement
                self.sync(SyncReason::Realtime).await;
                if changed_opt(&mut listener).await.is_err() {
                    tracing::debug!(entity = %self.entity, "live channel is gone");
                    listener = None;
                }
                continue;
            }

            let retry_at = (state == ListenerState::Error && resubscribes < config.max_retries)
                .then(|| Instant::now() + config.backoff(resubscribes));
            let mut ticker = tokio::time::interval_at(
                Instant::now() + config.poll_interval,
                config.poll_interval,
            );
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tracing::debug!(entity = %self.entity, ?state, "live channel down, polling");
                        self.sync(SyncReason::Poll).await;
                    }
                    _ = sleep_until_opt(retry_at) => {
                        resubscribes += 1;
                        tracing::info!(entity = %self.entity, attempt = resubscribes, "resubscribing to comment changes");
                        listener = Some(self.resubscribe());
                        break;
                    }
                    changed = changed_opt(&mut listener) => {
                        if changed.is_err() {
                            listener = None;
                        }
                        break;
                    }
                }
            }
        }
    }
}
