use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use futures::StreamExt;
use tokio::{sync::watch, task::JoinHandle};

use crate::api::{ChangeFeed, EntityRef, Error, FeedMessage};

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum ListenerState {
    Idle,
    Subscribing,
    Subscribed,
    Error,
}

pub type ChangeCallback = Arc<dyn Fn() + Send + Sync>;

struct Handler {
    on_change: ChangeCallback,
    state: watch::Sender<ListenerState>,
}

/// Everyone told about the changes of one entity.
///
/// `epoch` identifies the channel task currently allowed to publish; it moves
/// forward every time the channel gets reopened.
struct Listeners {
    state: ListenerState,
    epoch: u64,
    live: Option<(u64, Handler)>,
    attached: HashMap<u64, Handler>,
}

impl Listeners {
    fn new() -> Listeners {
        Listeners {
            state: ListenerState::Idle,
            epoch: 0,
            live: None,
            attached: HashMap::new(),
        }
    }

    fn handlers(&self) -> impl Iterator<Item = &Handler> {
        self.live
            .iter()
            .map(|(_, h)| h)
            .chain(self.attached.values())
    }

    fn set_state(&mut self, state: ListenerState) {
        self.state = state;
        for h in self.handlers() {
            h.state.send_replace(state);
        }
    }

    fn remove(&mut self, generation: u64) {
        if self.live.as_ref().map(|(g, _)| *g) == Some(generation) {
            self.live = None;
        } else {
            self.attached.remove(&generation);
        }
    }

    fn is_empty(&self) -> bool {
        self.live.is_none() && self.attached.is_empty()
    }
}

type SharedListeners = Arc<parking_lot::Mutex<Listeners>>;

struct ChannelSlot {
    task: Option<JoinHandle<()>>,
    listeners: SharedListeners,
}

type Slots = parking_lot::Mutex<HashMap<EntityRef, ChannelSlot>>;

/// Live change channels, at most one per entity.
///
/// Each channel fans out to the feeds attached to it, plus at most one
/// `subscribe` handle.
pub struct ChannelRegistry {
    feed: Arc<dyn ChangeFeed>,
    subscribe_timeout: Duration,
    slots: Arc<Slots>,
    next_generation: AtomicU64,
}

/// Handle to a live channel, which gets closed once no handle uses it anymore.
///
/// A handle replaced by a newer `subscribe` on the same entity reports
/// `Error`, never fires again and dropping it does nothing.
pub struct Subscription {
    entity: EntityRef,
    generation: u64,
    slots: Weak<Slots>,
    state: watch::Receiver<ListenerState>,
}

impl ChannelRegistry {
    pub fn new(feed: Arc<dyn ChangeFeed>, subscribe_timeout: Duration) -> ChannelRegistry {
        ChannelRegistry {
            feed,
            subscribe_timeout,
            slots: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Calls `on_change` on every insert, update or delete of a comment of
    /// `entity`, replacing the previous `subscribe` handle of `entity`
    pub fn subscribe(&self, entity: EntityRef, on_change: ChangeCallback) -> Subscription {
        self.register(entity, on_change, true)
    }

    /// Like `subscribe`, but never replaces nor gets replaced: every attached
    /// handle is called on changes
    pub fn attach(&self, entity: EntityRef, on_change: ChangeCallback) -> Subscription {
        self.register(entity, on_change, false)
    }

    fn register(&self, entity: EntityRef, on_change: ChangeCallback, live: bool) -> Subscription {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut slots = self.slots.lock();
        let slot = slots.entry(entity).or_insert_with(|| ChannelSlot {
            task: None,
            listeners: Arc::new(parking_lot::Mutex::new(Listeners::new())),
        });
        let mut listeners = slot.listeners.lock();

        // a failed channel never recovers by itself, open a new one
        if slot.task.is_none() || listeners.state == ListenerState::Error {
            if let Some(old) = slot.task.take() {
                old.abort();
            }
            listeners.epoch += 1;
            listeners.set_state(ListenerState::Subscribing);
            tracing::debug!(%entity, epoch = listeners.epoch, "opening live channel");
            slot.task = Some(tokio::spawn(run_channel(
                self.feed.clone(),
                entity,
                self.subscribe_timeout,
                slot.listeners.clone(),
                listeners.epoch,
            )));
        }

        let (state_tx, state) = watch::channel(listeners.state);
        let handler = Handler {
            on_change,
            state: state_tx,
        };
        if live {
            if let Some((_, old)) = listeners.live.replace((generation, handler)) {
                tracing::debug!(%entity, "replacing live subscription");
                old.state.send_replace(ListenerState::Error);
            }
        } else {
            listeners.attached.insert(generation, handler);
        }

        Subscription {
            entity,
            generation,
            slots: Arc::downgrade(&self.slots),
            state,
        }
    }

    pub fn active_channels(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|s| s.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false))
            .count()
    }
}

impl Drop for ChannelRegistry {
    fn drop(&mut self) {
        for (_, slot) in self.slots.lock().drain() {
            if let Some(task) = slot.task {
                task.abort();
            }
        }
    }
}

impl Subscription {
    pub fn entity(&self) -> EntityRef {
        self.entity
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ListenerState> {
        self.state.clone()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let slots = match self.slots.upgrade() {
            Some(s) => s,
            None => return,
        };
        let mut slots = slots.lock();
        let unused = match slots.get(&self.entity) {
            Some(slot) => {
                let mut listeners = slot.listeners.lock();
                listeners.remove(self.generation);
                listeners.is_empty()
            }
            None => false,
        };
        if unused {
            if let Some(task) = slots.remove(&self.entity).and_then(|s| s.task) {
                tracing::debug!(entity = %self.entity, "closing live channel");
                task.abort();
            }
        }
    }
}

fn publish(listeners: &SharedListeners, epoch: u64, state: ListenerState) {
    let mut l = listeners.lock();
    if l.epoch == epoch {
        l.set_state(state);
    }
}

async fn open(
    feed: &dyn ChangeFeed,
    entity: &EntityRef,
) -> Result<crate::api::FeedReceiver, Error> {
    let mut rx = feed.open_channel(entity.comment_topic()).await?;
    match rx.next().await {
        Some(FeedMessage::Subscribed) => Ok(rx),
        Some(FeedMessage::Change(_)) => Err(Error::Unknown(String::from(
            "change received before subscription acknowledgement",
        ))),
        Some(FeedMessage::Error(e)) => Err(Error::Unavailable(e)),
        None => Err(Error::Unavailable(String::from("change feed closed"))),
    }
}

async fn run_channel(
    feed: Arc<dyn ChangeFeed>,
    entity: EntityRef,
    subscribe_timeout: Duration,
    listeners: SharedListeners,
    epoch: u64,
) {
    let mut rx = match tokio::time::timeout(subscribe_timeout, open(&*feed, &entity)).await {
        Ok(Ok(rx)) => rx,
        Ok(Err(err)) => {
            tracing::warn!(%err, %entity, "failed subscribing to comment changes");
            publish(&listeners, epoch, ListenerState::Error);
            return;
        }
        Err(_) => {
            tracing::warn!(%entity, timeout = ?subscribe_timeout, "comment change subscription was not acknowledged");
            publish(&listeners, epoch, ListenerState::Error);
            return;
        }
    };
    tracing::debug!(%entity, "subscribed to comment changes");
    publish(&listeners, epoch, ListenerState::Subscribed);

    while let Some(msg) = rx.next().await {
        match msg {
            FeedMessage::Subscribed => (),
            FeedMessage::Change(evt) => {
                tracing::trace!(%entity, table = %evt.table, kind = ?evt.kind, "comment change");
                let callbacks = {
                    let l = listeners.lock();
                    if l.epoch != epoch {
                        return;
                    }
                    l.handlers()
                        .map(|h| h.on_change.clone())
                        .collect::<Vec<_>>()
                };
                for on_change in callbacks {
                    on_change();
                }
            }
            FeedMessage::Error(err) => {
                tracing::warn!(%err, %entity, "comment change channel failed");
                break;
            }
        }
    }
    tracing::debug!(%entity, "comment change channel ended");
    publish(&listeners, epoch, ListenerState::Error);
}
