use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Weak},
};

use tokio::{sync::watch, task::JoinHandle};

use crate::{
    api::{
        Backend, ChangeFeed, CommentId, EntityRef, Error, Like, NewComment, User, UserId, Uuid,
    },
    cache::{CommentCache, KvStore},
    error::{MutationError, Operation},
    gateway::Gateway,
    listener::{ChannelRegistry, Subscription},
    mutation::{MutationId, MutationKind},
    session::Session,
    sync::{FeedInner, FeedState, SyncOutcome, SyncReason},
    Comment, SyncConfig,
};

pub(crate) struct StoreContext {
    pub gateway: Gateway,
    pub cache: CommentCache,
    pub session: Arc<dyn Session>,
    pub registry: ChannelRegistry,
    pub config: SyncConfig,
}

/// Result of a like toggle: whether the current user now likes the comment
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Liked {
    pub liked: bool,
}

/// Entry point of the engine: hands out live comment feeds and runs mutations
pub struct CommentStore {
    ctx: Arc<StoreContext>,
    feeds: parking_lot::Mutex<HashMap<EntityRef, Weak<FeedHandle>>>,
}

struct FeedHandle {
    feed: Arc<FeedInner>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for FeedHandle {
    fn drop(&mut self) {
        tracing::debug!(entity = %self.feed.entity, "closing comment feed");
        self.feed.kill();
        for t in &self.tasks {
            t.abort();
        }
    }
}

/// Live view of the comments of one entity.
///
/// Clones share the same feed, which stops syncing once the last one is dropped.
#[derive(Clone)]
pub struct CommentFeed(Arc<FeedHandle>);

impl CommentStore {
    pub fn new(
        backend: Arc<dyn Backend>,
        feed: Arc<dyn ChangeFeed>,
        cache: Arc<dyn KvStore>,
        session: Arc<dyn Session>,
        config: SyncConfig,
    ) -> CommentStore {
        CommentStore {
            ctx: Arc::new(StoreContext {
                gateway: Gateway::new(backend),
                cache: CommentCache::new(cache),
                session,
                registry: ChannelRegistry::new(feed, config.subscribe_timeout),
                config,
            }),
            feeds: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.ctx.config
    }

    /// Feed of the comments of `entity`, shared with any other live feed of it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn load_comments(&self, entity: EntityRef) -> CommentFeed {
        let mut feeds = self.feeds.lock();
        feeds.retain(|_, f| f.strong_count() > 0);
        if let Some(handle) = feeds.get(&entity).and_then(Weak::upgrade) {
            return CommentFeed(handle);
        }
        tracing::debug!(%entity, "opening comment feed");
        let feed = FeedInner::new(entity, self.ctx.clone());
        let tasks = vec![
            tokio::spawn(feed.clone().supervise()),
            tokio::spawn(feed.clone().mount()),
        ];
        let handle = Arc::new(FeedHandle { feed, tasks });
        feeds.insert(entity, Arc::downgrade(&handle));
        CommentFeed(handle)
    }

    fn current_user(&self, op: Operation) -> Result<User, MutationError> {
        self.ctx
            .session
            .current_user()
            .ok_or_else(|| MutationError::new(op, Error::NotAuthenticated))
    }

    fn feed_containing(&self, id: &CommentId) -> Option<CommentFeed> {
        self.feeds
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .find(|h| h.feed.find(id, |_| ()).is_some())
            .map(CommentFeed)
    }

    fn live_feed(&self, entity: &EntityRef) -> Option<CommentFeed> {
        self.feeds
            .lock()
            .get(entity)
            .and_then(Weak::upgrade)
            .map(CommentFeed)
    }

    /// Posts a comment on `entity`.
    ///
    /// When a feed of `entity` is live the comment shows up there optimistically,
    /// otherwise it is written directly without opening a feed.
    pub async fn add_comment(
        &self,
        entity: EntityRef,
        content: &str,
        parent_id: Option<CommentId>,
    ) -> Result<Comment, MutationError> {
        let op = Operation::AddComment;
        let author = self.current_user(op)?;
        if let Some(feed) = self.live_feed(&entity) {
            return feed.add_comment(content, parent_id).await;
        }
        let mut new = new_comment(entity, &author, content, parent_id)
            .map_err(|e| MutationError::new(op, e))?;
        let gateway = &self.ctx.gateway;
        new.mentions = gateway.resolve_mentions(&new.content).await;
        let comment = gateway
            .insert(new, &author)
            .await
            .map_err(|e| MutationError::new(op, e))?;
        self.ctx.cache.invalidate(&entity).await;
        spawn_notify(gateway, &comment, None);
        Ok(comment)
    }

    /// Deletes a comment shown in one of the live feeds
    pub async fn delete_comment(&self, id: CommentId) -> Result<(), MutationError> {
        let op = Operation::DeleteComment;
        self.current_user(op)?;
        let feed = self
            .feed_containing(&id)
            .ok_or_else(|| MutationError::new(op, Error::EntityNotFound(format!("comment {id}"))))?;
        feed.delete_comment(id).await
    }

    /// Toggles the like of a comment shown in one of the live feeds
    pub async fn toggle_like(&self, id: CommentId) -> Result<Liked, MutationError> {
        let op = Operation::ToggleLike;
        self.current_user(op)?;
        let feed = self
            .feed_containing(&id)
            .ok_or_else(|| MutationError::new(op, Error::EntityNotFound(format!("comment {id}"))))?;
        feed.toggle_like(id).await
    }

    /// Calls `on_change` on every comment change of `entity`.
    ///
    /// Replaces the previous `subscribe_live` handle of `entity`, which then
    /// reports `Error`. Feeds of `entity` share the same channel and are not
    /// affected.
    pub fn subscribe_live(
        &self,
        entity: EntityRef,
        on_change: impl Fn() + Send + Sync + 'static,
    ) -> Subscription {
        self.ctx.registry.subscribe(entity, Arc::new(on_change))
    }

    pub fn active_channels(&self) -> usize {
        self.ctx.registry.active_channels()
    }
}

impl CommentFeed {
    fn feed(&self) -> &Arc<FeedInner> {
        &self.0.feed
    }

    pub fn entity(&self) -> EntityRef {
        self.feed().entity
    }

    pub fn state(&self) -> FeedState {
        self.feed().state()
    }

    pub fn watch(&self) -> watch::Receiver<FeedState> {
        self.feed().watch()
    }

    /// Waits for the first load to complete, successfully or not
    pub async fn loaded(&self) -> FeedState {
        let mut rx = self.watch();
        loop {
            {
                let state = rx.borrow_and_update();
                if !state.loading {
                    return state.clone();
                }
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }

    /// Pull-to-refresh
    pub async fn refresh(&self) -> SyncOutcome {
        self.feed().sync(SyncReason::Manual).await
    }

    /// To be called when the app comes back to the foreground
    pub async fn foreground(&self) -> SyncOutcome {
        self.feed().sync(SyncReason::Foreground).await
    }

    /// Posts a comment, or a reply to `parent_id`.
    ///
    /// It shows up in the feed before this returns; the returned future then
    /// performs the remote insert, and on failure the comment disappears again.
    pub fn add_comment(
        &self,
        content: &str,
        parent_id: Option<CommentId>,
    ) -> impl Future<Output = Result<Comment, MutationError>> + Send + 'static {
        let started = self.feed().begin_add(content, parent_id);
        async move {
            let (flight, new, author) = started?;
            flight.feed.clone().finish_add(flight, new, author).await
        }
    }

    /// Deletes one of the current user's comments along with its replies
    pub fn delete_comment(
        &self,
        id: CommentId,
    ) -> impl Future<Output = Result<(), MutationError>> + Send + 'static {
        let started = self.feed().begin_delete(id);
        async move {
            let (flight, user) = started?;
            flight.feed.clone().finish_delete(flight, id, user).await
        }
    }

    /// Likes the comment if the current user does not yet, unlikes it otherwise
    pub fn toggle_like(
        &self,
        comment_id: CommentId,
    ) -> impl Future<Output = Result<Liked, MutationError>> + Send + 'static {
        let started = self.feed().begin_like(comment_id);
        async move {
            let (flight, user, liked) = started?;
            flight
                .feed
                .clone()
                .finish_like(flight, comment_id, user, liked)
                .await
        }
    }
}

/// Insert payload for a new comment, validated
fn new_comment(
    entity: EntityRef,
    author: &User,
    content: &str,
    parent_id: Option<CommentId>,
) -> Result<NewComment, Error> {
    let new = NewComment {
        id: CommentId(Uuid::new_v4()),
        entity,
        author_id: author.id,
        parent_id,
        content: String::from(content.trim()),
        mentions: Vec::new(),
        created_at: chrono::Utc::now(),
    };
    new.validate()?;
    Ok(new)
}

/// Notifications never hold up the add they follow
fn spawn_notify(gateway: &Gateway, comment: &Comment, parent_author: Option<UserId>) {
    let gateway = gateway.clone();
    let comment = comment.clone();
    tokio::spawn(async move {
        gateway.notify_comment(&comment, parent_author).await;
    });
}

/// A locally applied mutation awaiting its remote outcome.
///
/// Dropping it without `commit` rolls the mutation back.
struct InFlight {
    feed: Arc<FeedInner>,
    id: MutationId,
    keys: Vec<CommentId>,
    confirmed: Option<MutationKind>,
}

impl InFlight {
    async fn wait_turn(&self) {
        for key in &self.keys {
            self.feed.queue.wait_turn(*key, self.id).await;
        }
    }

    fn commit(mut self, confirmed: MutationKind) {
        self.confirmed = Some(confirmed);
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let id = self.id;
        let confirmed = self.confirmed.take();
        let state = self.feed.update(|d| match confirmed {
            Some(kind) => d.overlay.commit(id, kind),
            None => d.overlay.rollback(id),
        });
        for key in &self.keys {
            self.feed.queue.finish(*key, id);
        }
        tracing::debug!(entity = %self.feed.entity, ?id, ?state, "mutation settled");
    }
}

impl FeedInner {
    fn current_user(&self, op: Operation) -> Result<User, MutationError> {
        self.ctx
            .session
            .current_user()
            .ok_or_else(|| MutationError::new(op, Error::NotAuthenticated))
    }

    /// Applies the mutation `make` builds from the displayed tree, and takes
    /// its turn for the remote call
    fn begin(
        self: &Arc<Self>,
        make: impl FnOnce(&[Comment]) -> Result<MutationKind, Error>,
    ) -> Result<InFlight, Error> {
        let (id, keys) = self.update(|d| {
            let kind = make(d.overlay.view())?;
            let keys = kind.keys();
            let id = d.overlay.apply(kind);
            for key in &keys {
                self.queue.enqueue(*key, id);
            }
            Ok::<_, Error>((id, keys))
        })?;
        Ok(InFlight {
            feed: self.clone(),
            id,
            keys,
            confirmed: None,
        })
    }

    /// Requests a refresh once the backend accepted a mutation
    async fn after_commit(self: &Arc<Self>) {
        self.ctx.cache.invalidate(&self.entity).await;
        let feed = self.clone();
        tokio::spawn(async move {
            feed.sync(SyncReason::Mutation).await;
        });
    }

    fn begin_add(
        self: &Arc<Self>,
        content: &str,
        parent_id: Option<CommentId>,
    ) -> Result<(InFlight, NewComment, User), MutationError> {
        let op = Operation::AddComment;
        let author = self.current_user(op)?;
        let new = new_comment(self.entity, &author, content, parent_id)
            .map_err(|e| MutationError::new(op, e))?;
        let node = Comment::new(new.to_comment(), author.clone(), false);
        let flight = self
            .begin(|_| Ok(MutationKind::Add(node)))
            .map_err(|e| MutationError::new(op, e))?;
        Ok((flight, new, author))
    }

    async fn finish_add(
        self: Arc<Self>,
        flight: InFlight,
        mut new: NewComment,
        author: User,
    ) -> Result<Comment, MutationError> {
        flight.wait_turn().await;
        new.mentions = self.ctx.gateway.resolve_mentions(&new.content).await;
        let parent_author = new
            .parent_id
            .and_then(|p| self.find(&p, |c| c.author.id));
        match self.ctx.gateway.insert(new, &author).await {
            Ok(comment) => {
                flight.commit(MutationKind::Add(comment.clone()));
                self.after_commit().await;
                spawn_notify(&self.ctx.gateway, &comment, parent_author);
                Ok(comment)
            }
            Err(err) => {
                tracing::warn!(%err, entity = %self.entity, "failed to add comment, rolling back");
                drop(flight);
                Err(MutationError::new(Operation::AddComment, err))
            }
        }
    }

    fn begin_delete(self: &Arc<Self>, id: CommentId) -> Result<(InFlight, User), MutationError> {
        let op = Operation::DeleteComment;
        let user = self.current_user(op)?;
        let flight = self
            .begin(|_| Ok(MutationKind::Delete(id)))
            .map_err(|e| MutationError::new(op, e))?;
        Ok((flight, user))
    }

    async fn finish_delete(
        self: Arc<Self>,
        flight: InFlight,
        id: CommentId,
        user: User,
    ) -> Result<(), MutationError> {
        flight.wait_turn().await;
        match self
            .ctx
            .gateway
            .delete(self.entity.entity_type, id, user.id)
            .await
        {
            Ok(()) => {
                flight.commit(MutationKind::Delete(id));
                self.after_commit().await;
                Ok(())
            }
            Err(err) => {
                tracing::warn!(%err, %id, "failed to delete comment, rolling back");
                drop(flight);
                Err(MutationError::new(Operation::DeleteComment, err))
            }
        }
    }

    fn begin_like(
        self: &Arc<Self>,
        comment_id: CommentId,
    ) -> Result<(InFlight, User, bool), MutationError> {
        let op = Operation::ToggleLike;
        let user = self.current_user(op)?;
        let mut target = false;
        let flight = self
            .begin(|view| {
                let c = Comment::find_in(view, &comment_id)
                    .ok_or_else(|| Error::EntityNotFound(format!("comment {comment_id}")))?;
                target = !c.is_liked;
                Ok(MutationKind::Like {
                    comment_id,
                    liked: target,
                })
            })
            .map_err(|e| MutationError::new(op, e))?;
        Ok((flight, user, target))
    }

    async fn finish_like(
        self: Arc<Self>,
        flight: InFlight,
        comment_id: CommentId,
        user: User,
        liked: bool,
    ) -> Result<Liked, MutationError> {
        flight.wait_turn().await;
        let like = Like {
            comment_id,
            user_id: user.id,
        };
        match self
            .ctx
            .gateway
            .set_like(self.entity.entity_type, like, liked)
            .await
        {
            Ok(changed) => {
                tracing::debug!(%comment_id, liked, changed, "like updated");
                flight.commit(MutationKind::Like { comment_id, liked });
                self.after_commit().await;
                Ok(Liked { liked })
            }
            Err(err) => {
                tracing::warn!(%err, %comment_id, "failed to update like, rolling back");
                drop(flight);
                Err(MutationError::new(Operation::ToggleLike, err))
            }
        }
    }
}
