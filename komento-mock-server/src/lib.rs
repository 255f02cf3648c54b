use std::{
    collections::{BTreeMap, HashSet},
    time::Duration,
};

use async_trait::async_trait;
use futures::channel::mpsc;
use komento_api::{
    Backend, ChangeEvent, ChangeFeed, ChangeKind, ChannelTopic, Comment, CommentId, CounterName,
    CounterTarget, EntityId, EntityRef, EntityType, Error, FeedMessage, FeedReceiver, Like,
    NewComment, NewNotification, RawComment, RawUser, User, UserId, Uuid,
};

/// Failures the mock server can be told to simulate
#[derive(Clone, Debug, Default)]
pub struct Faults {
    /// Every call fails as if the network was down
    pub offline: bool,
    /// Calls that write anything fail as if the network was down
    pub fail_writes: bool,
    /// The aggregated comments-with-users procedure is not deployed
    pub no_aggregated_fetch: bool,
    /// The atomic counter procedure is not deployed
    pub no_atomic_counters: bool,
    /// Opening a change channel fails
    pub no_change_feed: bool,
    /// Delay before a change channel gets acknowledged, `None` for immediate
    pub ack_delay: Option<Duration>,
    /// Change channels never get acknowledged
    pub no_ack: bool,
    pub fail_notifications: bool,
    /// Added to every call
    pub latency: Option<Duration>,
}

/// Number of calls the mock server received, by kind
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CallCounts {
    pub fetches: usize,
    pub inserts: usize,
    pub deletes: usize,
    pub like_writes: usize,
    pub counter_writes: usize,
    pub channels_opened: usize,
}

#[derive(Debug, Default)]
struct MockDb {
    users: BTreeMap<UserId, User>,
    entities: HashSet<EntityRef>,
    // in insertion order
    comments: Vec<Comment>,
    likes: HashSet<(EntityType, Like)>,
    notifications: Vec<NewNotification>,
    feeds: Vec<(ChannelTopic, mpsc::UnboundedSender<FeedMessage>)>,
    faults: Faults,
    calls: CallCounts,
}

impl MockDb {
    fn comment_mut(&mut self, entity_type: EntityType, id: CommentId) -> Option<&mut Comment> {
        self.comments
            .iter_mut()
            .find(|c| c.id == id && c.entity.entity_type == entity_type)
    }

    fn relay_change(&mut self, entity: EntityRef, kind: ChangeKind, record_id: Uuid) {
        let table = entity.entity_type.comment_table();
        let column = entity.entity_type.parent_column();
        let evt = ChangeEvent {
            table: String::from(table),
            kind,
            record_id: Some(record_id),
        };
        self.feeds.retain_mut(|(topic, f)| {
            if !topic.matches(table, column, &entity.entity_id.0) {
                return !f.is_closed();
            }
            matches!(f.unbounded_send(FeedMessage::Change(evt.clone())), Ok(()))
        });
    }

    fn adjust(&mut self, target: CounterTarget, delta: i64) -> Result<i64, Error> {
        let c = self
            .comment_mut(target.entity_type, target.comment_id)
            .ok_or_else(|| Error::EntityNotFound(format!("comment {}", target.comment_id)))?;
        let counter = match target.counter {
            CounterName::Likes => &mut c.likes_count,
            CounterName::Replies => &mut c.replies_count,
        };
        *counter = (*counter + delta).max(0);
        let (value, entity) = (*counter, c.entity);
        self.relay_change(entity, ChangeKind::Update, target.comment_id.0);
        Ok(value)
    }

    fn raw_user(&self, id: UserId) -> Option<RawUser> {
        self.users.get(&id).map(|u| RawUser {
            id: Some(u.id.0),
            username: Some(u.username.clone()),
            avatar: Some(u.avatar.clone()),
        })
    }
}

/// In-memory system-of-record, with the same triggers as the real backend:
/// reply counts follow inserts and deletes, deletes cascade to replies and
/// likes, and every comment change is relayed to matching change channels.
pub struct MockServer(parking_lot::Mutex<MockDb>);

impl Default for MockServer {
    fn default() -> MockServer {
        MockServer::new()
    }
}

impl MockServer {
    pub fn new() -> MockServer {
        MockServer(parking_lot::Mutex::new(MockDb::default()))
    }

    pub fn admin_create_user(&self, username: &str) -> User {
        let u = User {
            id: UserId(Uuid::new_v4()),
            username: String::from(username),
            avatar: format!("https://avatars.invalid/{username}.png"),
        };
        self.0.lock().users.insert(u.id, u.clone());
        u
    }

    pub fn admin_create_post(&self) -> EntityRef {
        let e = EntityRef::post(EntityId(Uuid::new_v4()));
        self.0.lock().entities.insert(e);
        e
    }

    pub fn admin_create_reel(&self) -> EntityRef {
        let e = EntityRef::reel(EntityId(Uuid::new_v4()));
        self.0.lock().entities.insert(e);
        e
    }

    /// Deletes an entity and, like the foreign keys would, all its comments
    pub fn admin_delete_entity(&self, entity: &EntityRef) {
        let mut db = self.0.lock();
        db.entities.remove(entity);
        let removed = db
            .comments
            .iter()
            .filter(|c| c.entity == *entity)
            .map(|c| c.id)
            .collect::<HashSet<_>>();
        db.comments.retain(|c| c.entity != *entity);
        db.likes
            .retain(|(t, l)| *t != entity.entity_type || !removed.contains(&l.comment_id));
        for id in removed {
            db.relay_change(*entity, ChangeKind::Delete, id.0);
        }
    }

    /// Writes a comment as another client would, bypassing all checks
    pub fn admin_insert_comment(&self, c: Comment) {
        let mut db = self.0.lock();
        if let Some(parent) = c.parent_id {
            if let Some(p) = db.comment_mut(c.entity.entity_type, parent) {
                p.replies_count += 1;
            }
        }
        let (entity, id) = (c.entity, c.id);
        db.comments.push(c);
        db.relay_change(entity, ChangeKind::Insert, id.0);
    }

    pub fn admin_set_likes_count(&self, entity_type: EntityType, id: CommentId, count: i64) {
        if let Some(c) = self.0.lock().comment_mut(entity_type, id) {
            c.likes_count = count;
        }
    }

    pub fn update_faults(&self, f: impl FnOnce(&mut Faults)) {
        f(&mut self.0.lock().faults);
    }

    pub fn test_calls(&self) -> CallCounts {
        self.0.lock().calls
    }

    pub fn test_comment(&self, entity_type: EntityType, id: CommentId) -> Option<Comment> {
        self.0
            .lock()
            .comments
            .iter()
            .find(|c| c.id == id && c.entity.entity_type == entity_type)
            .cloned()
    }

    /// Comments of `entity` in creation order
    pub fn test_comments(&self, entity: &EntityRef) -> Vec<Comment> {
        let mut res = self
            .0
            .lock()
            .comments
            .iter()
            .filter(|c| c.entity == *entity)
            .cloned()
            .collect::<Vec<_>>();
        res.sort_by_key(|c| c.created_at);
        res
    }

    pub fn test_likes(&self, entity_type: EntityType, id: CommentId) -> usize {
        self.0
            .lock()
            .likes
            .iter()
            .filter(|(t, l)| *t == entity_type && l.comment_id == id)
            .count()
    }

    pub fn test_notifications(&self) -> Vec<NewNotification> {
        self.0.lock().notifications.clone()
    }

    /// Number of change channels currently open on `topic`
    pub fn test_active_channels(&self, topic: &ChannelTopic) -> usize {
        self.0
            .lock()
            .feeds
            .iter()
            .filter(|(t, f)| t == topic && !f.is_closed())
            .count()
    }

    async fn enter(&self, writes: bool) -> Result<(), Error> {
        let latency = self.0.lock().faults.latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let db = self.0.lock();
        if db.faults.offline || (writes && db.faults.fail_writes) {
            return Err(Error::TransientNetwork(String::from("mock server unreachable")));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for MockServer {
    async fn rpc_comments_with_users(&self, entity: &EntityRef) -> Result<Vec<RawComment>, Error> {
        self.enter(false).await?;
        let mut db = self.0.lock();
        if db.faults.no_aggregated_fetch {
            return Err(Error::Unavailable(String::from("get_comments_with_users")));
        }
        db.calls.fetches += 1;
        let mut comments = db
            .comments
            .iter()
            .filter(|c| c.entity == *entity)
            .cloned()
            .collect::<Vec<_>>();
        comments.sort_by_key(|c| c.created_at);
        Ok(comments
            .into_iter()
            .map(|c| {
                let user = db.raw_user(c.author_id);
                RawComment {
                    user,
                    ..RawComment::from(c)
                }
            })
            .collect())
    }

    async fn select_comments(&self, entity: &EntityRef) -> Result<Vec<RawComment>, Error> {
        self.enter(false).await?;
        let mut db = self.0.lock();
        db.calls.fetches += 1;
        let mut comments = db
            .comments
            .iter()
            .filter(|c| c.entity == *entity)
            .cloned()
            .collect::<Vec<_>>();
        comments.sort_by_key(|c| c.created_at);
        Ok(comments.into_iter().map(RawComment::from).collect())
    }

    async fn select_comment(
        &self,
        entity_type: EntityType,
        id: CommentId,
    ) -> Result<Option<RawComment>, Error> {
        self.enter(false).await?;
        Ok(self
            .0
            .lock()
            .comment_mut(entity_type, id)
            .map(|c| RawComment::from(c.clone())))
    }

    async fn select_users(&self, ids: &[UserId]) -> Result<Vec<RawUser>, Error> {
        self.enter(false).await?;
        let db = self.0.lock();
        Ok(ids.iter().filter_map(|id| db.raw_user(*id)).collect())
    }

    async fn select_users_by_name(&self, names: &[String]) -> Result<Vec<RawUser>, Error> {
        self.enter(false).await?;
        let db = self.0.lock();
        Ok(db
            .users
            .values()
            .filter(|u| names.contains(&u.username))
            .filter_map(|u| db.raw_user(u.id))
            .collect())
    }

    async fn select_liked(
        &self,
        entity_type: EntityType,
        user: UserId,
        ids: &[CommentId],
    ) -> Result<Vec<CommentId>, Error> {
        self.enter(false).await?;
        let db = self.0.lock();
        Ok(ids
            .iter()
            .copied()
            .filter(|id| {
                db.likes.contains(&(
                    entity_type,
                    Like {
                        comment_id: *id,
                        user_id: user,
                    },
                ))
            })
            .collect())
    }

    async fn entity_exists(&self, entity: &EntityRef) -> Result<bool, Error> {
        self.enter(false).await?;
        Ok(self.0.lock().entities.contains(entity))
    }

    async fn insert_comment(&self, new: NewComment) -> Result<RawComment, Error> {
        self.enter(true).await?;
        new.validate()?;
        let mut db = self.0.lock();
        db.calls.inserts += 1;
        if !db.entities.contains(&new.entity) {
            return Err(Error::EntityNotFound(format!("{}", new.entity)));
        }
        if db.comments.iter().any(|c| c.id == new.id) {
            return Err(Error::InvalidContent(format!("comment {} already exists", new.id)));
        }
        let c = new.to_comment();
        if let Some(parent) = c.parent_id {
            let p = db
                .comment_mut(c.entity.entity_type, parent)
                .filter(|p| p.entity == new.entity)
                .ok_or_else(|| Error::EntityNotFound(format!("comment {parent}")))?;
            p.replies_count += 1;
            db.relay_change(new.entity, ChangeKind::Update, parent.0);
        }
        db.comments.push(c.clone());
        db.relay_change(new.entity, ChangeKind::Insert, c.id.0);
        Ok(RawComment::from(c))
    }

    async fn delete_comment(
        &self,
        entity_type: EntityType,
        id: CommentId,
        author: UserId,
    ) -> Result<u64, Error> {
        self.enter(true).await?;
        let mut db = self.0.lock();
        db.calls.deletes += 1;
        let target = match db
            .comments
            .iter()
            .find(|c| c.id == id && c.entity.entity_type == entity_type && c.author_id == author)
        {
            Some(c) => c.clone(),
            None => return Ok(0),
        };

        let mut removed = HashSet::from([id]);
        loop {
            let before = removed.len();
            for c in &db.comments {
                if c.parent_id.map(|p| removed.contains(&p)).unwrap_or(false) {
                    removed.insert(c.id);
                }
            }
            if removed.len() == before {
                break;
            }
        }
        db.comments
            .retain(|c| c.entity.entity_type != entity_type || !removed.contains(&c.id));
        db.likes
            .retain(|(t, l)| *t != entity_type || !removed.contains(&l.comment_id));
        if let Some(parent) = target.parent_id {
            if let Some(p) = db.comment_mut(entity_type, parent) {
                p.replies_count = (p.replies_count - 1).max(0);
                db.relay_change(target.entity, ChangeKind::Update, parent.0);
            }
        }
        for r in removed {
            db.relay_change(target.entity, ChangeKind::Delete, r.0);
        }
        Ok(1)
    }

    async fn like_exists(&self, entity_type: EntityType, like: Like) -> Result<bool, Error> {
        self.enter(false).await?;
        Ok(self.0.lock().likes.contains(&(entity_type, like)))
    }

    async fn insert_like(&self, entity_type: EntityType, like: Like) -> Result<(), Error> {
        self.enter(true).await?;
        let mut db = self.0.lock();
        db.calls.like_writes += 1;
        if db.comment_mut(entity_type, like.comment_id).is_none() {
            return Err(Error::EntityNotFound(format!("comment {}", like.comment_id)));
        }
        if !db.likes.insert((entity_type, like)) {
            return Err(Error::InvalidContent(String::from("like already exists")));
        }
        Ok(())
    }

    async fn delete_like(&self, entity_type: EntityType, like: Like) -> Result<(), Error> {
        self.enter(true).await?;
        let mut db = self.0.lock();
        db.calls.like_writes += 1;
        db.likes.remove(&(entity_type, like));
        Ok(())
    }

    async fn rpc_increment_counter(&self, target: CounterTarget, delta: i64) -> Result<i64, Error> {
        self.enter(true).await?;
        let mut db = self.0.lock();
        if db.faults.no_atomic_counters {
            return Err(Error::Unavailable(String::from("increment_counter")));
        }
        db.calls.counter_writes += 1;
        db.adjust(target, delta)
    }

    async fn read_counter(&self, target: CounterTarget) -> Result<i64, Error> {
        self.enter(false).await?;
        let mut db = self.0.lock();
        let c = db
            .comment_mut(target.entity_type, target.comment_id)
            .ok_or_else(|| Error::EntityNotFound(format!("comment {}", target.comment_id)))?;
        Ok(match target.counter {
            CounterName::Likes => c.likes_count,
            CounterName::Replies => c.replies_count,
        })
    }

    async fn write_counter(&self, target: CounterTarget, value: i64) -> Result<(), Error> {
        self.enter(true).await?;
        let mut db = self.0.lock();
        db.calls.counter_writes += 1;
        let current = db
            .comment_mut(target.entity_type, target.comment_id)
            .map(|c| match target.counter {
                CounterName::Likes => c.likes_count,
                CounterName::Replies => c.replies_count,
            })
            .ok_or_else(|| Error::EntityNotFound(format!("comment {}", target.comment_id)))?;
        db.adjust(target, value - current).map(|_| ())
    }

    async fn insert_notification(&self, n: NewNotification) -> Result<(), Error> {
        self.enter(true).await?;
        let mut db = self.0.lock();
        if db.faults.fail_notifications {
            return Err(Error::Forbidden);
        }
        db.notifications.push(n);
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for MockServer {
    async fn open_channel(&self, topic: ChannelTopic) -> Result<FeedReceiver, Error> {
        self.enter(false).await?;
        let mut db = self.0.lock();
        if db.faults.no_change_feed {
            return Err(Error::Unavailable(String::from("realtime")));
        }
        db.calls.channels_opened += 1;
        let (sender, receiver) = mpsc::unbounded();
        match (db.faults.no_ack, db.faults.ack_delay) {
            (true, _) => (),
            (false, None) => {
                let _ = sender.unbounded_send(FeedMessage::Subscribed);
            }
            (false, Some(delay)) => {
                let sender = sender.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = sender.unbounded_send(FeedMessage::Subscribed);
                });
            }
        }
        tracing::debug!(table = %topic.table, filter = %topic.filter, "mock change channel opened");
        db.feeds.push((topic, sender));
        Ok(receiver)
    }
}
