use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use crate::{
    api::{
        self, Backend, CommentId, CounterName, CounterTarget, EntityRef, EntityType, Error, Like,
        Mention, NewComment, NewNotification, NotificationKind, RawComment, RawUser, User, UserId,
    },
    mention::extract_mentions,
    Comment,
};

/// Everything the engine asks of the system-of-record goes through here, and
/// this is the only place where backend rows get normalized.
#[derive(Clone)]
pub struct Gateway {
    backend: Arc<dyn Backend>,
}

fn normalize_rows(
    entity: &EntityRef,
    rows: Vec<RawComment>,
    users: &mut HashMap<UserId, User>,
) -> Vec<api::Comment> {
    let mut res = Vec::with_capacity(rows.len());
    for row in rows {
        match row.normalize(*entity) {
            Ok((c, author)) => {
                if let Some(u) = author.and_then(RawUser::normalize) {
                    users.insert(u.id, u);
                }
                res.push(c);
            }
            Err(err) => tracing::warn!(%err, %entity, "ignoring malformed comment row"),
        }
    }
    // stable, so rows created at the same instant keep the backend's order
    res.sort_by_key(|c| c.created_at);
    res
}

impl Gateway {
    pub fn new(backend: Arc<dyn Backend>) -> Gateway {
        Gateway { backend }
    }

    /// All comments of `entity`, flat and in chronological order, with authors
    /// resolved and `is_liked` set for `viewer`
    pub async fn fetch_by_entity(
        &self,
        entity: &EntityRef,
        viewer: Option<UserId>,
    ) -> Result<Vec<Comment>, Error> {
        let mut users = HashMap::new();
        let comments = match self.backend.rpc_comments_with_users(entity).await {
            Ok(rows) => normalize_rows(entity, rows, &mut users),
            Err(err) => {
                tracing::warn!(%err, %entity, "aggregated comment fetch failed, falling back to table query");
                let rows = self.backend.select_comments(entity).await?;
                normalize_rows(entity, rows, &mut users)
            }
        };

        let mut missing = comments
            .iter()
            .map(|c| c.author_id)
            .filter(|u| !users.contains_key(u))
            .collect::<Vec<_>>();
        missing.sort_unstable();
        missing.dedup();
        if !missing.is_empty() {
            let rows = self.backend.select_users(&missing).await?;
            users.extend(rows.into_iter().filter_map(RawUser::normalize).map(|u| (u.id, u)));
        }

        let liked = match viewer {
            Some(viewer) if !comments.is_empty() => {
                let ids = comments.iter().map(|c| c.id).collect::<Vec<_>>();
                self.backend
                    .select_liked(entity.entity_type, viewer, &ids)
                    .await?
                    .into_iter()
                    .collect::<HashSet<_>>()
            }
            _ => HashSet::new(),
        };

        Ok(comments
            .into_iter()
            .map(|c| {
                let author = users
                    .get(&c.author_id)
                    .cloned()
                    .unwrap_or_else(|| User::unknown(c.author_id));
                let is_liked = liked.contains(&c.id);
                Comment::new(c, author, is_liked)
            })
            .collect())
    }

    /// Inserts `new`, refusing to write anything if its entity is gone
    pub async fn insert(&self, new: NewComment, author: &User) -> Result<Comment, Error> {
        new.validate()?;
        if !self.backend.entity_exists(&new.entity).await? {
            return Err(Error::EntityNotFound(format!("{} {}", new.entity.entity_type, new.entity.entity_id)));
        }
        let entity = new.entity;
        let row = self.backend.insert_comment(new).await?;
        let (c, _) = row.normalize(entity)?;
        Ok(Comment::new(c, author.clone(), false))
    }

    /// Deletes comment `id`, which must belong to `requester`
    pub async fn delete(
        &self,
        entity_type: EntityType,
        id: CommentId,
        requester: UserId,
    ) -> Result<(), Error> {
        let row = self
            .backend
            .select_comment(entity_type, id)
            .await?
            .ok_or_else(|| Error::EntityNotFound(format!("comment {id}")))?;
        if row.author_id.map(UserId) != Some(requester) {
            return Err(Error::Forbidden);
        }
        match self.backend.delete_comment(entity_type, id, requester).await? {
            0 => Err(Error::EntityNotFound(format!("comment {id}"))),
            _ => Ok(()),
        }
    }

    /// Adds `delta` to a counter, returning the new value.
    ///
    /// Without the atomic procedure this falls back to read-then-write, in
    /// which concurrent adjustments can get lost.
    pub async fn adjust_counter(&self, target: CounterTarget, delta: i64) -> Result<i64, Error> {
        match self.backend.rpc_increment_counter(target, delta).await {
            Err(Error::Unavailable(what)) => {
                tracing::warn!(?target, %what, "atomic counter procedure unavailable, using read-then-write");
                let current = self.backend.read_counter(target).await?;
                let value = (current + delta).max(0);
                self.backend.write_counter(target, value).await?;
                Ok(value)
            }
            res => res,
        }
    }

    /// Makes the like relation match `liked`, returning whether it changed
    pub async fn set_like(
        &self,
        entity_type: EntityType,
        like: Like,
        liked: bool,
    ) -> Result<bool, Error> {
        if self.backend.like_exists(entity_type, like).await? == liked {
            return Ok(false);
        }
        let delta = match liked {
            true => {
                self.backend.insert_like(entity_type, like).await?;
                1
            }
            false => {
                self.backend.delete_like(entity_type, like).await?;
                -1
            }
        };
        let target = CounterTarget {
            entity_type,
            comment_id: like.comment_id,
            counter: CounterName::Likes,
        };
        // The relation is what matters, the count gets rebuilt by the next full sync
        if let Err(err) = self.adjust_counter(target, delta).await {
            tracing::warn!(%err, ?target, "like recorded but its counter could not be adjusted");
        }
        Ok(true)
    }

    /// Users mentioned in `content` that actually exist
    pub async fn resolve_mentions(&self, content: &str) -> Vec<Mention> {
        let names = extract_mentions(content);
        if names.is_empty() {
            return Vec::new();
        }
        let users = match self.backend.select_users_by_name(&names).await {
            Ok(rows) => rows
                .into_iter()
                .filter_map(RawUser::normalize)
                .collect::<Vec<_>>(),
            Err(err) => {
                tracing::warn!(%err, "failed resolving mentions, posting without them");
                return Vec::new();
            }
        };
        names
            .into_iter()
            .filter_map(|name| {
                users.iter().find(|u| u.username == name).map(|u| Mention {
                    user_id: u.id,
                    username: u.username.clone(),
                })
            })
            .collect()
    }

    /// Tells the parent's author and mentioned users about `comment`.
    ///
    /// Failures are logged and otherwise ignored.
    pub async fn notify_comment(&self, comment: &Comment, parent_author: Option<UserId>) {
        let actor = comment.author.id;
        let parent_author = match (comment.parent_id, parent_author) {
            (Some(_), Some(a)) => Some(a),
            (Some(parent), None) => {
                match self.backend.select_comment(comment.entity.entity_type, parent).await {
                    Ok(row) => row.and_then(|r| r.author_id).map(UserId),
                    Err(err) => {
                        tracing::warn!(%err, %parent, "failed looking up parent comment author");
                        None
                    }
                }
            }
            (None, _) => None,
        };

        let mut notifications = Vec::new();
        if let Some(recipient) = parent_author.filter(|a| *a != actor) {
            notifications.push((recipient, NotificationKind::Reply));
        }
        for m in &comment.mentions {
            if m.user_id != actor {
                notifications.push((m.user_id, NotificationKind::Mention));
            }
        }
        for (recipient, kind) in notifications {
            let n = NewNotification {
                recipient,
                actor,
                kind,
                entity: comment.entity,
                comment_id: comment.id,
            };
            if let Err(err) = self.backend.insert_notification(n).await {
                tracing::warn!(%err, %recipient, ?kind, comment = %comment.id, "failed creating notification");
            }
        }
    }
}
