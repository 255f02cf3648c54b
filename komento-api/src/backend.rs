use async_trait::async_trait;

use crate::{
    CommentId, CounterTarget, EntityRef, EntityType, Error, Like, NewComment, NewNotification,
    RawComment, RawUser, UserId,
};

/// The remote system-of-record.
///
/// Row-level security, triggers maintaining `replies_count` and cascading
/// deletes all live behind this trait.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Aggregated procedure returning every comment of `entity` with its
    /// author nested, ordered by ascending creation date
    async fn rpc_comments_with_users(&self, entity: &EntityRef) -> Result<Vec<RawComment>, Error>;

    /// Plain table query for every comment of `entity`, ordered by ascending creation date
    async fn select_comments(&self, entity: &EntityRef) -> Result<Vec<RawComment>, Error>;

    async fn select_comment(
        &self,
        entity_type: EntityType,
        id: CommentId,
    ) -> Result<Option<RawComment>, Error>;

    async fn select_users(&self, ids: &[UserId]) -> Result<Vec<RawUser>, Error>;

    async fn select_users_by_name(&self, usernames: &[String]) -> Result<Vec<RawUser>, Error>;

    /// Among `comments`, those liked by `user`
    async fn select_liked(
        &self,
        entity_type: EntityType,
        user: UserId,
        comments: &[CommentId],
    ) -> Result<Vec<CommentId>, Error>;

    async fn entity_exists(&self, entity: &EntityRef) -> Result<bool, Error>;

    async fn insert_comment(&self, c: NewComment) -> Result<RawComment, Error>;

    /// Deletes comment `id` if it is owned by `author`, returning the number of deleted rows
    async fn delete_comment(
        &self,
        entity_type: EntityType,
        id: CommentId,
        author: UserId,
    ) -> Result<u64, Error>;

    async fn like_exists(&self, entity_type: EntityType, like: Like) -> Result<bool, Error>;

    async fn insert_like(&self, entity_type: EntityType, like: Like) -> Result<(), Error>;

    async fn delete_like(&self, entity_type: EntityType, like: Like) -> Result<(), Error>;

    /// Atomically adds `delta` to the counter, returning its new value
    async fn rpc_increment_counter(&self, target: CounterTarget, delta: i64)
        -> Result<i64, Error>;

    async fn read_counter(&self, target: CounterTarget) -> Result<i64, Error>;

    async fn write_counter(&self, target: CounterTarget, value: i64) -> Result<(), Error>;

    async fn insert_notification(&self, n: NewNotification) -> Result<(), Error>;
}
