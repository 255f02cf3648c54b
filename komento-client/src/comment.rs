use crate::api::{self, CommentId, EntityRef, Mention, Time, User};

/// A comment as displayed, with its author resolved and its replies attached
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Comment {
    pub id: CommentId,
    pub entity: EntityRef,
    pub author: User,
    pub parent_id: Option<CommentId>,
    pub content: String,
    pub created_at: Time,
    pub likes_count: i64,
    pub replies_count: i64,

    /// Whether the current user likes this comment
    pub is_liked: bool,

    pub mentions: Vec<Mention>,

    /// Replies in chronological order, filled in by `build_tree`
    pub children: Vec<Comment>,
}

impl Comment {
    pub fn new(c: api::Comment, author: User, is_liked: bool) -> Comment {
        Comment {
            id: c.id,
            entity: c.entity,
            author,
            parent_id: c.parent_id,
            content: c.content,
            created_at: c.created_at,
            likes_count: c.likes_count,
            replies_count: c.replies_count,
            is_liked,
            mentions: c.mentions,
            children: Vec::new(),
        }
    }

    pub fn find_in<'a>(comments: &'a [Comment], id: &CommentId) -> Option<&'a Comment> {
        for c in comments {
            if c.id == *id {
                return Some(c);
            }
            if let Some(res) = Comment::find_in(&c.children, id) {
                return Some(res);
            }
        }
        None
    }

    pub fn find_in_mut<'a>(comments: &'a mut [Comment], id: &CommentId) -> Option<&'a mut Comment> {
        for c in comments.iter_mut() {
            if c.id == *id {
                return Some(c);
            }
            if let Some(res) = Comment::find_in_mut(&mut c.children, id) {
                return Some(res);
            }
        }
        None
    }

    /// Detaches comment `id` and its whole subtree
    pub fn remove_from(comments: &mut Vec<Comment>, id: &CommentId) -> Option<Comment> {
        if let Some(pos) = comments.iter().position(|c| c.id == *id) {
            return Some(comments.remove(pos));
        }
        for c in comments.iter_mut() {
            if let Some(res) = Comment::remove_from(&mut c.children, id) {
                return Some(res);
            }
        }
        None
    }

    /// Number of comments in the forest, replies included
    pub fn count_in(comments: &[Comment]) -> usize {
        comments
            .iter()
            .map(|c| 1 + Comment::count_in(&c.children))
            .sum()
    }
}

#[cfg(test)]
impl Comment {
    /// Comment `id` on the stub post, created `secs` seconds after the epoch
    pub fn stub(id: u128, parent: Option<u128>, secs: i64) -> Comment {
        use crate::api::{EntityId, Uuid};
        use chrono::TimeZone;
        Comment {
            id: CommentId(Uuid::from_u128(id)),
            entity: EntityRef::post(EntityId::stub()),
            author: User::unknown(crate::api::UserId::stub()),
            parent_id: parent.map(|p| CommentId(Uuid::from_u128(p))),
            content: format!("comment {id}"),
            created_at: chrono::Utc
                .timestamp_opt(secs, 0)
                .single()
                .expect("stub timestamp out of range"),
            likes_count: 0,
            replies_count: 0,
            is_liked: false,
            mentions: Vec::new(),
            children: Vec::new(),
        }
    }
}
