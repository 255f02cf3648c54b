use uuid::Uuid;

use crate::{EntityRef, Error, RawUser, Time, UserId, MAX_COMMENT_LEN, STUB_UUID};

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct CommentId(pub Uuid);

impl CommentId {
    pub fn stub() -> CommentId {
        CommentId(STUB_UUID)
    }
}

impl std::fmt::Display for CommentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Mention {
    pub user_id: UserId,
    pub username: String,
}

/// A comment row, normalized
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Comment {
    pub id: CommentId,
    pub entity: EntityRef,
    pub author_id: UserId,

    /// `None` for top-level comments
    pub parent_id: Option<CommentId>,

    pub content: String,
    pub created_at: Time,
    pub likes_count: i64,
    pub replies_count: i64,
    pub mentions: Vec<Mention>,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct NewComment {
    pub id: CommentId,
    pub entity: EntityRef,
    pub author_id: UserId,
    pub parent_id: Option<CommentId>,
    pub content: String,
    pub mentions: Vec<Mention>,
    pub created_at: Time,
}

impl NewComment {
    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_string(&self.content)?;
        if self.content.trim().is_empty() {
            return Err(Error::InvalidContent(String::from("comment is empty")));
        }
        let len = self.content.chars().count();
        if len > MAX_COMMENT_LEN {
            return Err(Error::InvalidContent(format!(
                "comment is {len} chars long, the limit is {MAX_COMMENT_LEN}"
            )));
        }
        Ok(())
    }

    /// The row as it will exist right after insertion, before any trigger runs
    pub fn to_comment(&self) -> Comment {
        Comment {
            id: self.id,
            entity: self.entity,
            author_id: self.author_id,
            parent_id: self.parent_id,
            content: self.content.clone(),
            created_at: self.created_at,
            likes_count: 0,
            replies_count: 0,
            mentions: self.mentions.clone(),
        }
    }
}

/// Comment row as returned by the backend, either from the plain table or
/// from the aggregated procedure (which also nests the author)
#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct RawComment {
    pub id: Option<Uuid>,
    #[serde(alias = "post_id", alias = "reel_id")]
    pub entity_id: Option<Uuid>,
    #[serde(alias = "user_id")]
    pub author_id: Option<Uuid>,
    #[serde(alias = "parent_comment_id")]
    pub parent_id: Option<Uuid>,
    pub content: Option<String>,
    pub created_at: Option<Time>,
    pub likes_count: Option<i64>,
    pub replies_count: Option<i64>,
    pub mentions: Option<Vec<Mention>>,
    #[serde(alias = "author")]
    pub user: Option<RawUser>,
}

impl RawComment {
    /// Maps a backend row into a `Comment` for `entity`, along with the nested
    /// author if the row carried one.
    ///
    /// Rows without an id, author or creation date cannot be placed anywhere
    /// and are rejected. Rows explicitly attached to another entity too.
    pub fn normalize(self, entity: EntityRef) -> Result<(Comment, Option<RawUser>), Error> {
        let id = self
            .id
            .ok_or_else(|| Error::Unknown(String::from("comment row without id")))?;
        if let Some(e) = self.entity_id {
            if e != entity.entity_id.0 {
                return Err(Error::Unknown(format!(
                    "comment {id} belongs to {e}, not to {entity}"
                )));
            }
        }
        let author_id = self
            .author_id
            .or_else(|| self.user.as_ref().and_then(|u| u.id))
            .ok_or_else(|| Error::Unknown(format!("comment {id} has no author")))?;
        let created_at = self
            .created_at
            .ok_or_else(|| Error::Unknown(format!("comment {id} has no creation date")))?;
        let comment = Comment {
            id: CommentId(id),
            entity,
            author_id: UserId(author_id),
            parent_id: self.parent_id.map(CommentId),
            content: self.content.unwrap_or_default(),
            created_at,
            likes_count: self.likes_count.unwrap_or(0).max(0),
            replies_count: self.replies_count.unwrap_or(0).max(0),
            mentions: self.mentions.unwrap_or_default(),
        };
        Ok((comment, self.user))
    }
}

impl From<Comment> for RawComment {
    fn from(c: Comment) -> RawComment {
        RawComment {
            id: Some(c.id.0),
            entity_id: Some(c.entity.entity_id.0),
            author_id: Some(c.author_id.0),
            parent_id: c.parent_id.map(|p| p.0),
            content: Some(c.content),
            created_at: Some(c.created_at),
            likes_count: Some(c.likes_count),
            replies_count: Some(c.replies_count),
            mentions: Some(c.mentions),
            user: None,
        }
    }
}
