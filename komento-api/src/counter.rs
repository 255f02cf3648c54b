use crate::{CommentId, EntityType};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterName {
    Likes,
    Replies,
}

impl CounterName {
    pub fn column(&self) -> &'static str {
        match self {
            CounterName::Likes => "likes_count",
            CounterName::Replies => "replies_count",
        }
    }
}

/// A counter column of one comment row
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CounterTarget {
    pub entity_type: EntityType,
    pub comment_id: CommentId,
    pub counter: CounterName,
}
