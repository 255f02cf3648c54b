use crate::{CommentId, UserId};

/// Existence of this row in the like relation means `user_id` likes `comment_id`
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Like {
    pub comment_id: CommentId,
    pub user_id: UserId,
}
