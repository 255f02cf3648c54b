use crate::{CommentId, EntityRef, UserId};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Someone replied to one of `recipient`'s comments
    Reply,

    /// Someone mentioned `recipient` in a comment
    Mention,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct NewNotification {
    pub recipient: UserId,
    pub actor: UserId,
    pub kind: NotificationKind,
    pub entity: EntityRef,
    pub comment_id: CommentId,
}
