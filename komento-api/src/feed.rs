use async_trait::async_trait;
use futures::channel::mpsc;
use uuid::Uuid;

use crate::Error;

/// Rows of `table` matching `filter` (PostgREST syntax, eg. `post_id=eq.<uuid>`)
#[derive(Clone, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ChannelTopic {
    pub table: String,
    pub filter: String,
}

impl ChannelTopic {
    /// Whether a change to a row of `table` whose `column` is `value` is on this topic
    pub fn matches(&self, table: &str, column: &str, value: &Uuid) -> bool {
        self.table == table && self.filter == format!("{column}=eq.{value}")
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Notification that some row changed; it does not carry the new data
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub record_id: Option<Uuid>,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum FeedMessage {
    /// The backend acknowledged the subscription
    Subscribed,
    Change(ChangeEvent),
    /// The channel failed; no more messages will follow
    Error(String),
}

pub type FeedReceiver = mpsc::UnboundedReceiver<FeedMessage>;

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Opens a push channel for `topic`. Dropping the receiver closes it.
    async fn open_channel(&self, topic: ChannelTopic) -> Result<FeedReceiver, Error>;
}
