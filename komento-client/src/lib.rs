mod cache;
pub use cache::{cache_key, CacheEntry, CommentCache, FileStore, KvStore, MemoryStore};

mod comment;
pub use comment::Comment;

mod config;
pub use config::SyncConfig;

mod error;
pub use error::{MutationError, Operation};

mod gateway;
pub use gateway::Gateway;

mod listener;
pub use listener::{ChangeCallback, ChannelRegistry, ListenerState, Subscription};

mod mention;
pub use mention::extract_mentions;

mod mutation;
pub use mutation::{MutationId, MutationKind, MutationState, Overlay, PendingMutation, TurnQueue};

mod session;
pub use session::{Session, StaticSession};

mod store;
pub use store::{CommentFeed, CommentStore, Liked};

mod sync;
pub use sync::{FeedState, SyncOutcome, SyncReason};

mod tree;
pub use tree::{build_tree, parent_map};

mod tests;

pub mod api {
    pub use komento_api::*;
}
