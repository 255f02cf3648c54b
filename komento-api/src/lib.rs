use chrono::Utc;

pub use uuid::{uuid, Uuid};
pub type Time = chrono::DateTime<Utc>;

pub const STUB_UUID: Uuid = uuid!("ffffffff-ffff-ffff-ffff-ffffffffffff");

/// Longest comment body the backend accepts, in chars
pub const MAX_COMMENT_LEN: usize = 2200;

mod backend;
pub use backend::Backend;

mod comment;
pub use comment::{Comment, CommentId, Mention, NewComment, RawComment};

mod counter;
pub use counter::{CounterName, CounterTarget};

mod entity;
pub use entity::{EntityId, EntityRef, EntityType};

mod error;
pub use error::Error;

mod feed;
pub use feed::{ChangeEvent, ChangeFeed, ChangeKind, ChannelTopic, FeedMessage, FeedReceiver};

mod like;
pub use like::Like;

mod notification;
pub use notification::{NewNotification, NotificationKind};

mod user;
pub use user::{RawUser, User, UserId, DEFAULT_AVATAR, UNKNOWN_USERNAME};

pub fn validate_string(s: &str) -> Result<(), Error> {
    match s.contains('\0') {
        true => Err(Error::NullByteInString(String::from(s))),
        false => Ok(()),
    }
}
