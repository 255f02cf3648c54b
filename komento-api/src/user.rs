use crate::STUB_UUID;

use uuid::Uuid;

/// Avatar shown for users who never uploaded one
pub const DEFAULT_AVATAR: &str = "https://komento.invalid/static/default-avatar.png";

/// Display name used when the backend returned a user row without a username
pub const UNKNOWN_USERNAME: &str = "unknown";

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn stub() -> UserId {
        UserId(STUB_UUID)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub avatar: String,
}

impl User {
    /// Placeholder for an author whose user row could not be loaded
    pub fn unknown(id: UserId) -> User {
        User {
            id,
            username: String::from(UNKNOWN_USERNAME),
            avatar: String::from(DEFAULT_AVATAR),
        }
    }
}

/// User row as returned by the backend, before normalization
#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct RawUser {
    pub id: Option<Uuid>,
    pub username: Option<String>,
    #[serde(alias = "avatar_url")]
    pub avatar: Option<String>,
}

impl RawUser {
    /// Returns `None` if the row has no id, as nothing can be attached to it
    pub fn normalize(self) -> Option<User> {
        let id = UserId(self.id?);
        Some(User {
            id,
            username: self
                .username
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| String::from(UNKNOWN_USERNAME)),
            avatar: self
                .avatar
                .filter(|a| !a.is_empty())
                .unwrap_or_else(|| String::from(DEFAULT_AVATAR)),
        })
    }
}
