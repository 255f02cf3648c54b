use uuid::Uuid;

use crate::{ChannelTopic, STUB_UUID};

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Post,
    Reel,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Post => "post",
            EntityType::Reel => "reel",
        }
    }

    pub fn entity_table(&self) -> &'static str {
        match self {
            EntityType::Post => "posts",
            EntityType::Reel => "reels",
        }
    }

    pub fn comment_table(&self) -> &'static str {
        match self {
            EntityType::Post => "comments",
            EntityType::Reel => "reel_comments",
        }
    }

    pub fn like_table(&self) -> &'static str {
        match self {
            EntityType::Post => "comment_likes",
            EntityType::Reel => "reel_comment_likes",
        }
    }

    /// Column of the comment table referencing the parent entity
    pub fn parent_column(&self) -> &'static str {
        match self {
            EntityType::Post => "post_id",
            EntityType::Reel => "reel_id",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<EntityType, crate::Error> {
        match s {
            "post" => Ok(EntityType::Post),
            "reel" => Ok(EntityType::Reel),
            _ => Err(crate::Error::Unknown(format!("unknown entity type {s:?}"))),
        }
    }
}

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct EntityId(pub Uuid);

impl EntityId {
    pub fn stub() -> EntityId {
        EntityId(STUB_UUID)
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A post or reel that comments attach to
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
}

impl EntityRef {
    pub fn post(id: EntityId) -> EntityRef {
        EntityRef {
            entity_type: EntityType::Post,
            entity_id: id,
        }
    }

    pub fn reel(id: EntityId) -> EntityRef {
        EntityRef {
            entity_type: EntityType::Reel,
            entity_id: id,
        }
    }

    /// The change-event channel carrying every comment change for this entity
    pub fn comment_topic(&self) -> ChannelTopic {
        ChannelTopic {
            table: String::from(self.entity_type.comment_table()),
            filter: format!("{}=eq.{}", self.entity_type.parent_column(), self.entity_id),
        }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}
