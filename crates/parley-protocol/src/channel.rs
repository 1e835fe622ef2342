//! Channel addressing.
//!
//! A channel is `"{EntityType}:{EntityId}"` for one entity or
//! `"{EntityType}:all"` for the collection of every entity of a type. Both
//! sides of the wire derive the string the same way, so it must match bit for
//! bit.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ts_rs::TS;

/// Reserved id segment addressing a whole collection.
pub const COLLECTION_ID: &str = "all";

/// Errors produced while parsing channel addresses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The type segment does not name a known entity type.
    #[error("unknown entity type: {0}")]
    UnknownEntityType(String),

    /// The channel string has no `:` separator.
    #[error("malformed channel: {0}")]
    Malformed(String),

    /// The id segment is empty.
    #[error("channel id must not be empty")]
    EmptyId,

    /// An entity id equal to the collection segment.
    #[error("entity id `all` is reserved for collection channels")]
    ReservedId,
}

/// Check that `id` can name a single entity.
///
/// `all` would render the same channel string as the collection, so it is
/// refused along with the empty id.
pub fn check_entity_id(id: &str) -> Result<(), ChannelError> {
    match id {
        "" => Err(ChannelError::EmptyId),
        COLLECTION_ID => Err(ChannelError::ReservedId),
        _ => Ok(()),
    }
}

/// Entity types that can be addressed by a channel.
///
/// The canonical name is the variant name, exactly as written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[ts(export)]
pub enum EntityType {
    Account,
    User,
    Conversation,
    Message,
    Setting,
}

impl EntityType {
    /// Every addressable entity type.
    pub const ALL: [EntityType; 5] = [
        EntityType::Account,
        EntityType::User,
        EntityType::Conversation,
        EntityType::Message,
        EntityType::Setting,
    ];

    /// Canonical name used in channel strings.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Account => "Account",
            EntityType::User => "User",
            EntityType::Conversation => "Conversation",
            EntityType::Message => "Message",
            EntityType::Setting => "Setting",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ChannelError::UnknownEntityType(s.to_string()))
    }
}

/// What a channel points at within its entity type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelScope {
    /// A single entity.
    Entity(String),
    /// Every entity of the type.
    All,
}

/// A channel address.
///
/// Serializes as its string form (`"Conversation:conv_abc"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Channel {
    entity_type: EntityType,
    scope: ChannelScope,
}

impl Channel {
    /// Channel of a single entity.
    ///
    /// The id is taken as is. Stored entities are checked with
    /// [`check_entity_id`] before they are written; use [`Channel::try_entity`]
    /// for ids from elsewhere.
    pub fn entity(entity_type: EntityType, id: impl Into<String>) -> Self {
        Self {
            entity_type,
            scope: ChannelScope::Entity(id.into()),
        }
    }

    pub fn try_entity(entity_type: EntityType, id: impl Into<String>) -> Result<Self, ChannelError> {
        let id = id.into();
        check_entity_id(&id)?;
        Ok(Self::entity(entity_type, id))
    }

    /// Channel of the whole collection of a type.
    pub fn collection(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            scope: ChannelScope::All,
        }
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    pub fn scope(&self) -> &ChannelScope {
        &self.scope
    }

    pub fn is_collection(&self) -> bool {
        matches!(self.scope, ChannelScope::All)
    }

    /// Entity id, or `None` for collection channels.
    pub fn entity_id(&self) -> Option<&str> {
        match &self.scope {
            ChannelScope::Entity(id) => Some(id),
            ChannelScope::All => None,
        }
    }

    /// Subscribe-request form of this channel.
    pub fn identifier(&self) -> ChannelIdentifier {
        ChannelIdentifier {
            entity_type: self.entity_type.as_str().to_string(),
            id: self.entity_id().unwrap_or(COLLECTION_ID).to_string(),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            ChannelScope::Entity(id) => write!(f, "{}:{}", self.entity_type, id),
            ChannelScope::All => write!(f, "{}:{}", self.entity_type, COLLECTION_ID),
        }
    }
}

impl FromStr for Channel {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (entity_type, id) = s
            .split_once(':')
            .ok_or_else(|| ChannelError::Malformed(s.to_string()))?;
        ChannelIdentifier {
            entity_type: entity_type.to_string(),
            id: id.to_string(),
        }
        .try_into()
    }
}

impl TryFrom<String> for Channel {
    type Error = ChannelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.to_string()
    }
}

/// Channel as it appears in subscribe requests: `{ "type": "User", "id": "all" }`.
///
/// Kept loosely typed so that a request naming an unknown type can still be
/// answered with a rejection for exactly that identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ChannelIdentifier {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub id: String,
}

impl ChannelIdentifier {
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }
}

impl TryFrom<ChannelIdentifier> for Channel {
    type Error = ChannelError;

    fn try_from(value: ChannelIdentifier) -> Result<Self, Self::Error> {
        let entity_type: EntityType = value.entity_type.parse()?;
        match value.id.as_str() {
            "" => Err(ChannelError::EmptyId),
            COLLECTION_ID => Ok(Channel::collection(entity_type)),
            _ => Ok(Channel::entity(entity_type, value.id)),
        }
    }
}

impl From<&Channel> for ChannelIdentifier {
    fn from(channel: &Channel) -> Self {
        channel.identifier()
    }
}

impl fmt::Display for ChannelIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_channel_format() {
        let channel = Channel::entity(EntityType::Conversation, "conv_5");
        assert_eq!(channel.to_string(), "Conversation:conv_5");
        assert_eq!(channel.entity_id(), Some("conv_5"));
        assert!(!channel.is_collection());
    }

    #[test]
    fn test_collection_channel_format() {
        let channel = Channel::collection(EntityType::User);
        assert_eq!(channel.to_string(), "User:all");
        assert!(channel.is_collection());
        assert_eq!(channel.entity_id(), None);
    }

    #[test]
    fn test_parse_is_case_sensitive() {
        assert!("User:all".parse::<Channel>().is_ok());
        assert_eq!(
            "user:all".parse::<Channel>(),
            Err(ChannelError::UnknownEntityType("user".to_string()))
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            "Conversation".parse::<Channel>(),
            Err(ChannelError::Malformed(_))
        ));
        assert_eq!("Message:".parse::<Channel>(), Err(ChannelError::EmptyId));
    }

    #[test]
    fn test_collection_segment_is_not_an_entity_id() {
        assert_eq!(check_entity_id("all"), Err(ChannelError::ReservedId));
        assert_eq!(check_entity_id(""), Err(ChannelError::EmptyId));
        assert!(check_entity_id("All").is_ok());
        assert_eq!(
            Channel::try_entity(EntityType::Setting, "all"),
            Err(ChannelError::ReservedId)
        );
        assert_eq!(
            Channel::try_entity(EntityType::Setting, "theme"),
            Ok(Channel::entity(EntityType::Setting, "theme"))
        );
        // The string form always parses as the collection.
        assert!("Setting:all".parse::<Channel>().unwrap().is_collection());
    }

    #[test]
    fn test_parse_keeps_colons_in_id() {
        let channel: Channel = "Setting:ui:theme".parse().unwrap();
        assert_eq!(channel.entity_type(), EntityType::Setting);
        assert_eq!(channel.entity_id(), Some("ui:theme"));
        assert_eq!(channel.to_string(), "Setting:ui:theme");
    }

    #[test]
    fn test_identifier_json_shape() {
        let json = serde_json::to_value(Channel::collection(EntityType::User).identifier()).unwrap();
        assert_eq!(json, serde_json::json!({"type": "User", "id": "all"}));

        let identifier: ChannelIdentifier =
            serde_json::from_str(r#"{"type":"Message","id":"msg_1"}"#).unwrap();
        let channel = Channel::try_from(identifier).unwrap();
        assert_eq!(channel, Channel::entity(EntityType::Message, "msg_1"));
    }

    #[test]
    fn test_channel_serializes_as_string() {
        let channel = Channel::entity(EntityType::Account, "acct_1");
        let json = serde_json::to_string(&channel).unwrap();
        assert_eq!(json, "\"Account:acct_1\"");
        let back: Channel = serde_json::from_str(&json).unwrap();
        assert_eq!(back, channel);
    }
}
