//! Chat entities and their broadcast declarations.

use parley_protocol::{Channel, EntityType};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::notify::{Broadcast, BroadcastTarget};

/// A tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: String,
    /// Home account. Further accounts come from memberships.
    pub account_id: String,
    pub display_name: String,
    pub is_admin: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Conversation {
    pub id: String,
    pub account_id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
    #[sqlx(skip)]
    pub participant_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::System => write!(f, "system"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub account_id: String,
    pub author_id: Option<String>,
    pub role: MessageRole,
    pub content: String,
    /// Still being appended to by a stream.
    pub streaming: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Global key/value setting. Not owned by any tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Setting {
    pub key: String,
    pub value: String,
    pub updated_at: String,
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct CreateConversationRequest {
    pub account_id: String,
    pub title: String,
    #[serde(default)]
    pub participant_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateConversationRequest {
    pub title: Option<String>,
    /// Replaces the participant list when present.
    pub participant_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostMessageRequest {
    pub content: String,
    /// Start a streamed assistant reply after storing the message.
    #[serde(default)]
    pub reply: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PostMessageResponse {
    pub message: Message,
    pub reply: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PutSettingRequest {
    pub value: String,
}

// ============================================================================
// Broadcast declarations
// ============================================================================

fn user_account(user: &User) -> Option<Channel> {
    Some(Channel::entity(EntityType::Account, &user.account_id))
}

fn conversation_account(conversation: &Conversation) -> Option<Channel> {
    Some(Channel::entity(EntityType::Account, &conversation.account_id))
}

fn conversation_participants(conversation: &Conversation) -> Vec<Channel> {
    conversation
        .participant_ids
        .iter()
        .map(|id| Channel::entity(EntityType::User, id))
        .collect()
}

fn message_conversation(message: &Message) -> Option<Channel> {
    Some(Channel::entity(
        EntityType::Conversation,
        &message.conversation_id,
    ))
}

impl Broadcast for Account {
    const ENTITY_TYPE: EntityType = EntityType::Account;
    const TARGETS: &'static [BroadcastTarget<Self>] =
        &[BroadcastTarget::Own, BroadcastTarget::Collection];

    fn entity_id(&self) -> &str {
        &self.id
    }
}

impl Broadcast for User {
    const ENTITY_TYPE: EntityType = EntityType::User;
    const TARGETS: &'static [BroadcastTarget<Self>] = &[
        BroadcastTarget::Own,
        BroadcastTarget::Collection,
        BroadcastTarget::ToOne(user_account),
    ];

    fn entity_id(&self) -> &str {
        &self.id
    }
}

impl Broadcast for Conversation {
    const ENTITY_TYPE: EntityType = EntityType::Conversation;
    const TARGETS: &'static [BroadcastTarget<Self>] = &[
        BroadcastTarget::Own,
        BroadcastTarget::Collection,
        BroadcastTarget::ToOne(conversation_account),
        BroadcastTarget::ToMany(conversation_participants),
    ];

    fn entity_id(&self) -> &str {
        &self.id
    }
}

impl Broadcast for Message {
    const ENTITY_TYPE: EntityType = EntityType::Message;
    const TARGETS: &'static [BroadcastTarget<Self>] = &[
        BroadcastTarget::Own,
        BroadcastTarget::ToOne(message_conversation),
    ];

    fn entity_id(&self) -> &str {
        &self.id
    }
}

impl Broadcast for Setting {
    const ENTITY_TYPE: EntityType = EntityType::Setting;
    const TARGETS: &'static [BroadcastTarget<Self>] =
        &[BroadcastTarget::Own, BroadcastTarget::Collection];

    fn entity_id(&self) -> &str {
        &self.key
    }
}
