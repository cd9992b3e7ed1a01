//! Messaging domain models.

use serde::{Deserialize, Serialize};

/// A group conversation. Parent of memberships and messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub created_by: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    pub updated_at: i64,
}

/// Membership of an actor in a conversation. Also carries the actor's read
/// watermark for that conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub conversation_id: String,
    pub actor_id: String,
    pub joined_at: i64,
    /// Epoch millis of the newest message read; `0` means never read.
    #[serde(default)]
    pub last_read_at: i64,
    #[serde(default)]
    pub last_read_message_id: Option<String>,
    pub updated_at: i64,
}

impl Membership {
    /// Composite key used wherever a single string id is required.
    pub fn key(&self) -> String {
        membership_key(&self.conversation_id, &self.actor_id)
    }
}

pub fn membership_key(conversation_id: &str, actor_id: &str) -> String {
    format!("{}:{}", conversation_id, actor_id)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Poll,
    System,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub actor_id: String,
    pub content: String,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub is_ghost: bool,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

/// Input for a locally composed message. The id is generated on the device
/// so the row survives offline creation and doubles as the idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub id: Option<String>,
    pub conversation_id: String,
    pub actor_id: String,
    pub content: String,
    pub message_type: MessageType,
    pub parent_id: Option<String>,
    pub is_ghost: bool,
    pub category: Option<String>,
    pub image_url: Option<String>,
}

impl NewMessage {
    pub fn text(
        conversation_id: impl Into<String>,
        actor_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            conversation_id: conversation_id.into(),
            actor_id: actor_id.into(),
            content: content.into(),
            message_type: MessageType::Text,
            parent_id: None,
            is_ghost: false,
            category: None,
            image_url: None,
        }
    }

    pub fn into_message(self, id: String, now: i64) -> Message {
        Message {
            id,
            conversation_id: self.conversation_id,
            actor_id: self.actor_id,
            content: self.content,
            message_type: self.message_type,
            parent_id: self.parent_id,
            created_at: now,
            updated_at: now,
            is_ghost: self.is_ghost,
            category: self.category,
            image_url: self.image_url,
        }
    }
}

/// Predicate for message projections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageQuery {
    pub conversation_id: Option<String>,
    pub actor_id: Option<String>,
    /// Only messages created strictly after this instant.
    pub created_after: Option<i64>,
    /// Only messages created at or before this instant.
    pub created_until: Option<i64>,
    pub parent_id: Option<String>,
    pub limit: Option<i64>,
    /// Newest first when true.
    pub descending: bool,
}

impl MessageQuery {
    pub fn conversation(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: Some(conversation_id.into()),
            ..Default::default()
        }
    }
}

/// Delivery status shown next to an outgoing message, derived from outbox
/// membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadState {
    pub conversation_id: String,
    pub actor_id: String,
    pub last_read_at: i64,
    pub last_read_message_id: Option<String>,
}

impl From<Membership> for ReadState {
    fn from(value: Membership) -> Self {
        Self {
            conversation_id: value.conversation_id,
            actor_id: value.actor_id,
            last_read_at: value.last_read_at,
            last_read_message_id: value.last_read_message_id,
        }
    }
}

/// First unread message and the number of unread messages in a conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadBoundary {
    pub first_unread_id: Option<String>,
    pub unread_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCount {
    pub conversation_id: String,
    pub unread_count: i64,
}
