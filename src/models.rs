// Data model for the workshop chat platform.
// These shapes mirror the wire format used by both the REST API and the
// WebSocket envelopes, so everything derives serde with snake_case names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    WaitingClient,
    WaitingMechanic,
    Resolved,
    // Terminal, but conversations are never deleted client-side.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Image,
    File,
    System,
    Quote,
}

/// Delivery status of a message. The numeric order matters: a message's
/// status may only move forward (sent -> delivered -> read), never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sent = 0,
    Delivered = 1,
    Read = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    NewMessage,
    NewConversation,
    Mention,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: i64,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub user: UserRef,
    #[serde(default)]
    pub is_typing: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(default = "default_notify")]
    pub notifications_enabled: bool,
}

fn default_notify() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub url: String,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned, monotonically increasing. Ordering tie-break only.
    pub id: i64,
    /// Stable identity across REST and WebSocket delivery; the dedup key.
    pub uuid: Uuid,
    pub conversation: Uuid,
    pub sender: UserRef,
    pub content: String,
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentRef>,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Total order within a conversation: created_at first, server id as
    /// tie-break when timestamps collide.
    pub fn order_key(&self) -> (DateTime<Utc>, i64) {
        (self.created_at, self.id)
    }

    pub fn cmp_order(&self, other: &Message) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }
}

/// Compact message summary carried on a conversation (list views do not
/// need the full message).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSummary {
    pub uuid: Uuid,
    pub sender: UserRef,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub uuid: Uuid,
    pub participants: Vec<Participant>,
    pub subject: String,
    pub status: ConversationStatus,
    pub priority: Priority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessageSummary>,
    #[serde(default)]
    pub unread_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Case-insensitive substring match on subject and participant names,
    /// used by the client-side directory filter.
    pub fn matches_filter(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        if self.subject.to_lowercase().contains(&needle) {
            return true;
        }
        self.participants
            .iter()
            .any(|p| p.user.display_name.to_lowercase().contains(&needle))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub id: i64,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}
