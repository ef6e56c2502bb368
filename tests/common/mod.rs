// Shared helpers for the synchronization engine integration tests.
// These tests drive the facade directly through injected transport events
// and fetched pages - no sockets, no live server.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use mecachat::config::ChatConfig;
use mecachat::models::*;
use mecachat::sync::{ChatClient, ChatEvent};

static INIT: std::sync::Once = std::sync::Once::new();

pub fn setup_logging() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Config pointing at a closed local port: REST calls fail fast, which is
/// what these tests want - the engine logic runs, the network does not.
pub fn test_config() -> ChatConfig {
    ChatConfig::new(
        "http://127.0.0.1:1/api/v1/chat",
        "ws://127.0.0.1:1",
        Some("test-token"),
    )
}

pub fn engine() -> (Arc<ChatClient>, mpsc::Receiver<ChatEvent>) {
    setup_logging();
    ChatClient::new(test_config()).expect("engine should build")
}

pub fn message(conversation: Uuid, id: i64, secs: i64) -> Message {
    Message {
        id,
        uuid: Uuid::from_u128(id as u128),
        conversation,
        sender: UserRef {
            id: 1,
            display_name: "Alice".into(),
        },
        content: format!("message {}", id),
        message_type: MessageType::Text,
        attachment: None,
        status: MessageStatus::Sent,
        created_at: Utc.timestamp_opt(secs, 0).unwrap(),
        edited_at: None,
    }
}

pub fn conversation(n: u128, subject: &str) -> Conversation {
    Conversation {
        uuid: Uuid::from_u128(n),
        participants: vec![Participant {
            user: UserRef {
                id: n as i64,
                display_name: format!("user-{}", n),
            },
            is_typing: false,
            last_seen_at: None,
            notifications_enabled: true,
        }],
        subject: subject.into(),
        status: ConversationStatus::Active,
        priority: Priority::Normal,
        last_message: None,
        unread_count: 0,
        created_at: Utc.timestamp_opt(10, 0).unwrap(),
        updated_at: Utc.timestamp_opt(10, 0).unwrap(),
    }
}

pub fn drain(rx: &mut mpsc::Receiver<ChatEvent>) -> Vec<ChatEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
