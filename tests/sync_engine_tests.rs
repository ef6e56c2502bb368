// Facade-level tests for the synchronization engine.
// Transport events and REST pages are injected directly, so every scenario
// here runs without a server and without real timers.

mod common;
use common::{conversation, drain, engine, message, setup_logging, test_config};

use mecachat::error::ChatError;
use mecachat::sync::transport::{InboundEnvelope, TypingStatusPayload};
use mecachat::sync::{ChatEvent, ReconnectPolicy, Scope, TransportChannel, TransportEvent};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

#[tokio::test]
async fn stale_fetch_for_previous_selection_is_discarded() {
    let (client, _events) = engine();
    let convo_a = Uuid::from_u128(0xA);
    let convo_b = Uuid::from_u128(0xB);

    // Select A (fetch #1), then B (fetch #2) before A's response lands.
    let seq_a = client.activate_conversation(convo_a).await;
    let seq_b = client.activate_conversation(convo_b).await;

    let applied = client
        .apply_message_page(convo_b, seq_b, vec![message(convo_b, 10, 100)])
        .await;
    assert!(applied);

    // A's late response must not corrupt B's window.
    let applied = client
        .apply_message_page(convo_a, seq_a, vec![message(convo_a, 99, 50)])
        .await;
    assert!(!applied);

    let messages = client.messages_snapshot().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].conversation, convo_b);
}

#[tokio::test]
async fn newer_fetch_for_same_conversation_wins() {
    let (client, _events) = engine();
    let convo = Uuid::from_u128(0xC);

    let seq_old = client.activate_conversation(convo).await;
    let seq_new = client.begin_message_fetch(convo).await;

    assert!(
        client
            .apply_message_page(convo, seq_new, vec![message(convo, 2, 200)])
            .await
    );
    // The older in-flight fetch resolves late and is dropped.
    assert!(
        !client
            .apply_message_page(convo, seq_old, vec![message(convo, 1, 100)])
            .await
    );

    let ids: Vec<i64> = client.messages_snapshot().await.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![2]);
}

#[tokio::test]
async fn gap_recovery_page_fills_in_missed_push() {
    let (client, _events) = engine();
    let convo = Uuid::from_u128(0xD);
    let scope = Scope::Conversation(convo);
    client.activate_conversation(convo).await;

    // m1 and m2 arrive over the socket before the drop.
    for id in [1, 2] {
        client
            .apply_envelope(scope, InboundEnvelope::Message(message(convo, id, id * 100)))
            .await;
    }

    // While disconnected the server recorded m3; the reconnect refetch
    // returns the full latest page, newest first.
    let seq = client.begin_message_fetch(convo).await;
    client
        .apply_message_page(
            convo,
            seq,
            vec![
                message(convo, 3, 300),
                message(convo, 2, 200),
                message(convo, 1, 100),
            ],
        )
        .await;

    let ids: Vec<i64> = client.messages_snapshot().await.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[tokio::test]
async fn pushes_and_pages_interleave_without_duplicates() {
    let (client, _events) = engine();
    let convo = Uuid::from_u128(0xE);
    let scope = Scope::Conversation(convo);
    let seq = client.activate_conversation(convo).await;

    // Push m3 first, then a page containing m1-m3, then a repeat push.
    client
        .apply_envelope(scope, InboundEnvelope::Message(message(convo, 3, 300)))
        .await;
    client
        .apply_message_page(
            convo,
            seq,
            vec![
                message(convo, 1, 100),
                message(convo, 2, 200),
                message(convo, 3, 300),
            ],
        )
        .await;
    client
        .apply_envelope(scope, InboundEnvelope::Message(message(convo, 3, 300)))
        .await;

    let ids: Vec<i64> = client.messages_snapshot().await.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[tokio::test]
async fn unread_counts_track_open_state() {
    let (client, mut events) = engine();
    let convo_a = Uuid::from_u128(1);
    let convo_b = Uuid::from_u128(2);
    let scope = Scope::Notifications;

    // Seed the directory through conversation_update pushes.
    client
        .apply_envelope(
            scope,
            InboundEnvelope::ConversationUpdate(conversation(1, "brakes")),
        )
        .await;
    client
        .apply_envelope(
            scope,
            InboundEnvelope::ConversationUpdate(conversation(2, "oil change")),
        )
        .await;

    client.activate_conversation(convo_a).await;
    drain(&mut events);

    // Push into the open conversation: unread stays 0.
    client
        .apply_envelope(
            Scope::Conversation(convo_a),
            InboundEnvelope::Message(message(convo_a, 1, 100)),
        )
        .await;

    // Pushes into the closed conversation: +1 each.
    for id in [2, 3] {
        client
            .apply_envelope(scope, InboundEnvelope::Message(message(convo_b, id, id * 100)))
            .await;
    }

    let snapshot = client.conversations_snapshot().await;
    let unread_a = snapshot.iter().find(|c| c.uuid == convo_a).unwrap().unread_count;
    let unread_b = snapshot.iter().find(|c| c.uuid == convo_b).unwrap().unread_count;
    assert_eq!(unread_a, 0);
    assert_eq!(unread_b, 2);

    // The conversation that last received a message is at the front.
    assert_eq!(snapshot[0].uuid, convo_b);
    assert!(snapshot[0].last_message.is_some());
}

#[tokio::test]
async fn auth_rejection_surfaces_exactly_one_session_expired() {
    let (client, mut events) = engine();

    client
        .apply_transport_event(TransportEvent::AuthExpired {
            scope: Scope::Notifications,
        })
        .await;
    client
        .apply_transport_event(TransportEvent::Closed {
            scope: Scope::Notifications,
        })
        .await;

    let expired = drain(&mut events)
        .iter()
        .filter(|e| matches!(e, ChatEvent::SessionExpired))
        .count();
    assert_eq!(expired, 1);
}

#[tokio::test]
async fn typing_pushes_update_participants_and_emit() {
    let (client, mut events) = engine();
    let convo = Uuid::from_u128(1);
    client
        .apply_envelope(
            Scope::Notifications,
            InboundEnvelope::ConversationUpdate(conversation(1, "brakes")),
        )
        .await;
    drain(&mut events);

    client
        .apply_envelope(
            Scope::Conversation(convo),
            InboundEnvelope::TypingStatus(TypingStatusPayload {
                conversation: convo,
                user_id: 1,
                is_typing: true,
            }),
        )
        .await;

    let snapshot = client.conversations_snapshot().await;
    assert!(snapshot[0].participants[0].is_typing);

    let saw_typing = drain(&mut events).iter().any(|e| {
        matches!(
            e,
            ChatEvent::Typing {
                is_typing: true,
                ..
            }
        )
    });
    assert!(saw_typing);
}

#[tokio::test]
async fn local_typing_requires_an_open_conversation() {
    let (client, _events) = engine();
    let result = client.typing_keystroke().await;
    assert!(matches!(result, Err(ChatError::NotConnected { .. })));
}

#[tokio::test]
async fn notifications_land_in_the_recent_buffer() {
    let (client, mut events) = engine();

    let notification = mecachat::models::NotificationEvent {
        id: 7,
        notification_type: mecachat::models::NotificationType::Mention,
        conversation: Some(Uuid::from_u128(1)),
        timestamp: chrono::Utc::now(),
    };
    client
        .apply_envelope(
            Scope::Notifications,
            InboundEnvelope::Notification(notification.clone()),
        )
        .await;

    let recent = client.recent_notifications().await;
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].id, 7);

    let delivered = drain(&mut events)
        .iter()
        .any(|e| matches!(e, ChatEvent::Notification(n) if n.id == 7));
    assert!(delivered);
}

#[tokio::test]
async fn server_error_envelopes_become_banner_errors() {
    let (client, mut events) = engine();

    client
        .apply_envelope(
            Scope::Notifications,
            InboundEnvelope::Error(mecachat::sync::transport::ErrorPayload {
                detail: "rate limited".into(),
            }),
        )
        .await;

    let saw_error = drain(&mut events)
        .iter()
        .any(|e| matches!(e, ChatEvent::Error(detail) if detail == "rate limited"));
    assert!(saw_error);
}

#[tokio::test]
async fn reconnect_attempts_stop_at_the_policy_budget() {
    setup_logging();
    let policy = ReconnectPolicy {
        max_attempts: 3,
        interval: Duration::from_millis(10),
    };
    let (events_tx, mut events_rx) = mpsc::channel(16);
    // Port 1 refuses connections, so every attempt fails immediately.
    let channel =
        TransportChannel::connect(&test_config(), Scope::Notifications, policy, events_tx)
            .expect("channel task should spawn");

    let mut reconnecting: u32 = 0;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .expect("channel should give up within the retry budget")
            .expect("events channel closed without a Closed event");
        match event {
            TransportEvent::Reconnecting { attempt, .. } => {
                reconnecting += 1;
                assert_eq!(attempt, reconnecting);
            }
            TransportEvent::Closed { .. } => break,
            other => panic!("unexpected transport event: {:?}", other),
        }
    }
    // One Reconnecting per attempt in the budget, then exactly one Closed.
    assert_eq!(reconnecting, policy.max_attempts);
    assert!(events_rx.try_recv().is_err());
    drop(channel);
}

#[tokio::test]
async fn deselect_clears_the_window() {
    let (client, _events) = engine();
    let convo = Uuid::from_u128(5);
    let seq = client.activate_conversation(convo).await;
    client
        .apply_message_page(convo, seq, vec![message(convo, 1, 100)])
        .await;
    assert_eq!(client.messages_snapshot().await.len(), 1);

    client.deselect_conversation().await;
    assert_eq!(client.active_conversation().await, None);
    assert!(client.messages_snapshot().await.is_empty());
}
