// Message store: the ordered, deduplicated message window for the active
// conversation. Two producers feed it - paginated REST fetches and single
// WebSocket pushes - and the merge must give the same result regardless of
// which side delivered a message first.
//
// Identity is the message `uuid`; order is (created_at, id) ascending. The
// window is re-sorted after every merge, which is fine at chat-window scale.

use log::{debug, warn};
use uuid::Uuid;

use crate::models::Message;

#[derive(Debug, Default)]
pub struct MessageStore {
    conversation: Option<Uuid>,
    messages: Vec<Message>,
}

/// Outcome of merging one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    /// Same uuid already present; merge is idempotent, not an error.
    Duplicate,
    /// Duplicate that carried a newer delivery status or edit.
    Updated,
    /// Message belongs to a different conversation than the window.
    WrongConversation,
}

impl MessageStore {
    pub fn new() -> Self {
        MessageStore::default()
    }

    /// Point the window at a conversation, discarding the previous one.
    pub fn reset(&mut self, conversation: Uuid) {
        self.conversation = Some(conversation);
        self.messages.clear();
    }

    pub fn clear(&mut self) {
        self.conversation = None;
        self.messages.clear();
    }

    pub fn conversation(&self) -> Option<Uuid> {
        self.conversation
    }

    /// Messages in (created_at, id) order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Merge a single message (the WebSocket push path).
    pub fn merge_one(&mut self, message: Message) -> MergeOutcome {
        let outcome = self.insert(message);
        if outcome == MergeOutcome::Inserted {
            self.messages.sort_by(|a, b| a.cmp_order(b));
        }
        outcome
    }

    /// Merge a page of messages (the REST path). Pages may arrive
    /// newest-first or oldest-first; order is restored after the merge
    /// either way. Returns how many messages were actually new.
    pub fn merge_page<I>(&mut self, page: I) -> usize
    where
        I: IntoIterator<Item = Message>,
    {
        let mut inserted = 0;
        for message in page {
            if self.insert(message) == MergeOutcome::Inserted {
                inserted += 1;
            }
        }
        if inserted > 0 {
            self.messages.sort_by(|a, b| a.cmp_order(b));
        }
        debug!(
            "Merged page: {} new, {} total in window",
            inserted,
            self.messages.len()
        );
        inserted
    }

    fn insert(&mut self, message: Message) -> MergeOutcome {
        match self.conversation {
            Some(conversation) if conversation == message.conversation => {}
            Some(_) => {
                warn!(
                    "Dropping message {} for conversation {} (window is {:?})",
                    message.uuid, message.conversation, self.conversation
                );
                return MergeOutcome::WrongConversation;
            }
            None => {
                // First message adopts the window.
                self.conversation = Some(message.conversation);
            }
        }

        if let Some(existing) = self.messages.iter_mut().find(|m| m.uuid == message.uuid) {
            let mut updated = false;
            // Status only moves forward; a stale REST page must not undo a
            // read receipt that arrived over the socket.
            if message.status > existing.status {
                existing.status = message.status;
                updated = true;
            }
            if message.edited_at > existing.edited_at {
                existing.edited_at = message.edited_at;
                existing.content = message.content;
                updated = true;
            }
            return if updated {
                MergeOutcome::Updated
            } else {
                MergeOutcome::Duplicate
            };
        }

        self.messages.push(message);
        MergeOutcome::Inserted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageStatus, MessageType, UserRef};
    use chrono::{TimeZone, Utc};

    fn convo() -> Uuid {
        Uuid::from_u128(1)
    }

    fn msg(id: i64, secs: i64, uuid: Uuid) -> Message {
        Message {
            id,
            uuid,
            conversation: convo(),
            sender: UserRef {
                id: 1,
                display_name: "Alice".into(),
            },
            content: format!("msg {}", id),
            message_type: MessageType::Text,
            attachment: None,
            status: MessageStatus::Sent,
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
            edited_at: None,
        }
    }

    fn uuids(store: &MessageStore) -> Vec<Uuid> {
        store.messages().iter().map(|m| m.uuid).collect()
    }

    #[test]
    fn duplicate_insert_is_a_noop() {
        let mut store = MessageStore::new();
        store.reset(convo());
        let m = msg(1, 100, Uuid::from_u128(10));

        assert_eq!(store.merge_one(m.clone()), MergeOutcome::Inserted);
        assert_eq!(store.merge_one(m), MergeOutcome::Duplicate);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn window_stays_sorted_by_created_at_then_id() {
        let mut store = MessageStore::new();
        store.reset(convo());
        store.merge_one(msg(5, 300, Uuid::from_u128(5)));
        store.merge_one(msg(2, 100, Uuid::from_u128(2)));
        // Same timestamp as id 5: id is the tie-break.
        store.merge_one(msg(4, 300, Uuid::from_u128(4)));

        let ids: Vec<i64> = store.messages().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![2, 4, 5]);
    }

    #[test]
    fn page_then_push_equals_push_then_page() {
        let messages: Vec<Message> = (0..6)
            .map(|i| msg(i, 100 + i, Uuid::from_u128(100 + i as u128)))
            .collect();
        // The REST page arrives newest-first, as history endpoints do.
        let mut page: Vec<Message> = messages[..4].to_vec();
        page.reverse();
        let pushes: Vec<Message> = messages[2..].to_vec();

        let mut rest_first = MessageStore::new();
        rest_first.reset(convo());
        rest_first.merge_page(page.clone());
        for push in &pushes {
            rest_first.merge_one(push.clone());
        }

        let mut push_first = MessageStore::new();
        push_first.reset(convo());
        for push in &pushes {
            push_first.merge_one(push.clone());
        }
        push_first.merge_page(page);

        assert_eq!(uuids(&rest_first), uuids(&push_first));
        assert_eq!(rest_first.len(), 6);
    }

    #[test]
    fn page_merge_counts_only_new_messages() {
        let mut store = MessageStore::new();
        store.reset(convo());
        store.merge_one(msg(1, 100, Uuid::from_u128(1)));

        let inserted = store.merge_page(vec![
            msg(1, 100, Uuid::from_u128(1)),
            msg(2, 200, Uuid::from_u128(2)),
            msg(3, 300, Uuid::from_u128(3)),
        ]);
        assert_eq!(inserted, 2);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn status_upgrades_are_monotonic() {
        let mut store = MessageStore::new();
        store.reset(convo());
        let uuid = Uuid::from_u128(9);

        let mut read = msg(1, 100, uuid);
        read.status = MessageStatus::Read;
        store.merge_one(read);

        // A stale page row with status=sent must not downgrade.
        assert_eq!(store.merge_one(msg(1, 100, uuid)), MergeOutcome::Duplicate);
        assert_eq!(store.messages()[0].status, MessageStatus::Read);

        let mut delivered = msg(1, 100, uuid);
        delivered.status = MessageStatus::Delivered;
        assert_eq!(store.merge_one(delivered), MergeOutcome::Duplicate);
        assert_eq!(store.messages()[0].status, MessageStatus::Read);
    }

    #[test]
    fn edits_replace_content() {
        let mut store = MessageStore::new();
        store.reset(convo());
        let uuid = Uuid::from_u128(3);
        store.merge_one(msg(1, 100, uuid));

        let mut edited = msg(1, 100, uuid);
        edited.content = "corrected quote".into();
        edited.edited_at = Some(Utc.timestamp_opt(150, 0).unwrap());
        assert_eq!(store.merge_one(edited), MergeOutcome::Updated);
        assert_eq!(store.messages()[0].content, "corrected quote");
    }

    #[test]
    fn messages_for_other_conversations_are_dropped() {
        let mut store = MessageStore::new();
        store.reset(convo());
        let mut foreign = msg(1, 100, Uuid::from_u128(50));
        foreign.conversation = Uuid::from_u128(99);

        assert_eq!(store.merge_one(foreign), MergeOutcome::WrongConversation);
        assert!(store.is_empty());
    }

    #[test]
    fn gap_recovery_backfills_missed_pushes() {
        let mut store = MessageStore::new();
        store.reset(convo());
        // Client saw m1 and m2 before the drop.
        store.merge_one(msg(1, 100, Uuid::from_u128(1)));
        store.merge_one(msg(2, 200, Uuid::from_u128(2)));

        // While disconnected the server recorded m3; the reconnect refetch
        // returns the latest page, newest first.
        let refetched = vec![
            msg(3, 300, Uuid::from_u128(3)),
            msg(2, 200, Uuid::from_u128(2)),
            msg(1, 100, Uuid::from_u128(1)),
        ];
        let inserted = store.merge_page(refetched);

        assert_eq!(inserted, 1);
        let ids: Vec<i64> = store.messages().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
