// Conversation directory: the paginated, searchable conversation list plus
// per-conversation unread counters. The list is kept most-recent-first;
// push events update entries in place and never delete them (a closed
// conversation stays visible for history).

use log::debug;
use uuid::Uuid;

use crate::models::{Conversation, MessageSummary};

#[derive(Debug, Default)]
pub struct ConversationDirectory {
    conversations: Vec<Conversation>,
}

impl ConversationDirectory {
    pub fn new() -> Self {
        ConversationDirectory::default()
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn get(&self, uuid: Uuid) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.uuid == uuid)
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// Apply a fetched page. Page 1 replaces the list; later pages extend
    /// it, skipping anything already present.
    pub fn apply_page(&mut self, page_number: usize, results: Vec<Conversation>) {
        if page_number <= 1 {
            self.conversations = results;
            return;
        }
        for conversation in results {
            if self.get(conversation.uuid).is_none() {
                self.conversations.push(conversation);
            }
        }
    }

    /// Insert or update from a push event. Updated entries keep their local
    /// unread count (the server's conversation_update payload does not know
    /// what this client has read since).
    pub fn upsert(&mut self, conversation: Conversation) {
        if let Some(existing) = self
            .conversations
            .iter_mut()
            .find(|c| c.uuid == conversation.uuid)
        {
            let unread = existing.unread_count;
            *existing = conversation;
            existing.unread_count = unread;
        } else {
            self.conversations.insert(0, conversation);
        }
    }

    /// A conversation we just created goes straight to the front - no
    /// refetch needed.
    pub fn unshift(&mut self, conversation: Conversation) {
        debug!("New conversation {} ('{}')", conversation.uuid, conversation.subject);
        self.conversations.retain(|c| c.uuid != conversation.uuid);
        self.conversations.insert(0, conversation);
    }

    /// Record a new message: update the summary and move the conversation
    /// to the front. Returns false when the conversation is unknown (the
    /// caller should refetch the list).
    pub fn record_message(&mut self, conversation: Uuid, summary: MessageSummary) -> bool {
        let Some(position) = self
            .conversations
            .iter()
            .position(|c| c.uuid == conversation)
        else {
            return false;
        };
        let mut entry = self.conversations.remove(position);
        entry.updated_at = summary.created_at;
        entry.last_message = Some(summary);
        self.conversations.insert(0, entry);
        true
    }

    /// Increment the unread counter, returning the new count.
    pub fn increment_unread(&mut self, conversation: Uuid) -> Option<u32> {
        let entry = self
            .conversations
            .iter_mut()
            .find(|c| c.uuid == conversation)?;
        entry.unread_count += 1;
        Some(entry.unread_count)
    }

    /// Zero the unread counter (the open-conversation lockstep), returning
    /// the count that was cleared.
    pub fn reset_unread(&mut self, conversation: Uuid) -> Option<u32> {
        let entry = self
            .conversations
            .iter_mut()
            .find(|c| c.uuid == conversation)?;
        let cleared = entry.unread_count;
        entry.unread_count = 0;
        Some(cleared)
    }

    pub fn set_participant_typing(&mut self, conversation: Uuid, user_id: i64, is_typing: bool) {
        if let Some(entry) = self
            .conversations
            .iter_mut()
            .find(|c| c.uuid == conversation)
        {
            for participant in &mut entry.participants {
                if participant.user.id == user_id {
                    participant.is_typing = is_typing;
                }
            }
        }
    }

    /// Client-side filter over the already-fetched page: substring match on
    /// subject and participant names. Never hits the server.
    pub fn filter(&self, needle: &str) -> Vec<&Conversation> {
        let needle = needle.trim();
        if needle.is_empty() {
            return self.conversations.iter().collect();
        }
        self.conversations
            .iter()
            .filter(|c| c.matches_filter(needle))
            .collect()
    }
}
