// Notification aggregator: consumes the global notification stream into a
// bounded most-recent-first buffer, and caches the total unread count.
// REST is authoritative for the count - pushes only invalidate it, and a
// fixed polling interval backstops missed pushes entirely.

use std::collections::VecDeque;
use std::time::Duration;

use crate::models::{NotificationEvent, NotificationType};

pub const DEFAULT_BUFFER_CAP: usize = 50;
/// Polling is the guarantee, push is the optimization.
pub const UNREAD_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct NotificationAggregator {
    buffer: VecDeque<NotificationEvent>,
    cap: usize,
    unread_total: u32,
}

impl NotificationAggregator {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAP)
    }

    pub fn with_capacity(cap: usize) -> Self {
        NotificationAggregator {
            buffer: VecDeque::new(),
            cap: cap.max(1),
            unread_total: 0,
        }
    }

    /// Most-recent-first view of the buffer.
    pub fn recent(&self) -> impl Iterator<Item = &NotificationEvent> {
        self.buffer.iter()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn unread_total(&self) -> u32 {
        self.unread_total
    }

    /// Record a pushed notification. Returns true when the unread-count
    /// cache should be refetched from REST (a new_message arrived).
    pub fn record(&mut self, event: NotificationEvent) -> bool {
        let invalidates = event.notification_type == NotificationType::NewMessage;
        self.buffer.push_front(event);
        while self.buffer.len() > self.cap {
            // Oldest entries are evicted, never persisted.
            self.buffer.pop_back();
        }
        invalidates
    }

    /// Install a REST-fetched count; REST wins over any local guess.
    pub fn set_unread_total(&mut self, count: u32) {
        self.unread_total = count;
    }
}

impl Default for NotificationAggregator {
    fn default() -> Self {
        Self::new()
    }
}
