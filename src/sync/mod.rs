// Synchronization facade for the workshop chat engine.
// This module is the single entry point UI code talks to: it composes the
// transport channels, message store, conversation directory, typing
// coordinator and notification aggregator, and owns the cross-component
// invariants (selecting a conversation marks it read, reconnects trigger a
// gap-recovery refetch, stale fetches are discarded).

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub mod directory;
pub mod notifications;
pub mod store;
pub mod transport;
pub mod typing;

pub use directory::ConversationDirectory;
pub use notifications::NotificationAggregator;
pub use store::{MergeOutcome, MessageStore};
pub use transport::{
    ChannelStatus, ConnectionState, InboundEnvelope, OutboundEnvelope, ReconnectPolicy, Scope,
    TransportChannel, TransportEvent,
};
pub use typing::{TypingCoordinator, TypingSignal};

use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::models::{Conversation, Message, MessageSummary, NotificationEvent};
use crate::rest::{NewConversation, OutgoingMessage, Page, PageQuery, RestClient};

/// How often the typing driver checks the coordinator's timers.
const TYPING_TICK: Duration = Duration::from_millis(200);

/// Derived state changes pushed to subscribers. UI layers hold read-only
/// snapshots and react to these; all mutations route back through the
/// facade's operations.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    ConversationsUpdated,
    MessagesUpdated { conversation: Uuid },
    Notification(NotificationEvent),
    UnreadTotal(u32),
    Typing {
        conversation: Uuid,
        user_id: i64,
        is_typing: bool,
    },
    Connection { scope: Scope, state: ConnectionState },
    /// Token rejected (REST 401 or WS close 4001): redirect to login.
    SessionExpired,
    /// Connection-level error for the dismissible banner.
    Error(String),
}

/// Canonical collections. Only the facade mutates these; everything else
/// sees snapshots.
struct EngineState {
    store: MessageStore,
    directory: ConversationDirectory,
    notifications: NotificationAggregator,
    typing: TypingCoordinator,
    active: Option<Uuid>,
    /// Monotonic fetch sequence per conversation; guards against a stale
    /// REST response landing after a newer one.
    fetch_seq: HashMap<Uuid, u64>,
    last_error: Option<String>,
}

impl EngineState {
    fn new() -> Self {
        EngineState {
            store: MessageStore::new(),
            directory: ConversationDirectory::new(),
            notifications: NotificationAggregator::new(),
            typing: TypingCoordinator::new(),
            active: None,
            fetch_seq: HashMap::new(),
            last_error: None,
        }
    }
}

pub struct ChatClient {
    rest: Arc<RestClient>,
    config: ChatConfig,
    policy: ReconnectPolicy,
    state: Arc<TokioMutex<EngineState>>,
    events_tx: mpsc::Sender<ChatEvent>,
    transport_tx: mpsc::Sender<TransportEvent>,
    notif_channel: TokioMutex<Option<TransportChannel>>,
    convo_channel: TokioMutex<Option<TransportChannel>>,
    typing_task: TokioMutex<Option<JoinHandle<()>>>,
    poll_task: TokioMutex<Option<JoinHandle<()>>>,
}

impl ChatClient {
    /// Build the engine. Returns the client and the event receiver the UI
    /// subscribes to. No connection is made yet.
    pub fn new(config: ChatConfig) -> Result<(Arc<Self>, mpsc::Receiver<ChatEvent>), ChatError> {
        Self::with_policy(config, ReconnectPolicy::default())
    }

    pub fn with_policy(
        config: ChatConfig,
        policy: ReconnectPolicy,
    ) -> Result<(Arc<Self>, mpsc::Receiver<ChatEvent>), ChatError> {
        let rest = Arc::new(RestClient::new(&config)?);
        let (events_tx, events_rx) = mpsc::channel(256);
        let (transport_tx, transport_rx) = mpsc::channel(256);

        let client = Arc::new(ChatClient {
            rest,
            config,
            policy,
            state: Arc::new(TokioMutex::new(EngineState::new())),
            events_tx,
            transport_tx,
            notif_channel: TokioMutex::new(None),
            convo_channel: TokioMutex::new(None),
            typing_task: TokioMutex::new(None),
            poll_task: TokioMutex::new(None),
        });

        // Event pump: single writer for the canonical collections. Holds a
        // weak reference so a dropped client tears the pump down instead of
        // the pump keeping the client alive.
        let weak = Arc::downgrade(&client);
        tokio::spawn(async move {
            let mut transport_rx = transport_rx;
            while let Some(event) = transport_rx.recv().await {
                match weak.upgrade() {
                    Some(client) => client.apply_transport_event(event).await,
                    None => break,
                }
            }
            debug!("Transport event pump finished");
        });

        Ok((client, events_rx))
    }

    // ---- connection lifecycle -------------------------------------------

    /// Connect the global notifications scope and start the unread-count
    /// poll loop.
    pub async fn connect_notifications(&self) -> Result<(), ChatError> {
        let channel = TransportChannel::connect(
            &self.config,
            Scope::Notifications,
            self.policy,
            self.transport_tx.clone(),
        )?;
        *self.notif_channel.lock().await = Some(channel);

        let rest = self.rest.clone();
        let state = self.state.clone();
        let events_tx = self.events_tx.clone();
        let mut task_guard = self.poll_task.lock().await;
        if let Some(task) = task_guard.take() {
            task.abort();
        }
        *task_guard = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(notifications::UNREAD_POLL_INTERVAL).await;
                match rest.unread_count().await {
                    Ok(response) => {
                        state.lock().await.notifications.set_unread_total(response.unread_count);
                        let _ = events_tx
                            .send(ChatEvent::UnreadTotal(response.unread_count))
                            .await;
                    }
                    Err(e) if e.is_session_expired() => {
                        let _ = events_tx.send(ChatEvent::SessionExpired).await;
                        break;
                    }
                    Err(e) => warn!("Unread poll failed: {}", e),
                }
            }
        }));

        info!("Notifications scope connected");
        Ok(())
    }

    /// Tear down every connection and timer. Mandatory before dropping the
    /// engine from a live UI; leaking the timers would mean callbacks into
    /// state that no longer exists.
    pub async fn disconnect(&self) {
        self.deselect_conversation().await;
        if let Some(channel) = self.notif_channel.lock().await.take() {
            channel.close();
        }
        if let Some(task) = self.poll_task.lock().await.take() {
            task.abort();
        }
        info!("Disconnected");
    }

    // ---- conversation directory -----------------------------------------

    /// Fetch a page of the conversation list.
    pub async fn refresh_conversations(&self, query: &PageQuery) -> Result<(), ChatError> {
        let page = self.rest.list_conversations(query).await?;
        let mut state = self.state.lock().await;
        state.directory.apply_page(query.page, page.results);
        drop(state);
        self.emit(ChatEvent::ConversationsUpdated).await;
        Ok(())
    }

    /// Server-side search. For per-keystroke filtering use
    /// `filter_conversations`, which never leaves the client.
    pub async fn search_conversations(
        &self,
        q: &str,
        query: &PageQuery,
    ) -> Result<Page<Conversation>, ChatError> {
        self.rest.search_conversations(q, query).await
    }

    pub async fn filter_conversations(&self, needle: &str) -> Vec<Conversation> {
        let state = self.state.lock().await;
        state
            .directory
            .filter(needle)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn create_conversation(
        &self,
        new: &NewConversation,
    ) -> Result<Conversation, ChatError> {
        let conversation = self.rest.create_conversation(new).await?;
        self.state
            .lock()
            .await
            .directory
            .unshift(conversation.clone());
        self.emit(ChatEvent::ConversationsUpdated).await;
        Ok(conversation)
    }

    // ---- selection state machine ----------------------------------------

    /// Select a conversation: subscribe its scope, fetch the latest message
    /// page, mark it read, then accept pushes. A fetch failure is surfaced
    /// (the UI retries) rather than leaving a silently-empty view.
    pub async fn select_conversation(&self, conversation: Uuid) -> Result<(), ChatError> {
        let seq = self.activate_conversation(conversation).await;

        let channel = TransportChannel::connect(
            &self.config,
            Scope::Conversation(conversation),
            self.policy,
            self.transport_tx.clone(),
        )?;
        let sender = channel.sender();
        *self.convo_channel.lock().await = Some(channel);

        // Typing driver: ticks the coordinator's timers and emits the
        // debounced stop signal. Aborted on deselect.
        let state = self.state.clone();
        let mut task_guard = self.typing_task.lock().await;
        *task_guard = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(TYPING_TICK).await;
                let signal = {
                    let mut state = state.lock().await;
                    if state.active != Some(conversation) {
                        break;
                    }
                    state.typing.poll(Instant::now())
                };
                if let Some(TypingSignal::Stopped) = signal {
                    if let Err(e) = sender.send(OutboundEnvelope::TypingStatus { is_typing: false })
                    {
                        debug!("Typing stop not sent: {}", e);
                    }
                }
            }
        }));
        drop(task_guard);

        if let Err(e) = self.fetch_messages(conversation, seq).await {
            let mut state = self.state.lock().await;
            state.last_error = Some(e.to_string());
            drop(state);
            self.emit(ChatEvent::Error(format!(
                "Failed to load messages: {}",
                e
            )))
            .await;
            return Err(e);
        }

        // Opening a conversation marks it read; read-state and open-state
        // stay in lockstep.
        match self.rest.mark_read(conversation).await {
            Ok(marked) => {
                debug!(
                    "Marked {} messages read in {}",
                    marked.marked_count, conversation
                );
                self.state
                    .lock()
                    .await
                    .directory
                    .reset_unread(conversation);
                self.emit(ChatEvent::ConversationsUpdated).await;
            }
            Err(e) if e.is_session_expired() => {
                self.emit(ChatEvent::SessionExpired).await;
                return Err(e);
            }
            Err(e) => warn!("mark_read for {} failed: {}", conversation, e),
        }

        info!("Selected conversation {}", conversation);
        Ok(())
    }

    /// Point the engine at a conversation without touching the network:
    /// flushes the previous selection, resets the message window and issues
    /// the fetch sequence number the subsequent page fetch must present.
    pub async fn activate_conversation(&self, conversation: Uuid) -> u64 {
        self.deselect_conversation().await;

        let mut state = self.state.lock().await;
        state.active = Some(conversation);
        state.store.reset(conversation);
        state.last_error = None;
        let seq = state.fetch_seq.entry(conversation).or_insert(0);
        *seq += 1;
        *seq
    }

    /// Deselect: flush typing before the transport handle is released, stop
    /// the timers, close the scope.
    pub async fn deselect_conversation(&self) {
        let (previous, flush) = {
            let mut state = self.state.lock().await;
            let flush = state.typing.flush();
            (state.active.take(), flush)
        };

        if let Some(task) = self.typing_task.lock().await.take() {
            task.abort();
        }

        let mut channel_guard = self.convo_channel.lock().await;
        if let Some(channel) = channel_guard.take() {
            if flush == Some(TypingSignal::Stopped) {
                // Do not leak a stuck "typing" state to peers.
                if let Err(e) = channel.send(OutboundEnvelope::TypingStatus { is_typing: false }) {
                    debug!("Typing flush not sent: {}", e);
                }
            }
            channel.close();
        }
        drop(channel_guard);

        if let Some(previous) = previous {
            self.state.lock().await.store.clear();
            debug!("Deselected conversation {}", previous);
        }
    }

    // ---- message fetch and merge ----------------------------------------

    /// Issue a new fetch sequence number for a conversation. The matching
    /// `apply_message_page` call only lands if no newer fetch was issued in
    /// between.
    pub async fn begin_message_fetch(&self, conversation: Uuid) -> u64 {
        let mut state = self.state.lock().await;
        let seq = state.fetch_seq.entry(conversation).or_insert(0);
        *seq += 1;
        *seq
    }

    /// Merge a fetched page into the window. Returns false when the page was
    /// stale (a newer fetch was issued, or the conversation is no longer
    /// active) and was discarded.
    pub async fn apply_message_page(
        &self,
        conversation: Uuid,
        seq: u64,
        messages: Vec<Message>,
    ) -> bool {
        let applied = {
            let mut state = self.state.lock().await;
            if state.active != Some(conversation) {
                debug!(
                    "Discarding fetch for {} - no longer the active conversation",
                    conversation
                );
                false
            } else if state.fetch_seq.get(&conversation) != Some(&seq) {
                debug!(
                    "Discarding stale fetch #{} for {} (newer fetch in flight)",
                    seq, conversation
                );
                false
            } else {
                state.store.merge_page(messages);
                true
            }
        };
        if applied {
            self.emit(ChatEvent::MessagesUpdated { conversation }).await;
        }
        applied
    }

    async fn fetch_messages(&self, conversation: Uuid, seq: u64) -> Result<(), ChatError> {
        let page = self
            .rest
            .list_messages(conversation, &PageQuery::new())
            .await?;
        self.apply_message_page(conversation, seq, page.results)
            .await;
        Ok(())
    }

    /// Gap recovery: after a reconnect the socket cannot replay what it
    /// missed, so the latest REST page is re-fetched and re-merged.
    async fn recover_gap(&self, conversation: Uuid) {
        info!("Gap recovery for {}", conversation);
        let seq = self.begin_message_fetch(conversation).await;
        if let Err(e) = self.fetch_messages(conversation, seq).await {
            warn!("Gap recovery fetch failed for {}: {}", conversation, e);
            self.emit(ChatEvent::Error(format!("Failed to catch up: {}", e)))
                .await;
        }
    }

    // ---- sending --------------------------------------------------------

    /// Send a message via REST. There is no optimistic local echo: the
    /// message appears when the REST response (or the WebSocket echo,
    /// whichever is first) is merged, and a failed send leaves the store
    /// untouched.
    pub async fn send_message(&self, outgoing: &OutgoingMessage) -> Result<Message, ChatError> {
        let conversation = {
            let state = self.state.lock().await;
            state.active.ok_or(ChatError::NotConnected {
                scope: "conversation".into(),
            })?
        };

        let message = self.rest.send_message(conversation, outgoing).await?;
        let merged = {
            let mut state = self.state.lock().await;
            state.store.merge_one(message.clone())
        };
        if merged == MergeOutcome::Inserted {
            self.emit(ChatEvent::MessagesUpdated { conversation }).await;
        }
        Ok(message)
    }

    /// Record a local keystroke. Emits `is_typing=true` on the idle->typing
    /// edge; the driver takes care of the eventual stop signal.
    pub async fn typing_keystroke(&self) -> Result<(), ChatError> {
        let signal = {
            let mut state = self.state.lock().await;
            if state.active.is_none() {
                return Err(ChatError::NotConnected {
                    scope: "conversation".into(),
                });
            }
            state.typing.keystroke(Instant::now())
        };

        if signal == Some(TypingSignal::Started) {
            let channel_guard = self.convo_channel.lock().await;
            let channel = channel_guard.as_ref().ok_or(ChatError::NotConnected {
                scope: "conversation".into(),
            })?;
            channel.send(OutboundEnvelope::TypingStatus { is_typing: true })?;
        }
        Ok(())
    }

    // ---- inbound event handling -----------------------------------------

    /// Apply one transport event to the canonical collections. Called from
    /// the event pump; the pump is the single writer.
    pub async fn apply_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Open { scope, resumed } => {
                self.emit(ChatEvent::Connection {
                    scope,
                    state: ConnectionState::Open,
                })
                .await;
                if resumed {
                    if let Scope::Conversation(conversation) = scope {
                        let active = self.state.lock().await.active;
                        if active == Some(conversation) {
                            self.recover_gap(conversation).await;
                        }
                    }
                }
            }
            TransportEvent::Envelope { scope, envelope } => {
                self.apply_envelope(scope, envelope).await;
            }
            TransportEvent::Reconnecting { scope, attempt } => {
                debug!("{} reconnecting, attempt {}", scope, attempt);
                self.emit(ChatEvent::Connection {
                    scope,
                    state: ConnectionState::Reconnecting,
                })
                .await;
            }
            TransportEvent::AuthExpired { scope } => {
                error!("Session expired (auth rejected on {})", scope);
                self.emit(ChatEvent::SessionExpired).await;
            }
            TransportEvent::Closed { scope } => {
                self.emit(ChatEvent::Connection {
                    scope,
                    state: ConnectionState::Closed,
                })
                .await;
            }
        }
    }

    /// Apply one inbound envelope. Exhaustive over the envelope variants:
    /// a new server message type will not compile until it is handled here.
    pub async fn apply_envelope(&self, scope: Scope, envelope: InboundEnvelope) {
        match envelope {
            InboundEnvelope::Message(message) => self.apply_message_push(message).await,
            InboundEnvelope::ConversationUpdate(conversation) => {
                let mut state = self.state.lock().await;
                state.directory.upsert(conversation);
                drop(state);
                self.emit(ChatEvent::ConversationsUpdated).await;
            }
            InboundEnvelope::TypingStatus(payload) => {
                let mut state = self.state.lock().await;
                state.directory.set_participant_typing(
                    payload.conversation,
                    payload.user_id,
                    payload.is_typing,
                );
                drop(state);
                self.emit(ChatEvent::Typing {
                    conversation: payload.conversation,
                    user_id: payload.user_id,
                    is_typing: payload.is_typing,
                })
                .await;
            }
            InboundEnvelope::Notification(notification) => {
                self.apply_notification(notification).await;
            }
            InboundEnvelope::ConnectionInfo(info) => {
                debug!("connection_info on {}: {:?}", scope, info.detail);
            }
            InboundEnvelope::Error(payload) => {
                warn!("Server error on {}: {}", scope, payload.detail);
                self.emit(ChatEvent::Error(payload.detail)).await;
            }
        }
    }

    async fn apply_message_push(&self, message: Message) {
        let conversation = message.conversation;
        let summary = MessageSummary {
            uuid: message.uuid,
            sender: message.sender.clone(),
            content: message.content.clone(),
            created_at: message.created_at,
        };

        let (is_active, merged, known) = {
            let mut state = self.state.lock().await;
            let is_active = state.active == Some(conversation);
            let merged = if is_active {
                state.store.merge_one(message)
            } else {
                MergeOutcome::WrongConversation
            };
            let known = state.directory.record_message(conversation, summary);
            if is_active {
                // Read-state and open-state stay in lockstep.
                state.directory.reset_unread(conversation);
            } else if known {
                state.directory.increment_unread(conversation);
            }
            (is_active, merged, known)
        };

        if !known {
            debug!(
                "Message push for unknown conversation {} - waiting for list refresh",
                conversation
            );
        }

        if is_active {
            if matches!(merged, MergeOutcome::Inserted | MergeOutcome::Updated) {
                self.emit(ChatEvent::MessagesUpdated { conversation }).await;
            }
            // The push means the server has unread state for us; clear it.
            let rest = self.rest.clone();
            tokio::spawn(async move {
                if let Err(e) = rest.mark_read(conversation).await {
                    warn!("mark_read after push failed for {}: {}", conversation, e);
                }
            });
        }
        self.emit(ChatEvent::ConversationsUpdated).await;
    }

    async fn apply_notification(&self, notification: NotificationEvent) {
        let invalidates = {
            let mut state = self.state.lock().await;
            state.notifications.record(notification.clone())
        };
        self.emit(ChatEvent::Notification(notification)).await;

        if invalidates {
            // Push invalidates the cache; REST remains authoritative.
            match self.rest.unread_count().await {
                Ok(response) => {
                    self.state
                        .lock()
                        .await
                        .notifications
                        .set_unread_total(response.unread_count);
                    self.emit(ChatEvent::UnreadTotal(response.unread_count))
                        .await;
                }
                Err(e) if e.is_session_expired() => {
                    self.emit(ChatEvent::SessionExpired).await;
                }
                Err(e) => warn!("Unread refetch failed: {}", e),
            }
        }
    }

    // ---- snapshots ------------------------------------------------------

    pub async fn active_conversation(&self) -> Option<Uuid> {
        self.state.lock().await.active
    }

    pub async fn messages_snapshot(&self) -> Vec<Message> {
        self.state.lock().await.store.messages().to_vec()
    }

    pub async fn conversations_snapshot(&self) -> Vec<Conversation> {
        self.state.lock().await.directory.conversations().to_vec()
    }

    pub async fn recent_notifications(&self) -> Vec<NotificationEvent> {
        self.state
            .lock()
            .await
            .notifications
            .recent()
            .cloned()
            .collect()
    }

    pub async fn unread_total(&self) -> u32 {
        self.state.lock().await.notifications.unread_total()
    }

    pub async fn last_error(&self) -> Option<String> {
        self.state.lock().await.last_error.clone()
    }

    pub async fn conversation_channel_status(&self) -> Option<ChannelStatus> {
        self.convo_channel
            .lock()
            .await
            .as_ref()
            .map(|c| c.status())
    }

    pub async fn notifications_channel_status(&self) -> Option<ChannelStatus> {
        self.notif_channel
            .lock()
            .await
            .as_ref()
            .map(|c| c.status())
    }

    async fn emit(&self, event: ChatEvent) {
        // A full or dropped subscriber must never stall the engine.
        if let Err(e) = self.events_tx.try_send(event) {
            debug!("Subscriber not keeping up: {}", e);
        }
    }
}
