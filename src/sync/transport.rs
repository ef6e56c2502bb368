// Transport channel: one WebSocket connection per logical scope.
// Owns the handshake (token in the URL), the typed envelope codec, and the
// bounded reconnect policy. Everything the socket produces is forwarded as
// TransportEvents over an mpsc channel; the facade never touches the socket.

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::models::{Conversation, Message, NotificationEvent};

/// Close code the server uses to reject an expired or invalid token.
pub const CLOSE_AUTH_REJECTED: u16 = 4001;
/// Normal closure; sent by us on manual disconnect.
pub const CLOSE_MANUAL: u16 = 1000;

/// Logical WebSocket destination: a single conversation, or the global
/// notifications stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Conversation(Uuid),
    Notifications,
}

impl Scope {
    fn path_segment(&self) -> String {
        match self {
            Scope::Conversation(uuid) => uuid.to_string(),
            Scope::Notifications => "notifications".to_string(),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Conversation(uuid) => write!(f, "conversation/{}", uuid),
            Scope::Notifications => write!(f, "notifications"),
        }
    }
}

/// Inbound envelope, tagged by `type` on the wire. This is a closed set:
/// adding a server message type means adding a variant here, and the
/// compiler will point at every match that needs updating.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum InboundEnvelope {
    Message(Message),
    ConversationUpdate(Conversation),
    TypingStatus(TypingStatusPayload),
    Notification(NotificationEvent),
    ConnectionInfo(ConnectionInfoPayload),
    Error(ErrorPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TypingStatusPayload {
    pub conversation: Uuid,
    pub user_id: i64,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionInfoPayload {
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub detail: String,
}

/// Outbound envelope (client -> server).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OutboundEnvelope {
    SendMessage { uuid: Uuid, content: String },
    TypingStatus { is_typing: bool },
}

/// Connection lifecycle of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    Reconnecting,
}

/// Snapshot of a channel's health, published over a watch channel.
#[derive(Debug, Clone)]
pub struct ChannelStatus {
    pub state: ConnectionState,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl ChannelStatus {
    fn closed() -> Self {
        ChannelStatus {
            state: ConnectionState::Closed,
            retry_count: 0,
            last_error: None,
        }
    }
}

/// Bounded reconnect policy applied after an unexpected close.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        // Reference policy: 5 attempts at a fixed 3s interval.
        ReconnectPolicy {
            max_attempts: 5,
            interval: Duration::from_secs(3),
        }
    }
}

/// What to do after the socket closed with a given close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    /// Code 1000: we asked for this, stay closed.
    Manual,
    /// Code 4001: token rejected, stay closed and surface AuthExpired.
    AuthRejected,
    /// Anything else: run the reconnect policy.
    Retry,
}

pub fn disposition_for_close(code: Option<u16>) -> CloseDisposition {
    match code {
        Some(CLOSE_MANUAL) => CloseDisposition::Manual,
        Some(CLOSE_AUTH_REJECTED) => CloseDisposition::AuthRejected,
        // No close frame at all (dropped TCP) is treated like an abnormal
        // close and retried.
        _ => CloseDisposition::Retry,
    }
}

/// Events a channel pushes to the facade.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Connection established. `resumed` is true when this follows a drop,
    /// which is the facade's cue to run gap recovery.
    Open { scope: Scope, resumed: bool },
    Envelope { scope: Scope, envelope: InboundEnvelope },
    Reconnecting { scope: Scope, attempt: u32 },
    /// Channel gave up: manual close, exhausted retries, or auth rejection.
    Closed { scope: Scope },
    AuthExpired { scope: Scope },
}

/// Handle to a live channel. Dropping the handle (or calling `close`) shuts
/// the background task down with a clean 1000 close.
pub struct TransportChannel {
    scope: Scope,
    outbound_tx: mpsc::Sender<OutboundEnvelope>,
    shutdown_tx: watch::Sender<bool>,
    status_rx: watch::Receiver<ChannelStatus>,
}

impl TransportChannel {
    /// Open a channel for `scope`. Fails fast with `Unauthenticated` when no
    /// token is configured; no connection is attempted in that case.
    pub fn connect(
        config: &ChatConfig,
        scope: Scope,
        policy: ReconnectPolicy,
        events_tx: mpsc::Sender<TransportEvent>,
    ) -> Result<TransportChannel, ChatError> {
        let token = config
            .token
            .clone()
            .ok_or(ChatError::Unauthenticated)?;

        let mut url = url::Url::parse(&format!(
            "{}/ws/chat/{}/",
            config.ws_base,
            scope.path_segment()
        ))
        .map_err(|e| ChatError::Protocol(format!("bad websocket base: {}", e)))?;
        url.query_pairs_mut().append_pair("token", &token);

        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(ChannelStatus::closed());

        tokio::spawn(run_channel(
            scope,
            url.to_string(),
            policy,
            events_tx,
            outbound_rx,
            shutdown_rx,
            status_tx,
        ));

        Ok(TransportChannel {
            scope,
            outbound_tx,
            shutdown_tx,
            status_rx,
        })
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn status(&self) -> ChannelStatus {
        self.status_rx.borrow().clone()
    }

    /// Send an envelope. Errors with `NotConnected` while the channel is not
    /// OPEN - there is no offline queue; REST is the fallback path.
    pub fn send(&self, envelope: OutboundEnvelope) -> Result<(), ChatError> {
        self.sender().send(envelope)
    }

    /// A clonable sending handle with the same not-open semantics, for
    /// background tasks (the typing driver) that outlive a borrow of self.
    pub fn sender(&self) -> ChannelSender {
        ChannelSender {
            scope: self.scope,
            outbound_tx: self.outbound_tx.clone(),
            status_rx: self.status_rx.clone(),
        }
    }

    /// Manual disconnect: the task sends close code 1000 and does not retry.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[derive(Clone)]
pub struct ChannelSender {
    scope: Scope,
    outbound_tx: mpsc::Sender<OutboundEnvelope>,
    status_rx: watch::Receiver<ChannelStatus>,
}

impl ChannelSender {
    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn send(&self, envelope: OutboundEnvelope) -> Result<(), ChatError> {
        if self.status_rx.borrow().state != ConnectionState::Open {
            return Err(ChatError::NotConnected {
                scope: self.scope.to_string(),
            });
        }
        self.outbound_tx
            .try_send(envelope)
            .map_err(|_| ChatError::NotConnected {
                scope: self.scope.to_string(),
            })
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn run_channel(
    scope: Scope,
    url: String,
    policy: ReconnectPolicy,
    events_tx: mpsc::Sender<TransportEvent>,
    mut outbound_rx: mpsc::Receiver<OutboundEnvelope>,
    mut shutdown_rx: watch::Receiver<bool>,
    status_tx: watch::Sender<ChannelStatus>,
) {
    let mut retry_count: u32 = 0;
    let mut had_session = false;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let _ = status_tx.send(ChannelStatus {
            state: if retry_count == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            },
            retry_count,
            last_error: None,
        });

        let connect_result = tokio::select! {
            result = connect_async(url.as_str()) => result,
            _ = shutdown_rx.changed() => break,
        };

        let (ws_stream, _) = match connect_result {
            Ok(ok) => ok,
            Err(e) => {
                warn!("WebSocket connect failed for {}: {}", scope, e);
                let _ = status_tx.send(ChannelStatus {
                    state: ConnectionState::Reconnecting,
                    retry_count,
                    last_error: Some(e.to_string()),
                });
                if !wait_for_retry(scope, policy, &mut retry_count, &events_tx, &mut shutdown_rx)
                    .await
                {
                    break;
                }
                continue;
            }
        };

        info!("WebSocket open for {}", scope);
        let resumed = had_session;
        had_session = true;
        retry_count = 0;
        let _ = status_tx.send(ChannelStatus {
            state: ConnectionState::Open,
            retry_count: 0,
            last_error: None,
        });
        let _ = events_tx.send(TransportEvent::Open { scope, resumed }).await;

        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        // Session loop: pump outbound envelopes and inbound frames until the
        // socket closes or we are told to shut down.
        let disposition = loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "client disconnect".into(),
                    };
                    if let Err(e) = ws_tx.send(WsMessage::Close(Some(frame))).await {
                        debug!("Close frame send failed for {}: {}", scope, e);
                    }
                    break CloseDisposition::Manual;
                }
                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(envelope) => {
                            let json = match serde_json::to_string(&envelope) {
                                Ok(json) => json,
                                Err(e) => {
                                    error!("Failed to serialize outbound envelope: {}", e);
                                    continue;
                                }
                            };
                            if let Err(e) = ws_tx.send(WsMessage::Text(json)).await {
                                warn!("WebSocket send failed for {}: {}", scope, e);
                                break CloseDisposition::Retry;
                            }
                        }
                        // Handle dropped; treat like a manual close.
                        None => break CloseDisposition::Manual,
                    }
                }
                inbound = ws_rx.next() => {
                    match inbound {
                        Some(Ok(WsMessage::Text(text))) => {
                            match serde_json::from_str::<InboundEnvelope>(&text) {
                                Ok(envelope) => {
                                    let _ = events_tx
                                        .send(TransportEvent::Envelope { scope, envelope })
                                        .await;
                                }
                                // Unknown or malformed types are logged and
                                // ignored; they must never take the channel
                                // down.
                                Err(e) => warn!(
                                    "Ignoring unrecognized envelope on {}: {}",
                                    scope, e
                                ),
                            }
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            let _ = ws_tx.send(WsMessage::Pong(data)).await;
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            let code = frame.as_ref().map(|f| u16::from(f.code));
                            info!("WebSocket closed for {} with code {:?}", scope, code);
                            break disposition_for_close(code);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("WebSocket read error for {}: {}", scope, e);
                            break CloseDisposition::Retry;
                        }
                        None => break CloseDisposition::Retry,
                    }
                }
            }
        };

        match disposition {
            CloseDisposition::Manual => break,
            CloseDisposition::AuthRejected => {
                error!("Auth rejected on {} - not reconnecting", scope);
                let _ = status_tx.send(ChannelStatus {
                    state: ConnectionState::Closed,
                    retry_count,
                    last_error: Some("authentication rejected".into()),
                });
                let _ = events_tx.send(TransportEvent::AuthExpired { scope }).await;
                let _ = events_tx.send(TransportEvent::Closed { scope }).await;
                return;
            }
            CloseDisposition::Retry => {
                if !wait_for_retry(scope, policy, &mut retry_count, &events_tx, &mut shutdown_rx)
                    .await
                {
                    break;
                }
            }
        }
    }

    let _ = status_tx.send(ChannelStatus {
        state: ConnectionState::Closed,
        retry_count,
        last_error: None,
    });
    let _ = events_tx.send(TransportEvent::Closed { scope }).await;
    debug!("Channel task for {} finished", scope);
}

/// Sleep out the backoff interval, honoring shutdown. Returns false when the
/// retry budget is exhausted or a shutdown arrived.
async fn wait_for_retry(
    scope: Scope,
    policy: ReconnectPolicy,
    retry_count: &mut u32,
    events_tx: &mpsc::Sender<TransportEvent>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> bool {
    *retry_count += 1;
    if *retry_count > policy.max_attempts {
        error!(
            "Giving up on {} after {} reconnect attempts",
            scope, policy.max_attempts
        );
        return false;
    }
    info!(
        "Reconnecting {} in {:?} (attempt {}/{})",
        scope, policy.interval, retry_count, policy.max_attempts
    );
    let _ = events_tx
        .send(TransportEvent::Reconnecting {
            scope,
            attempt: *retry_count,
        })
        .await;

    tokio::select! {
        _ = tokio::time::sleep(policy.interval) => true,
        _ = shutdown_rx.changed() => false,
    }
}
