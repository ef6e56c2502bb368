// Error taxonomy for the synchronization engine.
// The engine surfaces a closed set of error classes so callers can decide
// between "redirect to login", "show a retry affordance" and "ignore".

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    /// No auth token is available. Fails before any connection attempt.
    #[error("no auth token available")]
    Unauthenticated,

    /// The server rejected our token (REST 401 or WebSocket close 4001).
    /// Never retried; the caller must redirect to login.
    #[error("authentication expired")]
    AuthExpired,

    /// A send was attempted while the channel was not open. Surfaced to the
    /// caller instead of queuing; there is no offline message queue.
    #[error("channel for scope '{scope}' is not connected")]
    NotConnected { scope: String },

    /// A network failure other than auth. REST callers retry at most once;
    /// WebSocket drops go through the bounded reconnect policy.
    #[error("transient network error: {0}")]
    Transient(String),

    /// The server answered with an unexpected HTTP status.
    #[error("http status {status}: {body}")]
    Http { status: u16, body: String },

    /// A frame or payload did not match the documented protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ChatError {
    /// Errors that invalidate the session and must route to login.
    pub fn is_session_expired(&self) -> bool {
        matches!(self, ChatError::Unauthenticated | ChatError::AuthExpired)
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            if status.as_u16() == 401 {
                return ChatError::AuthExpired;
            }
            return ChatError::Http {
                status: status.as_u16(),
                body: err.to_string(),
            };
        }
        ChatError::Transient(err.to_string())
    }
}
