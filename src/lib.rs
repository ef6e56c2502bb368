// mecachat: client-side synchronization engine for the workshop chat
// platform. Reconciles paginated REST snapshots with the push-based
// WebSocket stream into one consistent, ordered view of conversations.

pub mod config;
pub mod error;
pub mod models;
pub mod rest;
pub mod sync;
pub mod utils;

// Re-export the types most callers need.
pub use error::ChatError;
pub use models::*;
pub use sync::{ChatClient, ChatEvent, ConnectionState, ReconnectPolicy, Scope};
