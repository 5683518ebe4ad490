//! Client-side synchronization core for real-time conversations.
//!
//! The crate keeps per-conversation message logs consistent across a
//! reconnecting real-time transport and a REST history endpoint, tracks room
//! membership, reconciles optimistic sends with their server echoes and
//! aggregates unread counts for the notification surface.

pub mod config;
pub mod connection;
pub mod error;
pub mod membership;
pub mod message_store;
pub mod notifications;
pub mod rest;
pub mod runtime;
pub mod sync;

pub use config::{load_settings, ClientSettings};
pub use connection::{
    Backoff, ConnectionManager, ConnectionSnapshot, ConnectionStatus, Transport,
    WebSocketTransport,
};
pub use error::{ConfigError, ConnectionError, RestError, SyncError, TransportError};
pub use notifications::{ReadTarget, UnreadAggregate, UnreadSnapshot};
pub use rest::{ConversationApi, RestClient};
pub use runtime::SyncClient;
pub use sync::{Conversation, ConversationPhase, LocalIdentity, SyncEvent, SyncTimeouts};
