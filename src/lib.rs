//! Realtime chat client core
//!
//! The [`ConnectionManager`] keeps one streaming channel per active
//! conversation, repairs it when it drops, and fans inbound messages out
//! to subscribers. Wire types and pure policies live in `chat-shared`.

pub mod auth;
pub mod config;
pub mod connection;
pub mod history;
pub mod transport;

pub use auth::{SharedToken, StaticToken, TokenProvider};
pub use chat_shared::{ChatMessage, ConnectionQuality, ConnectionState, OutboundPayload};
pub use config::{load_config, ManagerConfig};
pub use connection::{
    ConnectionError, ConnectionEvent, ConnectionHandle, ConnectionManager, ErrorInfo,
    EventStream, StatusSnapshot,
};
pub use history::HistoryClient;
