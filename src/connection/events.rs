//! Events and status snapshots published by the connection manager

use std::fmt;
use std::time::Duration;

use chat_shared::{ChatMessage, ConnectionQuality, ConnectionState};
use tokio::sync::mpsc;

/// Receiver returned by [`super::ConnectionManager::subscribe`]
pub type EventStream = mpsc::UnboundedReceiver<ConnectionEvent>;

/// What went wrong on a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorInfo {
    /// Socket failed to open or reported an error
    Transport(String),
    /// Backend sent an error record
    Server(String),
    /// Inbound record could not be decoded; the record was dropped
    Malformed(String),
    /// Reconnect attempts used up; the connection is closed
    Exhausted { attempts: u32 },
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorInfo::Transport(msg) => write!(f, "transport error: {msg}"),
            ErrorInfo::Server(msg) => write!(f, "server error: {msg}"),
            ErrorInfo::Malformed(msg) => write!(f, "malformed record: {msg}"),
            ErrorInfo::Exhausted { attempts } => {
                write!(f, "gave up after {attempts} reconnect attempts")
            }
        }
    }
}

/// Events emitted by the connection manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connection moved between lifecycle states
    StateChanged {
        conversation_id: String,
        from: ConnectionState,
        to: ConnectionState,
    },
    /// Socket is open and the outbound queue has been flushed
    Opened { conversation_id: String },
    /// An open socket closed; `code` is `None` when no close frame arrived
    Closed {
        conversation_id: String,
        code: Option<u16>,
    },
    /// Chat message, delivered at most once per id
    Message {
        conversation_id: String,
        message: ChatMessage,
    },
    Error {
        conversation_id: String,
        error: ErrorInfo,
    },
}

impl ConnectionEvent {
    pub fn conversation_id(&self) -> &str {
        match self {
            ConnectionEvent::StateChanged {
                conversation_id, ..
            }
            | ConnectionEvent::Opened { conversation_id }
            | ConnectionEvent::Closed {
                conversation_id, ..
            }
            | ConnectionEvent::Message {
                conversation_id, ..
            }
            | ConnectionEvent::Error {
                conversation_id, ..
            } => conversation_id,
        }
    }
}

/// Point-in-time view of one connection.
///
/// The `Default` value is the zero snapshot reported for unknown ids.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusSnapshot {
    pub is_open: bool,
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub quality: ConnectionQuality,
    pub queue_depth: usize,
    pub reconnect_attempts: u32,
}

/// Per-connection line of [`PoolStats`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    pub conversation_id: String,
    pub state: ConnectionState,
    pub is_open: bool,
    pub last_error: Option<String>,
    pub latency: Duration,
    pub queue_depth: usize,
    pub reconnect_attempts: u32,
}

/// Summary of the whole pool, in insertion order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub total: usize,
    pub open: usize,
    pub connections: Vec<ConnectionStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_snapshot() {
        let status = StatusSnapshot::default();
        assert!(!status.is_open);
        assert_eq!(status.queue_depth, 0);
        assert_eq!(status.last_error, None);
        assert_eq!(status.state, ConnectionState::Idle);
    }

    #[test]
    fn test_event_conversation_id() {
        let event = ConnectionEvent::Closed {
            conversation_id: "a".into(),
            code: Some(1000),
        };
        assert_eq!(event.conversation_id(), "a");
    }

    #[test]
    fn test_exhausted_display() {
        assert_eq!(
            ErrorInfo::Exhausted { attempts: 5 }.to_string(),
            "gave up after 5 reconnect attempts"
        );
    }
}
