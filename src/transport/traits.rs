//! Transport trait abstraction for pluggable socket backends

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors raised while opening a transport socket
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("handshake rejected with HTTP {status}")]
    Rejected { status: u16 },

    #[error("connect timed out after {0}ms")]
    Timeout(u64),
}

/// Notification from an open socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// One UTF-8 text frame
    Text(String),
    /// Socket-level error; a `Closed` follows
    Error(String),
    /// Socket closed. `code` is `None` when the peer vanished without a close frame
    Closed { code: Option<u16>, reason: String },
}

/// Request to an open socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketCommand {
    Text(String),
    Close { code: u16, reason: String },
}

/// Both directions of an open socket
#[derive(Debug)]
pub struct TransportSocket {
    pub outbound: mpsc::UnboundedSender<SocketCommand>,
    pub inbound: mpsc::UnboundedReceiver<SocketEvent>,
}

impl TransportSocket {
    /// Wire a socket to a pair of channel ends
    pub fn new(
        outbound: mpsc::UnboundedSender<SocketCommand>,
        inbound: mpsc::UnboundedReceiver<SocketEvent>,
    ) -> Self {
        Self { outbound, inbound }
    }

    /// Close a socket nobody is going to use
    pub fn close(self, code: u16, reason: &str) {
        let (writer, _) = self.split();
        writer.close(code, reason);
    }

    /// Separate the write half from the event stream
    pub fn split(self) -> (SocketWriter, mpsc::UnboundedReceiver<SocketEvent>) {
        (
            SocketWriter {
                tx: self.outbound,
            },
            self.inbound,
        )
    }
}

/// Write half of an open socket
#[derive(Debug, Clone)]
pub struct SocketWriter {
    tx: mpsc::UnboundedSender<SocketCommand>,
}

impl SocketWriter {
    /// Queue a text frame on the socket. Hands the text back if the
    /// socket is gone.
    pub fn send_text(&self, text: String) -> Result<(), String> {
        self.tx.send(SocketCommand::Text(text)).map_err(|e| match e.0 {
            SocketCommand::Text(text) => text,
            SocketCommand::Close { reason, .. } => reason,
        })
    }

    /// Ask the socket to close with `code`
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(SocketCommand::Close {
            code,
            reason: reason.to_owned(),
        });
    }
}

/// Factory for creating transport sockets
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Attempt to open a socket at `url`, returning it once open
    async fn connect(&self, url: &str) -> Result<TransportSocket, TransportError>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}
