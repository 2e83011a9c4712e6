//! In-memory transport
//!
//! Each successful `connect` hands the far end of the socket to a
//! [`MemoryAcceptor`], which plays the backend: it can push frames, report
//! errors, close with any code, and read what the client wrote. Used by
//! the connection tests and handy for driving a UI without a server.

use crate::transport::traits::{
    SocketCommand, SocketEvent, TransportConnector, TransportError, TransportSocket,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct MemoryState {
    urls: Vec<String>,
    scripted_failures: VecDeque<String>,
    refusing: Option<String>,
}

/// Connector whose sockets terminate in a [`MemoryAcceptor`]
#[derive(Clone)]
pub struct MemoryConnector {
    state: Arc<Mutex<MemoryState>>,
    accepted_tx: mpsc::UnboundedSender<MemoryServer>,
}

/// Backend side of a [`MemoryConnector`]
pub struct MemoryAcceptor {
    state: Arc<Mutex<MemoryState>>,
    accepted_rx: mpsc::UnboundedReceiver<MemoryServer>,
}

/// Create a connected connector/acceptor pair
pub fn memory_transport() -> (MemoryConnector, MemoryAcceptor) {
    let state = Arc::new(Mutex::new(MemoryState::default()));
    let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
    (
        MemoryConnector {
            state: state.clone(),
            accepted_tx,
        },
        MemoryAcceptor { state, accepted_rx },
    )
}

#[async_trait]
impl TransportConnector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<TransportSocket, TransportError> {
        {
            let mut state = self
                .state
                .lock()
                .map_err(|_| TransportError::Connect("memory transport poisoned".into()))?;
            state.urls.push(url.to_owned());
            if let Some(reason) = state.scripted_failures.pop_front() {
                return Err(TransportError::Connect(reason));
            }
            if let Some(reason) = &state.refusing {
                return Err(TransportError::Connect(reason.clone()));
            }
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let server = MemoryServer {
            url: url.to_owned(),
            to_client: inbound_tx,
            from_client: outbound_rx,
        };
        self.accepted_tx
            .send(server)
            .map_err(|_| TransportError::Connect("no acceptor".into()))?;

        Ok(TransportSocket::new(outbound_tx, inbound_rx))
    }

    fn name(&self) -> &'static str {
        "Memory"
    }
}

impl MemoryAcceptor {
    /// Wait for the next socket the client opens
    pub async fn accept(&mut self) -> Option<MemoryServer> {
        self.accepted_rx.recv().await
    }

    /// Next already-opened socket, if any
    pub fn try_accept(&mut self) -> Option<MemoryServer> {
        self.accepted_rx.try_recv().ok()
    }

    /// Make the next `n` connect attempts fail
    pub fn fail_next(&self, n: usize) {
        if let Ok(mut state) = self.state.lock() {
            for _ in 0..n {
                state.scripted_failures.push_back("connection refused".into());
            }
        }
    }

    /// Refuse every connect attempt until cleared
    pub fn set_refusing(&self, refusing: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.refusing = refusing.then(|| "connection refused".to_owned());
        }
    }

    /// Number of connect attempts seen so far, successful or not
    pub fn attempts(&self) -> usize {
        self.state.lock().map(|s| s.urls.len()).unwrap_or(0)
    }

    /// URLs of every connect attempt, in order
    pub fn urls(&self) -> Vec<String> {
        self.state.lock().map(|s| s.urls.clone()).unwrap_or_default()
    }
}

/// Backend end of one in-memory socket
#[derive(Debug)]
pub struct MemoryServer {
    url: String,
    to_client: mpsc::UnboundedSender<SocketEvent>,
    from_client: mpsc::UnboundedReceiver<SocketCommand>,
}

impl MemoryServer {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Push a raw text frame to the client
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(SocketEvent::Text(text.into())).is_ok()
    }

    /// Push a JSON record to the client
    pub fn send_json(&self, value: &Value) -> bool {
        self.send_text(value.to_string())
    }

    /// Report a socket-level error (without closing)
    pub fn error(&self, message: impl Into<String>) -> bool {
        self.to_client.send(SocketEvent::Error(message.into())).is_ok()
    }

    /// Close the socket from the server side
    pub fn close(&self, code: Option<u16>) -> bool {
        self.to_client
            .send(SocketEvent::Closed {
                code,
                reason: String::new(),
            })
            .is_ok()
    }

    /// Wait for the next thing the client writes
    pub async fn recv(&mut self) -> Option<SocketCommand> {
        self.from_client.recv().await
    }

    /// Next thing the client wrote, if already there
    pub fn try_recv(&mut self) -> Option<SocketCommand> {
        self.from_client.try_recv().ok()
    }

    /// Wait for the next text frame, parsed as JSON, skipping nothing
    pub async fn recv_json(&mut self) -> Option<Value> {
        match self.recv().await? {
            SocketCommand::Text(text) => serde_json::from_str(&text).ok(),
            SocketCommand::Close { .. } => None,
        }
    }

    /// Drain everything the client has written so far
    pub fn drain(&mut self) -> Vec<SocketCommand> {
        let mut out = Vec::new();
        while let Ok(command) = self.from_client.try_recv() {
            out.push(command);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_hands_socket_to_acceptor() {
        let (connector, mut acceptor) = memory_transport();
        let socket = connector.connect("mem://a").await.expect("connect");
        let mut server = acceptor.accept().await.expect("accepted");
        assert_eq!(server.url(), "mem://a");

        let (writer, mut events) = socket.split();
        assert!(writer.send_text("hello".into()).is_ok());
        assert_eq!(server.recv().await, Some(SocketCommand::Text("hello".into())));

        assert!(server.send_text("world"));
        assert_eq!(events.recv().await, Some(SocketEvent::Text("world".into())));
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let (connector, acceptor) = memory_transport();
        acceptor.fail_next(1);

        assert!(connector.connect("mem://a").await.is_err());
        assert!(connector.connect("mem://a").await.is_ok());
        assert_eq!(acceptor.attempts(), 2);
    }

    #[tokio::test]
    async fn test_refusing() {
        let (connector, acceptor) = memory_transport();
        acceptor.set_refusing(true);
        assert!(connector.connect("mem://a").await.is_err());
        acceptor.set_refusing(false);
        assert!(connector.connect("mem://a").await.is_ok());
    }
}
