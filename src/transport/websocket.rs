//! WebSocket transport implementation

use crate::transport::traits::{
    SocketCommand, SocketEvent, TransportConnector, TransportError, TransportSocket,
};
use async_trait::async_trait;
use chat_shared::defaults;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// WebSocket connector for `ws://` and `wss://` channel URLs
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl TransportConnector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<TransportSocket, TransportError> {
        let (stream, _response) = timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout.as_millis() as u64))?
            .map_err(|e| match e {
                tungstenite::Error::Http(response) => TransportError::Rejected {
                    status: response.status().as_u16(),
                },
                other => TransportError::Connect(other.to_string()),
            })?;

        Ok(pump(stream))
    }

    fn name(&self) -> &'static str {
        "WebSocket"
    }
}

/// Bridge a WebSocket stream to the channel-based socket interface
fn pump(stream: WsStream) -> TransportSocket {
    let (mut writer, mut reader) = stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<SocketCommand>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<SocketEvent>();

    // Writer: forwards frames until a close is requested. An owner that
    // drops the socket without closing it still gets a normal closure.
    tokio::spawn(async move {
        let (code, reason) = loop {
            match outbound_rx.recv().await {
                Some(SocketCommand::Text(text)) => {
                    if let Err(e) = writer.send(Message::Text(text.into())).await {
                        debug!("[WS] Write failed: {}", e);
                        return;
                    }
                }
                Some(SocketCommand::Close { code, reason }) => break (code, reason),
                None => break (defaults::NORMAL_CLOSURE, "socket dropped".to_owned()),
            }
        };

        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        };
        if let Err(e) = writer.send(Message::Close(Some(frame))).await {
            debug!("[WS] Close frame not sent: {}", e);
        }
        let _ = writer.close().await;
    });

    // Reader: turns frames into socket events, always ending with `Closed`
    tokio::spawn(async move {
        loop {
            let event = match reader.next().await {
                Some(Ok(Message::Text(text))) => SocketEvent::Text(text.as_str().to_owned()),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (Some(u16::from(f.code)), f.reason.as_str().to_owned()))
                        .unwrap_or((None, String::new()));
                    let _ = inbound_tx.send(SocketEvent::Closed { code, reason });
                    break;
                }
                // Binary frames are not part of the protocol; ping/pong frames
                // are answered by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    let _ = inbound_tx.send(SocketEvent::Error(e.to_string()));
                    let _ = inbound_tx.send(SocketEvent::Closed {
                        code: None,
                        reason: "read error".into(),
                    });
                    break;
                }
                None => {
                    let _ = inbound_tx.send(SocketEvent::Closed {
                        code: None,
                        reason: "stream ended".into(),
                    });
                    break;
                }
            };

            if inbound_tx.send(event).is_err() {
                break;
            }
        }
    });

    TransportSocket::new(outbound_tx, inbound_rx)
}
