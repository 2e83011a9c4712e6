pub mod memory;
pub mod traits;
pub mod websocket;

pub use memory::{memory_transport, MemoryAcceptor, MemoryConnector, MemoryServer};
pub use traits::{
    SocketCommand, SocketEvent, SocketWriter, TransportConnector, TransportError, TransportSocket,
};
pub use websocket::WebSocketConnector;

/// Build the channel address for one conversation:
/// `{base_url}/channel/{conversation_id}/?token={token}`
pub fn channel_url(base_url: &str, conversation_id: &str, token: Option<&str>) -> String {
    let mut url = format!(
        "{}/channel/{}/",
        base_url.trim_end_matches('/'),
        urlencoding::encode(conversation_id)
    );
    if let Some(token) = token.filter(|t| !t.is_empty()) {
        url.push_str("?token=");
        url.push_str(&urlencoding::encode(token));
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_url_with_token() {
        assert_eq!(
            channel_url("ws://127.0.0.1:8000", "42", Some("abc.def")),
            "ws://127.0.0.1:8000/channel/42/?token=abc.def"
        );
    }

    #[test]
    fn test_channel_url_trims_base_and_encodes() {
        assert_eq!(
            channel_url("wss://chat.example/", "room 1", Some("a+b")),
            "wss://chat.example/channel/room%201/?token=a%2Bb"
        );
    }

    #[test]
    fn test_channel_url_without_token() {
        assert_eq!(
            channel_url("ws://h", "x", None),
            "ws://h/channel/x/"
        );
        assert_eq!(channel_url("ws://h", "x", Some("")), "ws://h/channel/x/");
    }
}
