use chat_shared::codec::CodecError;
use thiserror::Error;

/// Errors returned by the connection manager API
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("no connection for conversation {0}")]
    UnknownConversation(String),

    #[error("outbound queue for conversation {conversation_id} is full ({capacity} messages)")]
    QueueFull {
        conversation_id: String,
        capacity: usize,
    },

    #[error("connection manager has been shut down")]
    ShutDown,

    #[error("cannot encode payload: {0}")]
    Codec(#[from] CodecError),
}
