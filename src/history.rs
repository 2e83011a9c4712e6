//! Message history collaborator

use async_trait::async_trait;
use chat_shared::ChatMessage;

/// Request/response access to stored conversation history.
///
/// Only used to seed a conversation before its channel opens; see
/// [`crate::connection::ConnectionManager::seed_history`].
#[async_trait]
pub trait HistoryClient: Send + Sync {
    async fn fetch_messages(&self, conversation_id: &str) -> anyhow::Result<Vec<ChatMessage>>;
}

/// History held in memory, keyed by conversation id
#[derive(Debug, Clone, Default)]
pub struct StaticHistory {
    conversations: std::collections::HashMap<String, Vec<ChatMessage>>,
}

impl StaticHistory {
    pub fn with_conversation(mut self, conversation_id: &str, messages: Vec<ChatMessage>) -> Self {
        self.conversations
            .insert(conversation_id.to_owned(), messages);
        self
    }
}

#[async_trait]
impl HistoryClient for StaticHistory {
    async fn fetch_messages(&self, conversation_id: &str) -> anyhow::Result<Vec<ChatMessage>> {
        Ok(self
            .conversations
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }
}
