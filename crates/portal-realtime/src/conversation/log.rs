//! Local message history.
//!
//! Stores messages per conversation with a bounded ring buffer so memory
//! usage stays predictable.

use std::collections::{HashMap, VecDeque};

use super::types::DirectMessage;

/// Configuration for message history storage.
#[derive(Debug, Clone)]
pub struct MessageLogConfig {
    /// Maximum messages to retain per conversation.
    pub max_messages_per_conversation: usize,
}

impl Default for MessageLogConfig {
    fn default() -> Self {
        Self {
            max_messages_per_conversation: 500,
        }
    }
}

/// In-memory history keyed by conversation id.
pub struct MessageLog {
    config: MessageLogConfig,
    conversations: HashMap<String, VecDeque<DirectMessage>>,
}

impl MessageLog {
    pub fn new(config: MessageLogConfig) -> Self {
        Self {
            config,
            conversations: HashMap::new(),
        }
    }

    /// Append a message, evicting the oldest when the buffer is full.
    /// A message whose id is already stored is ignored, so an optimistic
    /// local copy and its echo from the server count once.
    pub fn push(&mut self, msg: DirectMessage) -> bool {
        let limit = self.config.max_messages_per_conversation.max(1);
        let buf = self
            .conversations
            .entry(msg.conversation_id.clone())
            .or_default();
        if buf.iter().any(|existing| existing.id == msg.id) {
            return false;
        }
        while buf.len() >= limit {
            buf.pop_front();
        }
        buf.push_back(msg);
        true
    }

    /// The most recent `limit` messages (oldest first).
    pub fn recent(&self, conversation_id: &str, limit: usize) -> Vec<&DirectMessage> {
        match self.conversations.get(conversation_id) {
            Some(buf) => {
                let skip = buf.len().saturating_sub(limit);
                buf.iter().skip(skip).collect()
            }
            None => Vec::new(),
        }
    }

    pub fn all(&self, conversation_id: &str) -> Vec<&DirectMessage> {
        self.conversations
            .get(conversation_id)
            .map(|buf| buf.iter().collect())
            .unwrap_or_default()
    }

    pub fn clear_conversation(&mut self, conversation_id: &str) {
        self.conversations.remove(conversation_id);
    }

    pub fn clear_all(&mut self) {
        self.conversations.clear();
    }

    /// Conversations that have messages.
    pub fn active_conversations(&self) -> Vec<&str> {
        self.conversations.keys().map(|s| s.as_str()).collect()
    }

    /// Total number of stored messages across all conversations.
    pub fn total_messages(&self) -> usize {
        self.conversations.values().map(|b| b.len()).sum()
    }
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new(MessageLogConfig::default())
    }
}
