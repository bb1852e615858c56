use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Broadcast event name carrying a [`DirectMessage`].
pub const MESSAGE_EVENT: &str = "message";

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl DirectMessage {
    /// New message stamped with a fresh id and the current time.
    pub fn new(
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: portal_common::new_id(),
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            content: content.into(),
            sent_at: Utc::now(),
            reply_to: None,
        }
    }

    pub fn in_reply_to(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to = Some(message_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_to_omitted_when_absent() {
        let msg = DirectMessage::new("conv-1", "alice", "hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("reply_to").is_none());
        assert_eq!(json["conversation_id"], "conv-1");

        let reply = DirectMessage::new("conv-1", "bob", "hey").in_reply_to(&msg.id);
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["reply_to"], msg.id.as_str());
    }

    #[test]
    fn missing_reply_to_parses() {
        let json = serde_json::json!({
            "id": "m1",
            "conversation_id": "conv-1",
            "sender_id": "alice",
            "content": "hello",
            "sent_at": "2024-05-01T12:00:00Z",
        });
        let msg: DirectMessage = serde_json::from_value(json).unwrap();
        assert_eq!(msg.reply_to, None);
        assert_eq!(msg.sender_id, "alice");
    }
}
