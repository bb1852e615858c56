//! Presence and conversation stream settings.

use serde::{Deserialize, Serialize};

/// Presence tracking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceSettings {
    /// Announce the local identity on the global topic at startup.
    pub enabled: bool,
    /// Topic every client announces itself on.
    pub global_topic: String,
    /// Seconds a one-shot online query waits for its first snapshot.
    /// `0` waits indefinitely (valid range: 0-300).
    pub query_timeout: u32,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            global_topic: "global-presence".into(),
            query_timeout: 15,
        }
    }
}

/// Direct-message stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationSettings {
    /// Messages kept per conversation in the local log (valid range: 1-10000).
    pub history_limit: u32,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self { history_limit: 500 }
    }
}
