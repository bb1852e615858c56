//! Well-known topic names.
//!
//! Topics are plain strings; these helpers keep the naming scheme in one
//! place so watchers and publishers agree on it.

/// Default topic every client announces itself on.
pub const GLOBAL_PRESENCE: &str = "global-presence";

const USER_PRESENCE_PREFIX: &str = "user-presence:";
const DIRECT_MESSAGE_PREFIX: &str = "dm:";

pub fn global_presence() -> String {
    GLOBAL_PRESENCE.to_string()
}

/// Per-user presence topic, e.g. `user-presence:42`.
pub fn user_presence(user_id: &str) -> String {
    format!("{USER_PRESENCE_PREFIX}{user_id}")
}

/// Per-conversation message stream, e.g. `dm:abc`.
pub fn direct_message(conversation_id: &str) -> String {
    format!("{DIRECT_MESSAGE_PREFIX}{conversation_id}")
}

/// Extract the conversation id from a `dm:` topic.
pub fn conversation_id(topic: &str) -> Option<&str> {
    topic
        .strip_prefix(DIRECT_MESSAGE_PREFIX)
        .filter(|id| !id.is_empty())
}
