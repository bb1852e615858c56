//! Configuration, protocol types, and commands for the Supabase transport.

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::TransportError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for connecting to Supabase Realtime.
#[derive(Clone)]
pub struct RealtimeConfig {
    /// Supabase project reference (e.g., "abcdefghijklmnop").
    pub project_ref: String,
    /// Supabase anon key (publishable).
    pub api_key: String,
    /// Optional access token (JWT) sent with every channel join.
    pub access_token: Option<String>,
    /// Heartbeat interval in seconds (default: 25).
    pub heartbeat_interval_secs: u64,
    /// Reconnect base delay in seconds.
    pub reconnect_delay_secs: u64,
    /// Maximum reconnect delay in seconds.
    pub max_reconnect_delay_secs: u64,
    /// How long a channel join may wait for the server's reply.
    pub join_timeout_secs: u64,
    /// How long a presence push may wait for the server's reply.
    pub push_timeout_secs: u64,
}

impl std::fmt::Debug for RealtimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeConfig")
            .field("project_ref", &self.project_ref)
            .field("api_key", &"[REDACTED]")
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("heartbeat_interval_secs", &self.heartbeat_interval_secs)
            .field("reconnect_delay_secs", &self.reconnect_delay_secs)
            .field("max_reconnect_delay_secs", &self.max_reconnect_delay_secs)
            .field("join_timeout_secs", &self.join_timeout_secs)
            .field("push_timeout_secs", &self.push_timeout_secs)
            .finish()
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            project_ref: String::new(),
            api_key: String::new(),
            access_token: None,
            heartbeat_interval_secs: 25,
            reconnect_delay_secs: 1,
            max_reconnect_delay_secs: 30,
            join_timeout_secs: 10,
            push_timeout_secs: 10,
        }
    }
}

impl RealtimeConfig {
    /// Build the WebSocket URL for Supabase Realtime.
    pub(crate) fn ws_url(&self) -> String {
        format!(
            "wss://{}.supabase.co/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            self.project_ref, self.api_key
        )
    }
}

// ---------------------------------------------------------------------------
// Phoenix Protocol Types
// ---------------------------------------------------------------------------

/// A Phoenix protocol message envelope (v1 JSON format).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    pub payload: serde_json::Value,
    #[serde(rename = "ref")]
    pub msg_ref: Option<String>,
}

impl PhoenixMessage {
    /// A push on a channel topic; adds the `realtime:` prefix.
    pub(crate) fn channel(
        topic: &str,
        event: &str,
        payload: serde_json::Value,
        msg_ref: String,
    ) -> Self {
        Self {
            topic: format!("{TOPIC_PREFIX}{topic}"),
            event: event.to_string(),
            payload,
            msg_ref: Some(msg_ref),
        }
    }
}

pub(crate) const TOPIC_PREFIX: &str = "realtime:";

// ---------------------------------------------------------------------------
// Channel Configuration
// ---------------------------------------------------------------------------

/// Join settings for one channel.
#[derive(Debug, Clone)]
pub(crate) struct ChannelConfig {
    /// Whether to receive your own broadcasts (Supabase "self" key).
    pub(crate) broadcast_self: bool,
    /// The key used to identify this client in presence state.
    pub(crate) presence_key: String,
}

impl ChannelConfig {
    /// Serialize to the JSON payload expected by Supabase phx_join.
    pub(crate) fn to_join_payload(&self, access_token: Option<&str>) -> serde_json::Value {
        let mut payload = serde_json::json!({
            "config": {
                "broadcast": {
                    "self": self.broadcast_self,
                    "ack": false
                },
                "presence": {
                    "key": self.presence_key
                }
            }
        });
        if let Some(token) = access_token {
            payload["access_token"] = serde_json::Value::String(token.to_string());
        }
        payload
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Resolves with the reply's `response` object, or the failure.
pub(crate) type Reply = oneshot::Sender<Result<serde_json::Value, TransportError>>;

/// Commands sent from [`SupabaseTransport`](super::SupabaseTransport) to the
/// connection task.
#[derive(Debug)]
pub(crate) enum Command {
    Join {
        topic: String,
        config: ChannelConfig,
        reply: Reply,
    },
    Leave {
        topic: String,
    },
    Broadcast {
        topic: String,
        event: String,
        payload: serde_json::Value,
        reply: Reply,
    },
    Track {
        topic: String,
        payload: serde_json::Value,
        reply: Reply,
    },
    Untrack {
        topic: String,
        reply: Reply,
    },
    Disconnect,
}
