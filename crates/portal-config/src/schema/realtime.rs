//! Realtime transport connection settings.

use serde::{Deserialize, Serialize};

/// Connection settings for the Supabase Realtime endpoint.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeSettings {
    /// Supabase project reference (the `<ref>` in `<ref>.supabase.co`).
    pub project_ref: String,
    /// Supabase anon key (publishable).
    pub api_key: String,
    /// Optional JWT for authenticated connections.
    pub access_token: Option<String>,
    /// Heartbeat interval in seconds (valid range: 5-120).
    pub heartbeat_interval: u32,
    /// Base reconnect delay in seconds (valid range: 1-60).
    pub reconnect_delay: u32,
    /// Reconnect backoff ceiling in seconds (valid range: 1-600).
    pub max_reconnect_delay: u32,
    /// Seconds to wait for a channel join reply (valid range: 1-120).
    pub join_timeout: u32,
    /// Seconds to wait for a presence track/untrack reply (valid range: 1-120).
    pub push_timeout: u32,
}

impl std::fmt::Debug for RealtimeSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeSettings")
            .field("project_ref", &self.project_ref)
            .field("api_key", &"[REDACTED]")
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("max_reconnect_delay", &self.max_reconnect_delay)
            .field("join_timeout", &self.join_timeout)
            .field("push_timeout", &self.push_timeout)
            .finish()
    }
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            project_ref: String::new(),
            api_key: String::new(),
            access_token: None,
            heartbeat_interval: 25,
            reconnect_delay: 1,
            max_reconnect_delay: 30,
            join_timeout: 10,
            push_timeout: 10,
        }
    }
}

impl RealtimeSettings {
    /// True once both the project ref and the anon key are filled in.
    pub fn is_configured(&self) -> bool {
        !self.project_ref.is_empty() && !self.api_key.is_empty()
    }
}
