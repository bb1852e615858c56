//! Supabase Realtime transport over the Phoenix Channels v1 protocol.
//!
//! A background task owns the WebSocket (via `tokio-tungstenite`) and
//! handles heartbeats, channel join/leave with reply tracking, presence
//! track/untrack, broadcast, and auto-reconnect with backoff. Known
//! channels are re-joined after a reconnect and presence is re-tracked,
//! so the server re-delivers a full presence state.

mod client;
mod connection;
mod handler;
mod presence_state;
mod types;

pub use client::SupabaseTransport;
pub use types::{PhoenixMessage, RealtimeConfig};
