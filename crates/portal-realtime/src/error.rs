//! Error types for the realtime layer.
//!
//! External failures (network, server rejections) surface as typed errors
//! the caller may retry on. Broken local invariants are logged and
//! asserted in debug builds instead.

use std::any::Any;
use std::time::Duration;

/// A transport subscription could not be established.
///
/// Every caller coalesced onto the failed open receives a clone of the
/// same error, and no registration is left behind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelOpenError {
    #[error("failed to open {topic}: {source}")]
    Transport {
        topic: String,
        #[source]
        source: TransportError,
    },

    #[error("every holder of {topic} released it before the open completed")]
    Cancelled { topic: String },

    #[error("open of {topic} was abandoned before it completed")]
    Abandoned { topic: String },
}

impl ChannelOpenError {
    pub fn topic(&self) -> &str {
        match self {
            Self::Transport { topic, .. } | Self::Cancelled { topic } | Self::Abandoned { topic } => {
                topic
            }
        }
    }
}

/// Errors raised by a [`Transport`](crate::Transport) implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("topic {0} has no live subscription")]
    NotSubscribed(String),

    #[error("server rejected request on {topic}: {reason}")]
    Rejected { topic: String, reason: String },

    #[error("no reply on {topic} within {secs}s")]
    Timeout { topic: String, secs: u64 },

    #[error("transport connection closed")]
    Closed,
}

/// A listener failed while handling an event. Isolated per listener.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("listener failed: {message}")]
pub struct ListenerError {
    pub message: String,
}

impl ListenerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Build from the payload of a caught panic.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            format!("panicked: {s}")
        } else if let Some(s) = payload.downcast_ref::<String>() {
            format!("panicked: {s}")
        } else {
            "panicked".to_string()
        };
        Self { message }
    }
}

/// Errors surfaced by the presence and conversation APIs.
#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    #[error(transparent)]
    Open(#[from] ChannelOpenError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("no presence snapshot for {topic} within {after:?}")]
    Timeout { topic: String, after: Duration },

    #[error("subscription to {topic} closed before a snapshot arrived")]
    Closed { topic: String },

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<RealtimeError> for portal_common::PortalError {
    fn from(err: RealtimeError) -> Self {
        match err {
            RealtimeError::Timeout { .. } | RealtimeError::Closed { .. } => {
                portal_common::PortalError::Presence(err.to_string())
            }
            other => portal_common::PortalError::Realtime(other.to_string()),
        }
    }
}
