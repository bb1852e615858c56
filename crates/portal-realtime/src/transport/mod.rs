//! The abstract realtime transport the registry is written against.
//!
//! A transport joins and leaves named topics, publishes or retracts the
//! local presence record, broadcasts payloads, and reports everything it
//! receives as a stream of [`TransportEvent`]s. The registry never sees
//! wire formats.

mod snapshot;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TransportError;

pub use snapshot::{PresenceEntry, PresenceSnapshot};

/// Opaque handle for one joined topic, issued by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    topic: Arc<str>,
    id: u64,
}

impl SubscriptionHandle {
    pub fn new(topic: &str, id: u64) -> Self {
        Self {
            topic: Arc::from(topic),
            id,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.topic, self.id)
    }
}

/// Something that happened on a single topic.
#[derive(Debug, Clone)]
pub enum TopicEvent {
    /// Full, authoritative presence state. Replaces anything seen before.
    Sync(PresenceSnapshot),
    /// Entries that joined under a presence key.
    Join {
        key: String,
        entries: Vec<PresenceEntry>,
    },
    /// Entries that left a presence key.
    Leave {
        key: String,
        entries: Vec<PresenceEntry>,
    },
    /// Application broadcast (e.g. a direct message).
    Broadcast {
        event: String,
        payload: serde_json::Value,
    },
    /// The topic stopped receiving updates (connection lost, channel
    /// error). Presence on it is unknown until the next `Sync`.
    Interrupted,
}

/// Everything a transport reports to the registry.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Topic { topic: String, event: TopicEvent },
    ChannelError { topic: String, message: String },
    Error(String),
}

/// Realtime messaging capability supplied by an external service.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Join a topic. Resolves once the server has confirmed the join.
    async fn open_topic(&self, topic: &str) -> Result<SubscriptionHandle, TransportError>;

    /// Leave a topic. Leaving a topic the server already dropped is harmless.
    async fn close_topic(&self, handle: SubscriptionHandle);

    /// Track the local presence record on a joined topic.
    async fn publish_self(
        &self,
        handle: &SubscriptionHandle,
        record: serde_json::Value,
    ) -> Result<(), TransportError>;

    /// Untrack the local presence record.
    async fn retract_self(&self, handle: &SubscriptionHandle) -> Result<(), TransportError>;

    /// Send an application broadcast on a joined topic.
    async fn broadcast(
        &self,
        handle: &SubscriptionHandle,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), TransportError>;
}
