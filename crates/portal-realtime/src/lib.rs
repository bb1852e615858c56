//! Realtime presence and channel multiplexing for the student portal.
//!
//! Many logical watchers (presence indicators, the local "I'm online"
//! announcement, direct-message streams) share a small number of realtime
//! channel subscriptions. [`ChannelRegistry`] reference-counts those
//! subscriptions and fans incoming events out to listeners;
//! [`PresenceTracker`] and [`SelfPresencePublisher`] build on it. The
//! concrete wire transport is behind the [`Transport`] trait, with a
//! Supabase Realtime implementation in [`supabase`].

pub mod conversation;
pub mod error;
pub mod presence;
pub mod registry;
pub mod supabase;
pub mod topics;
pub mod transport;

#[cfg(test)]
mod testing;

pub use conversation::{ConversationStream, DirectMessage, MessageLog, MessageLogConfig};
pub use error::{ChannelOpenError, ListenerError, RealtimeError, TransportError};
pub use presence::{
    PresenceGuard, PresenceRecord, PresenceStatus, PresenceTracker, PublishPhase,
    SelfPresencePublisher, Unwatch,
};
pub use registry::{ChannelRegistry, Lease, Listener, ListenerId, Release, Subscription};
pub use supabase::{RealtimeConfig, SupabaseTransport};
pub use transport::{
    PresenceEntry, PresenceSnapshot, SubscriptionHandle, TopicEvent, Transport, TransportEvent,
};
