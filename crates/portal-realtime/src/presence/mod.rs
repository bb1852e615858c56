//! Presence on top of the channel registry.
//!
//! [`PresenceTracker`] answers "who is online on this topic" from the
//! transport's authoritative snapshots. [`SelfPresencePublisher`]
//! announces the local identity on the global presence topic.

mod publisher;
mod record;
mod tracker;

pub use publisher::{PresenceGuard, PublishPhase, SelfPresencePublisher};
pub use record::PresenceRecord;
pub use tracker::{PresenceStatus, PresenceTracker, Unwatch};
