//! RAII wrappers around registry references.

use std::sync::{Mutex, PoisonError};

use tracing::debug;

use super::{ChannelRegistry, ListenerId, Release};

/// Cleans up after an `acquire` future that is dropped before it settles.
pub(super) struct PendingAcquire<'a> {
    registry: &'a ChannelRegistry,
    topic: &'a str,
    generation: u64,
    opener: bool,
    armed: bool,
}

impl<'a> PendingAcquire<'a> {
    pub(super) fn opener(registry: &'a ChannelRegistry, topic: &'a str, generation: u64) -> Self {
        Self {
            registry,
            topic,
            generation,
            opener: true,
            armed: true,
        }
    }

    pub(super) fn joiner(registry: &'a ChannelRegistry, topic: &'a str, generation: u64) -> Self {
        Self {
            registry,
            topic,
            generation,
            opener: false,
            armed: true,
        }
    }

    pub(super) fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.opener {
            self.registry.abandon_open(self.topic, self.generation);
        } else {
            self.registry
                .release_detached_in(self.topic, Some(self.generation));
        }
    }
}

/// Removes a listener whose subscription never completed.
pub(super) struct PendingListener<'a> {
    registry: &'a ChannelRegistry,
    topic: &'a str,
    id: ListenerId,
    armed: bool,
}

impl<'a> PendingListener<'a> {
    pub(super) fn new(registry: &'a ChannelRegistry, topic: &'a str, id: ListenerId) -> Self {
        Self {
            registry,
            topic,
            id,
            armed: true,
        }
    }

    pub(super) fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingListener<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry.remove_listener(self.topic, self.id);
        }
    }
}

/// One reference on a topic. Dropping it releases the reference in the
/// background; [`Lease::release`] does so in place.
pub struct Lease {
    registry: ChannelRegistry,
    topic: String,
    released: bool,
}

impl Lease {
    pub(super) fn new(registry: ChannelRegistry, topic: &str) -> Self {
        Self {
            registry,
            topic: topic.to_string(),
            released: false,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn release(mut self) -> Release {
        self.released = true;
        self.registry.release(&self.topic).await
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.released {
            debug!(topic = %self.topic, "Lease dropped without release");
            self.registry.release_detached(&self.topic);
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("topic", &self.topic)
            .field("released", &self.released)
            .finish()
    }
}

/// A listener plus the topic reference that feeds it.
///
/// [`cancel`](Self::cancel) removes the listener and releases the topic;
/// calling it again, or after the transport already dropped the topic, is
/// a no-op. Dropping an uncancelled subscription does the same cleanup.
pub struct Subscription {
    topic: String,
    listener: ListenerId,
    lease: Mutex<Option<Lease>>,
}

impl Subscription {
    pub(super) fn new(lease: Lease, listener: ListenerId) -> Self {
        Self {
            topic: lease.topic().to_string(),
            listener,
            lease: Mutex::new(Some(lease)),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn listener_id(&self) -> ListenerId {
        self.listener
    }

    pub fn is_active(&self) -> bool {
        self.lease
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Returns `None` if the subscription was already cancelled.
    pub async fn cancel(&self) -> Option<Release> {
        let lease = self
            .lease
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        lease.registry.remove_listener(&self.topic, self.listener);
        Some(lease.release().await)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let lease = self
            .lease
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(lease) = lease {
            lease.registry.remove_listener(&self.topic, self.listener);
            // Lease's own Drop releases the topic.
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("listener", &self.listener)
            .field("active", &self.is_active())
            .finish()
    }
}
