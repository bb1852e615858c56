//! Per-topic online view with edge-triggered watchers.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use portal_common::new_correlation_id;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{ListenerError, RealtimeError};
use crate::registry::{ChannelRegistry, Release, Subscription};
use crate::transport::TopicEvent;

/// What the local view knows about one identity on one topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    /// No snapshot yet, or the connection dropped since the last one.
    Unknown,
    Online,
    Offline,
}

/// Calls `on_change` only when the "anyone present" flag flips.
struct EdgeTrigger<F> {
    last: Mutex<bool>,
    on_change: F,
}

impl<F: Fn(bool)> EdgeTrigger<F> {
    fn new(on_change: F) -> Self {
        Self {
            last: Mutex::new(false),
            on_change,
        }
    }

    /// Dispatch for a topic is serialized by the event pump, so the
    /// callback runs after the lock is dropped and may re-enter.
    fn update(&self, present: bool) {
        let changed = {
            let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *last, present) != present
        };
        if changed {
            (self.on_change)(present);
        }
    }
}

/// Handle returned by [`PresenceTracker::watch`].
#[derive(Debug)]
pub struct Unwatch {
    subscription: Subscription,
}

impl Unwatch {
    pub fn topic(&self) -> &str {
        self.subscription.topic()
    }

    pub fn is_active(&self) -> bool {
        self.subscription.is_active()
    }

    /// Stop watching. Further calls do nothing.
    pub async fn unwatch(&self) {
        if let Some(release) = self.subscription.cancel().await {
            debug!(topic = %self.topic(), ?release, "Stopped watching presence");
        }
    }
}

/// Answers "who is present on topic T" from transport snapshots.
#[derive(Clone)]
pub struct PresenceTracker {
    registry: ChannelRegistry,
}

impl PresenceTracker {
    pub fn new(registry: ChannelRegistry) -> Self {
        Self { registry }
    }

    /// Watch whether anyone is present on `topic`.
    ///
    /// `on_change` receives `true`/`false` only when the answer changes,
    /// starting from `false`. A lost connection counts as nobody present.
    pub async fn watch<F>(&self, topic: &str, on_change: F) -> Result<Unwatch, RealtimeError>
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let edge = Arc::new(EdgeTrigger::new(on_change));
        let listener_edge = Arc::clone(&edge);

        let subscription = self
            .registry
            .subscribe(
                topic,
                Arc::new(move |event: &TopicEvent| -> Result<(), ListenerError> {
                    match event {
                        TopicEvent::Sync(snapshot) => listener_edge.update(!snapshot.is_empty()),
                        TopicEvent::Interrupted => listener_edge.update(false),
                        _ => {}
                    }
                    Ok(())
                }),
            )
            .await?;

        // Topic shared with an earlier watcher: its snapshot already arrived.
        if let Some(snapshot) = self.registry.snapshot(topic) {
            edge.update(!snapshot.is_empty());
        }

        debug!(topic = %topic, "Watching presence");
        Ok(Unwatch { subscription })
    }

    /// One-shot query: the identities in the first snapshot seen after
    /// subscribing. Waits as long as it takes.
    pub async fn get_online_identities(
        &self,
        topic: &str,
    ) -> Result<HashSet<String>, RealtimeError> {
        self.query(topic, None).await
    }

    /// Like [`get_online_identities`](Self::get_online_identities) but gives
    /// up with [`RealtimeError::Timeout`] after `timeout`.
    pub async fn get_online_identities_within(
        &self,
        topic: &str,
        timeout: Duration,
    ) -> Result<HashSet<String>, RealtimeError> {
        self.query(topic, Some(timeout)).await
    }

    async fn query(
        &self,
        topic: &str,
        timeout: Option<Duration>,
    ) -> Result<HashSet<String>, RealtimeError> {
        let query = new_correlation_id();
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let listener_slot = Arc::clone(&slot);

        let subscription = self
            .registry
            .subscribe(
                topic,
                Arc::new(move |event: &TopicEvent| -> Result<(), ListenerError> {
                    if let TopicEvent::Sync(snapshot) = event {
                        resolve_once(&listener_slot, snapshot.identities());
                    }
                    Ok(())
                }),
            )
            .await?;

        if let Some(snapshot) = self.registry.snapshot(topic) {
            resolve_once(&slot, snapshot.identities());
        }

        debug!(topic = %topic, query = %query, "Waiting for presence snapshot");
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received.map_err(|_| closed(topic)),
                Err(_) => {
                    warn!(topic = %topic, query = %query, "Presence query timed out");
                    Err(RealtimeError::Timeout {
                        topic: topic.to_string(),
                        after: limit,
                    })
                }
            },
            None => rx.await.map_err(|_| closed(topic)),
        };

        if subscription.cancel().await == Some(Release::Closed) {
            debug!(topic = %topic, query = %query, "Query closed its subscription");
        }
        result
    }

    /// Identities in the latest snapshot, if one is known.
    pub fn online_identities(&self, topic: &str) -> Option<HashSet<String>> {
        self.registry
            .snapshot(topic)
            .map(|snapshot| snapshot.identities())
    }

    pub fn status_of(&self, topic: &str, identity: &str) -> PresenceStatus {
        match self.registry.snapshot(topic) {
            None => PresenceStatus::Unknown,
            Some(snapshot) if snapshot.contains(identity) => PresenceStatus::Online,
            Some(_) => PresenceStatus::Offline,
        }
    }
}

fn resolve_once(slot: &Mutex<Option<oneshot::Sender<HashSet<String>>>>, ids: HashSet<String>) {
    let sender = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(sender) = sender {
        let _ = sender.send(ids);
    }
}

fn closed(topic: &str) -> RealtimeError {
    RealtimeError::Closed {
        topic: topic.to_string(),
    }
}
