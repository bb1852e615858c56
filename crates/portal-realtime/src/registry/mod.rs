//! Reference-counted topic subscriptions with listener fan-out.
//!
//! The registry is the only owner of transport handles. Every topic has
//! at most one live transport subscription no matter how many watchers
//! share it. Registration bookkeeping happens inside a single critical
//! section that is never held across an `.await`, so interleaved
//! acquire/release sequences always observe a consistent table.

mod lease;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::{ChannelOpenError, ListenerError, TransportError};
use crate::transport::{PresenceSnapshot, SubscriptionHandle, TopicEvent, Transport, TransportEvent};

pub use lease::{Lease, Subscription};

use lease::{PendingAcquire, PendingListener};

/// Callback invoked for every event on a topic.
pub type Listener = Arc<dyn Fn(&TopicEvent) -> Result<(), ListenerError> + Send + Sync>;

/// Identifies one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// What a call to [`ChannelRegistry::release`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Other holders remain; carries the remaining count.
    Retained(usize),
    /// Last holder gone; the transport subscription was closed.
    Closed,
    /// Last holder gone while the open was still in flight; the
    /// subscription is closed as soon as the open settles.
    Cancelled,
    /// No registration existed. Nothing happened.
    Stale,
}

type OpenOutcome = Result<SubscriptionHandle, ChannelOpenError>;

enum Slot {
    Opening(watch::Receiver<Option<OpenOutcome>>),
    Open(SubscriptionHandle),
}

struct Registration {
    /// Distinguishes this registration from earlier ones on the same topic.
    generation: u64,
    ref_count: usize,
    slot: Slot,
    latest: Option<PresenceSnapshot>,
}

#[derive(Default)]
struct RegistryState {
    registrations: HashMap<String, Registration>,
    listeners: HashMap<String, Vec<(ListenerId, Listener)>>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    state: Mutex<RegistryState>,
    next_listener: AtomicU64,
    next_generation: AtomicU64,
    listener_failures: AtomicU64,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum Pending {
    Open(watch::Sender<Option<OpenOutcome>>, u64),
    Join(watch::Receiver<Option<OpenOutcome>>, u64),
}

/// Single point of truth for which topics are subscribed and by how many
/// holders. Cheap to clone; clones share the same table.
#[derive(Clone)]
pub struct ChannelRegistry {
    inner: Arc<Inner>,
}

impl ChannelRegistry {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                state: Mutex::new(RegistryState::default()),
                next_listener: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
                listener_failures: AtomicU64::new(0),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Acquire / release
    // -----------------------------------------------------------------------

    /// Take a reference on `topic`, joining it on the transport if this is
    /// the first one.
    ///
    /// Concurrent acquires of a topic whose open is still in flight wait
    /// for that open instead of starting another. On failure every waiter
    /// gets the same error and no registration remains.
    pub async fn acquire(&self, topic: &str) -> Result<SubscriptionHandle, ChannelOpenError> {
        let pending = {
            let mut state = self.inner.state();
            match state.registrations.get_mut(topic) {
                Some(reg) => {
                    reg.ref_count += 1;
                    match &reg.slot {
                        Slot::Open(handle) => {
                            debug!(topic = %topic, refs = reg.ref_count, "Topic already open");
                            return Ok(handle.clone());
                        }
                        Slot::Opening(rx) => {
                            debug!(topic = %topic, refs = reg.ref_count, "Joining in-flight open");
                            Pending::Join(rx.clone(), reg.generation)
                        }
                    }
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                    state.registrations.insert(
                        topic.to_string(),
                        Registration {
                            generation,
                            ref_count: 1,
                            slot: Slot::Opening(rx),
                            latest: None,
                        },
                    );
                    Pending::Open(tx, generation)
                }
            }
        };

        match pending {
            Pending::Open(tx, generation) => self.open(topic, tx, generation).await,
            Pending::Join(rx, generation) => self.join_open(topic, rx, generation).await,
        }
    }

    async fn open(
        &self,
        topic: &str,
        tx: watch::Sender<Option<OpenOutcome>>,
        generation: u64,
    ) -> Result<SubscriptionHandle, ChannelOpenError> {
        let guard = PendingAcquire::opener(self, topic, generation);
        debug!(topic = %topic, "Opening transport subscription");
        let result = self.inner.transport.open_topic(topic).await;
        guard.disarm();

        let (outcome, orphan) = match result {
            Ok(handle) => {
                let mut state = self.inner.state();
                match state.registrations.get_mut(topic) {
                    Some(reg) if reg.generation == generation && reg.ref_count > 0 => {
                        reg.slot = Slot::Open(handle.clone());
                        info!(topic = %topic, handle = %handle, refs = reg.ref_count, "Topic subscribed");
                        (Ok(handle), None)
                    }
                    _ => {
                        remove_generation(&mut state.registrations, topic, generation);
                        debug!(topic = %topic, "All holders released during open");
                        (
                            Err(ChannelOpenError::Cancelled {
                                topic: topic.to_string(),
                            }),
                            Some(handle),
                        )
                    }
                }
            }
            Err(source) => {
                remove_generation(&mut self.inner.state().registrations, topic, generation);
                warn!(topic = %topic, error = %source, "Failed to open topic");
                (
                    Err(ChannelOpenError::Transport {
                        topic: topic.to_string(),
                        source,
                    }),
                    None,
                )
            }
        };

        tx.send_replace(Some(outcome.clone()));

        if let Some(handle) = orphan {
            self.inner.transport.close_topic(handle).await;
        }
        outcome
    }

    async fn join_open(
        &self,
        topic: &str,
        mut rx: watch::Receiver<Option<OpenOutcome>>,
        generation: u64,
    ) -> Result<SubscriptionHandle, ChannelOpenError> {
        let guard = PendingAcquire::joiner(self, topic, generation);
        let settled = rx
            .wait_for(Option::is_some)
            .await
            .map(|outcome| outcome.clone());
        guard.disarm();

        match settled {
            Ok(Some(outcome)) => outcome,
            _ => Err(ChannelOpenError::Abandoned {
                topic: topic.to_string(),
            }),
        }
    }

    /// Drop one reference on `topic`. The last reference closes the
    /// transport subscription. Releasing an unknown topic is a no-op.
    pub async fn release(&self, topic: &str) -> Release {
        let (outcome, to_close) = self.release_locked(topic, None);
        if let Some(handle) = to_close {
            self.inner.transport.close_topic(handle).await;
        }
        outcome
    }

    /// Synchronous part of `release`; closing happens on a spawned task.
    /// Used from `Drop` impls.
    pub(crate) fn release_detached(&self, topic: &str) {
        self.release_detached_in(topic, None);
    }

    /// Like [`release_detached`](Self::release_detached), but only if the
    /// topic's registration is still `generation`. A reference taken on a
    /// registration that has since been torn down is not carried over to
    /// a newer one.
    pub(crate) fn release_detached_in(&self, topic: &str, generation: Option<u64>) {
        let (_, to_close) = self.release_locked(topic, generation);
        if let Some(handle) = to_close {
            self.spawn_close(handle);
        }
    }

    fn release_locked(
        &self,
        topic: &str,
        generation: Option<u64>,
    ) -> (Release, Option<SubscriptionHandle>) {
        let mut state = self.inner.state();
        let Some(reg) = state.registrations.get_mut(topic) else {
            debug!(topic = %topic, "Stale release ignored: no registration");
            return (Release::Stale, None);
        };

        if generation.is_some_and(|g| g != reg.generation) {
            debug!(topic = %topic, "Stale release ignored: registration was replaced");
            return (Release::Stale, None);
        }

        if reg.ref_count == 0 {
            // Only reachable while an open is in flight with no holders left.
            warn!(topic = %topic, "Stale release ignored: no remaining holders");
            return (Release::Stale, None);
        }

        reg.ref_count -= 1;
        if reg.ref_count > 0 {
            debug!(topic = %topic, refs = reg.ref_count, "Topic reference released");
            return (Release::Retained(reg.ref_count), None);
        }

        match &reg.slot {
            Slot::Opening(_) => {
                debug!(topic = %topic, "Last holder released during open");
                (Release::Cancelled, None)
            }
            Slot::Open(handle) => {
                let handle = handle.clone();
                state.registrations.remove(topic);
                info!(topic = %topic, handle = %handle, "Topic unsubscribed");
                (Release::Closed, Some(handle))
            }
        }
    }

    /// Forget an open whose future was dropped before the transport
    /// answered. Waiters see the dropped sender and fail with `Abandoned`.
    pub(crate) fn abandon_open(&self, topic: &str, generation: u64) {
        let mut state = self.inner.state();
        if matches!(
            state.registrations.get(topic),
            Some(reg) if reg.generation == generation && matches!(reg.slot, Slot::Opening(_))
        ) {
            state.registrations.remove(topic);
            warn!(topic = %topic, "Open abandoned before the transport answered");
        }
    }

    fn spawn_close(&self, handle: SubscriptionHandle) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let transport = Arc::clone(&self.inner.transport);
                runtime.spawn(async move { transport.close_topic(handle).await });
            }
            Err(_) => {
                error!(handle = %handle, "No async runtime available to close subscription");
            }
        }
    }

    /// Acquire `topic` and wrap the reference in a [`Lease`] that releases
    /// itself when dropped.
    pub async fn lease(&self, topic: &str) -> Result<Lease, ChannelOpenError> {
        self.acquire(topic).await?;
        Ok(Lease::new(self.clone(), topic))
    }

    /// Register `listener` and acquire `topic` in one step.
    ///
    /// The listener is in place before the join so the first snapshot is
    /// never missed. On failure the listener is removed again.
    pub async fn subscribe(
        &self,
        topic: &str,
        listener: Listener,
    ) -> Result<Subscription, ChannelOpenError> {
        let id = self.add_listener(topic, listener);
        let pending = PendingListener::new(self, topic, id);
        let lease = self.lease(topic).await?;
        pending.disarm();
        Ok(Subscription::new(lease, id))
    }

    // -----------------------------------------------------------------------
    // Listeners and dispatch
    // -----------------------------------------------------------------------

    pub fn add_listener(&self, topic: &str, listener: Listener) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner
            .state()
            .listeners
            .entry(topic.to_string())
            .or_default()
            .push((id, listener));
        debug!(topic = %topic, listener = %id, "Listener added");
        id
    }

    /// Returns false if the listener was not registered.
    pub fn remove_listener(&self, topic: &str, id: ListenerId) -> bool {
        let mut state = self.inner.state();
        let Some(listeners) = state.listeners.get_mut(topic) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        let removed = listeners.len() != before;
        if listeners.is_empty() {
            state.listeners.remove(topic);
        }
        if removed {
            debug!(topic = %topic, listener = %id, "Listener removed");
        }
        removed
    }

    /// Deliver `event` to every listener on `topic` in registration order.
    ///
    /// A listener that fails or panics is reported and skipped; the rest
    /// still receive the event. Returns how many listeners handled it
    /// successfully.
    pub fn dispatch(&self, topic: &str, event: &TopicEvent) -> usize {
        let listeners = {
            let mut state = self.inner.state();
            if let Some(reg) = state.registrations.get_mut(topic) {
                match event {
                    TopicEvent::Sync(snapshot) => reg.latest = Some(snapshot.clone()),
                    TopicEvent::Interrupted => reg.latest = None,
                    _ => {}
                }
            }
            state.listeners.get(topic).cloned().unwrap_or_default()
        };

        let mut delivered = 0;
        for (id, listener) in listeners {
            let result = catch_unwind(AssertUnwindSafe(|| listener(event)))
                .unwrap_or_else(|payload| Err(ListenerError::from_panic(payload)));
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    self.inner.listener_failures.fetch_add(1, Ordering::Relaxed);
                    error!(topic = %topic, listener = %id, error = %e, "Listener failed");
                }
            }
        }
        delivered
    }

    /// Pump transport events into [`dispatch`](Self::dispatch) until the
    /// transport's event stream ends.
    pub async fn run(&self, mut events: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Topic { topic, event } => {
                    self.dispatch(&topic, &event);
                }
                TransportEvent::Connected => {
                    info!("Realtime transport connected");
                }
                TransportEvent::Disconnected => {
                    warn!("Realtime transport disconnected; presence unknown until resync");
                    for topic in self.topics() {
                        self.dispatch(&topic, &TopicEvent::Interrupted);
                    }
                }
                TransportEvent::ChannelError { topic, message } => {
                    warn!(topic = %topic, message = %message, "Channel error");
                    self.dispatch(&topic, &TopicEvent::Interrupted);
                }
                TransportEvent::Error(message) => {
                    warn!(message = %message, "Transport error");
                }
            }
        }
        debug!("Transport event stream ended");
    }

    // -----------------------------------------------------------------------
    // Publishing through a live handle
    // -----------------------------------------------------------------------

    fn open_handle(&self, topic: &str) -> Result<SubscriptionHandle, TransportError> {
        match self.inner.state().registrations.get(topic).map(|reg| &reg.slot) {
            Some(Slot::Open(handle)) => Ok(handle.clone()),
            _ => Err(TransportError::NotSubscribed(topic.to_string())),
        }
    }

    pub async fn publish_self(
        &self,
        topic: &str,
        record: serde_json::Value,
    ) -> Result<(), TransportError> {
        let handle = self.open_handle(topic)?;
        self.inner.transport.publish_self(&handle, record).await
    }

    pub async fn retract_self(&self, topic: &str) -> Result<(), TransportError> {
        let handle = self.open_handle(topic)?;
        self.inner.transport.retract_self(&handle).await
    }

    pub async fn broadcast(
        &self,
        topic: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), TransportError> {
        let handle = self.open_handle(topic)?;
        self.inner.transport.broadcast(&handle, event, payload).await
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Number of holders of `topic` (0 when unregistered).
    pub fn ref_count(&self, topic: &str) -> usize {
        self.inner
            .state()
            .registrations
            .get(topic)
            .map_or(0, |reg| reg.ref_count)
    }

    /// True once the transport has confirmed the subscription.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        matches!(
            self.inner.state().registrations.get(topic).map(|reg| &reg.slot),
            Some(Slot::Open(_))
        )
    }

    /// Latest snapshot received on `topic` while it is registered.
    pub fn snapshot(&self, topic: &str) -> Option<PresenceSnapshot> {
        self.inner
            .state()
            .registrations
            .get(topic)
            .and_then(|reg| reg.latest.clone())
    }

    /// Registered topic names, opening or open.
    pub fn topics(&self) -> Vec<String> {
        self.inner.state().registrations.keys().cloned().collect()
    }

    pub fn listener_count(&self, topic: &str) -> usize {
        self.inner
            .state()
            .listeners
            .get(topic)
            .map_or(0, Vec::len)
    }

    /// Total listener failures since the registry was created.
    pub fn listener_failures(&self) -> u64 {
        self.inner.listener_failures.load(Ordering::Relaxed)
    }
}

fn remove_generation(registrations: &mut HashMap<String, Registration>, topic: &str, generation: u64) {
    if registrations
        .get(topic)
        .is_some_and(|reg| reg.generation == generation)
    {
        registrations.remove(topic);
    }
}
