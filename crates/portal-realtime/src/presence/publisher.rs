//! Announces the local identity on the global presence topic.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::record::PresenceRecord;
use crate::registry::{ChannelRegistry, Lease};

/// Where a [`PresenceGuard`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishPhase {
    /// Waiting for the topic to open or the publish to be acknowledged.
    Starting,
    Published,
    /// Open or publish failed. Nothing is retried.
    Unpublished,
    Stopped,
}

struct GuardState {
    phase: PublishPhase,
    lease: Option<Lease>,
}

struct Shared {
    registry: ChannelRegistry,
    topic: String,
    identity: String,
    state: Mutex<GuardState>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Starts presence announcements on one topic.
#[derive(Clone)]
pub struct SelfPresencePublisher {
    registry: ChannelRegistry,
    topic: String,
}

impl SelfPresencePublisher {
    pub fn new(registry: ChannelRegistry, topic: impl Into<String>) -> Self {
        Self {
            registry,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Begin announcing `identity`. Returns at once; the open and publish
    /// run in the background.
    pub fn start(&self, identity: &str) -> PresenceGuard {
        let shared = Arc::new(Shared {
            registry: self.registry.clone(),
            topic: self.topic.clone(),
            identity: identity.to_string(),
            state: Mutex::new(GuardState {
                phase: PublishPhase::Starting,
                lease: None,
            }),
        });

        let task = tokio::spawn(announce(Arc::clone(&shared)));
        PresenceGuard {
            shared,
            task: Mutex::new(Some(task)),
        }
    }
}

async fn announce(shared: Arc<Shared>) {
    let topic = shared.topic.as_str();

    let lease = match shared.registry.lease(topic).await {
        Ok(lease) => lease,
        Err(e) => {
            warn!(topic = %topic, error = %e, "Presence topic did not open; staying unpublished");
            let mut state = shared.state();
            if state.phase == PublishPhase::Starting {
                state.phase = PublishPhase::Unpublished;
            }
            return;
        }
    };

    if shared.state().phase == PublishPhase::Stopped {
        debug!(topic = %topic, "Stopped before the topic opened; releasing");
        lease.release().await;
        return;
    }

    let published = match PresenceRecord::now(&shared.identity).to_value() {
        Ok(record) => shared.registry.publish_self(topic, record).await.map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };

    let leftover = {
        let mut state = shared.state();
        if state.phase == PublishPhase::Stopped {
            Some(lease)
        } else {
            state.phase = match &published {
                Ok(()) => PublishPhase::Published,
                Err(_) => PublishPhase::Unpublished,
            };
            state.lease = Some(lease);
            None
        }
    };

    match (&published, leftover) {
        (Ok(()), None) => {
            info!(topic = %topic, identity = %shared.identity, "Presence published");
        }
        (Err(e), None) => {
            warn!(topic = %topic, error = %e, "Presence publish failed; staying unpublished");
        }
        (_, Some(lease)) => {
            // stop() ran while the publish was in flight.
            if published.is_ok() {
                if let Err(e) = shared.registry.retract_self(topic).await {
                    warn!(topic = %topic, error = %e, "Failed to retract presence");
                }
            }
            lease.release().await;
        }
    }
}

/// Keeps the local identity announced until stopped or dropped.
pub struct PresenceGuard {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceGuard {
    pub fn state(&self) -> PublishPhase {
        self.shared.state().phase
    }

    pub fn topic(&self) -> &str {
        &self.shared.topic
    }

    pub fn identity(&self) -> &str {
        &self.shared.identity
    }

    /// Wait for the background announcement to finish, whatever its
    /// outcome.
    pub async fn settled(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(topic = %self.shared.topic, error = %e, "Presence task ended abnormally");
            }
        }
    }

    /// Retract the announcement if it was made and release the topic.
    /// Calling it again does nothing.
    pub async fn stop(&self) {
        let (previous, lease) = {
            let mut state = self.shared.state();
            if state.phase == PublishPhase::Stopped {
                return;
            }
            let previous = std::mem::replace(&mut state.phase, PublishPhase::Stopped);
            (previous, state.lease.take())
        };

        if previous == PublishPhase::Published {
            if let Err(e) = self.shared.registry.retract_self(&self.shared.topic).await {
                warn!(topic = %self.shared.topic, error = %e, "Failed to retract presence");
            }
        }
        if let Some(lease) = lease {
            lease.release().await;
        }
        info!(topic = %self.shared.topic, identity = %self.shared.identity, ?previous, "Presence stopped");
    }
}

impl Drop for PresenceGuard {
    fn drop(&mut self) {
        let (previous, lease) = {
            let mut state = self.shared.state();
            if state.phase == PublishPhase::Stopped {
                return;
            }
            let previous = std::mem::replace(&mut state.phase, PublishPhase::Stopped);
            (previous, state.lease.take())
        };

        let Some(lease) = lease else {
            // Still starting: the background task sees Stopped and cleans up.
            return;
        };
        if previous != PublishPhase::Published {
            return; // Lease drop releases.
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let registry = self.shared.registry.clone();
                let topic = self.shared.topic.clone();
                runtime.spawn(async move {
                    if let Err(e) = registry.retract_self(&topic).await {
                        warn!(topic = %topic, error = %e, "Failed to retract presence");
                    }
                    lease.release().await;
                });
            }
            Err(_) => {
                warn!(topic = %self.shared.topic, "Presence guard dropped outside a runtime; not retracted");
            }
        }
    }
}

impl std::fmt::Debug for PresenceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceGuard")
            .field("topic", &self.shared.topic)
            .field("identity", &self.shared.identity)
            .field("phase", &self.state())
            .finish()
    }
}
