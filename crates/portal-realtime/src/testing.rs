//! In-memory transport for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;

use crate::error::TransportError;
use crate::transport::{PresenceEntry, PresenceSnapshot, SubscriptionHandle, Transport};

#[derive(Default)]
struct FakeLog {
    opens: Vec<String>,
    closes: Vec<String>,
    live: HashMap<String, usize>,
    max_live: HashMap<String, usize>,
    failing: HashSet<String>,
    fail_publish: bool,
    published: Vec<(String, serde_json::Value)>,
    retracted: Vec<String>,
    broadcasts: Vec<(String, String, serde_json::Value)>,
}

/// Records every call and can hold opens until told to proceed.
pub(crate) struct FakeTransport {
    log: Mutex<FakeLog>,
    gate: watch::Sender<bool>,
    next_id: AtomicU64,
}

impl FakeTransport {
    pub(crate) fn new() -> Arc<Self> {
        let (gate, _) = watch::channel(true);
        Arc::new(Self {
            log: Mutex::new(FakeLog::default()),
            gate,
            next_id: AtomicU64::new(1),
        })
    }

    /// Opens block until [`release_opens`](Self::release_opens).
    pub(crate) fn hold_opens(&self) {
        self.gate.send_replace(false);
    }

    pub(crate) fn release_opens(&self) {
        self.gate.send_replace(true);
    }

    pub(crate) fn fail_opens_for(&self, topic: &str) {
        self.log.lock().unwrap().failing.insert(topic.to_string());
    }

    pub(crate) fn heal(&self, topic: &str) {
        self.log.lock().unwrap().failing.remove(topic);
    }

    pub(crate) fn fail_publishes(&self) {
        self.log.lock().unwrap().fail_publish = true;
    }

    pub(crate) fn open_count(&self, topic: &str) -> usize {
        self.log.lock().unwrap().opens.iter().filter(|t| *t == topic).count()
    }

    pub(crate) fn close_count(&self, topic: &str) -> usize {
        self.log.lock().unwrap().closes.iter().filter(|t| *t == topic).count()
    }

    pub(crate) fn live(&self, topic: &str) -> usize {
        self.log.lock().unwrap().live.get(topic).copied().unwrap_or(0)
    }

    pub(crate) fn max_live(&self, topic: &str) -> usize {
        self.log.lock().unwrap().max_live.get(topic).copied().unwrap_or(0)
    }

    pub(crate) fn published(&self) -> Vec<(String, serde_json::Value)> {
        self.log.lock().unwrap().published.clone()
    }

    pub(crate) fn retracted(&self) -> Vec<String> {
        self.log.lock().unwrap().retracted.clone()
    }

    pub(crate) fn broadcasts(&self) -> Vec<(String, String, serde_json::Value)> {
        self.log.lock().unwrap().broadcasts.clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open_topic(&self, topic: &str) -> Result<SubscriptionHandle, TransportError> {
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        let mut log = self.log.lock().unwrap();
        log.opens.push(topic.to_string());
        if log.failing.contains(topic) {
            return Err(TransportError::Rejected {
                topic: topic.to_string(),
                reason: "fake failure".into(),
            });
        }
        let live = log.live.entry(topic.to_string()).or_default();
        *live += 1;
        let live = *live;
        let max = log.max_live.entry(topic.to_string()).or_default();
        *max = (*max).max(live);
        Ok(SubscriptionHandle::new(
            topic,
            self.next_id.fetch_add(1, Ordering::Relaxed),
        ))
    }

    async fn close_topic(&self, handle: SubscriptionHandle) {
        let mut log = self.log.lock().unwrap();
        log.closes.push(handle.topic().to_string());
        if let Some(live) = log.live.get_mut(handle.topic()) {
            *live = live.saturating_sub(1);
        }
    }

    async fn publish_self(
        &self,
        handle: &SubscriptionHandle,
        record: serde_json::Value,
    ) -> Result<(), TransportError> {
        let mut log = self.log.lock().unwrap();
        if log.fail_publish {
            return Err(TransportError::Timeout {
                topic: handle.topic().to_string(),
                secs: 10,
            });
        }
        log.published.push((handle.topic().to_string(), record));
        Ok(())
    }

    async fn retract_self(&self, handle: &SubscriptionHandle) -> Result<(), TransportError> {
        self.log
            .lock()
            .unwrap()
            .retracted
            .push(handle.topic().to_string());
        Ok(())
    }

    async fn broadcast(
        &self,
        handle: &SubscriptionHandle,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), TransportError> {
        self.log.lock().unwrap().broadcasts.push((
            handle.topic().to_string(),
            event.to_string(),
            payload,
        ));
        Ok(())
    }
}

/// Snapshot with one presence key per identity.
pub(crate) fn snapshot_of(identities: &[&str]) -> PresenceSnapshot {
    let now = Utc::now();
    PresenceSnapshot::new(
        identities
            .iter()
            .map(|id| (format!("key-{id}"), vec![PresenceEntry::new(*id, now)]))
            .collect(),
    )
}

/// Let spawned tasks and pending wakeups run.
pub(crate) async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
