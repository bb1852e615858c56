//! [`Transport`] implementation backed by the connection task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use portal_common::ClientId;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, warn};

use super::connection::connection_loop;
use super::types::{ChannelConfig, Command, RealtimeConfig, Reply};
use crate::error::TransportError;
use crate::transport::{SubscriptionHandle, Transport, TransportEvent};

/// Supabase Realtime connection usable as a [`Transport`].
///
/// All methods send commands to the background connection task and wait
/// for the server's reply, bounded by the configured timeouts.
pub struct SupabaseTransport {
    command_tx: mpsc::Sender<Command>,
    connected: Arc<RwLock<bool>>,
    config: Arc<RealtimeConfig>,
    client_id: ClientId,
    next_handle: AtomicU64,
    /// Handle id currently live per topic.
    live: Mutex<HashMap<String, u64>>,
}

impl SupabaseTransport {
    /// Create a transport and start the background connection.
    /// Returns `(transport, event_receiver)`; feed the receiver to
    /// [`ChannelRegistry::run`](crate::ChannelRegistry::run).
    ///
    /// `client_id` is this client's presence key on every channel.
    pub fn connect(
        config: RealtimeConfig,
        client_id: ClientId,
    ) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (command_tx, command_rx) = mpsc::channel(64);
        let connected = Arc::new(RwLock::new(false));
        let config = Arc::new(config);

        tokio::spawn(connection_loop(
            Arc::clone(&config),
            Arc::clone(&connected),
            event_tx,
            command_rx,
        ));

        (
            Self::with_channel(command_tx, connected, config, client_id),
            event_rx,
        )
    }

    fn with_channel(
        command_tx: mpsc::Sender<Command>,
        connected: Arc<RwLock<bool>>,
        config: Arc<RealtimeConfig>,
        client_id: ClientId,
    ) -> Self {
        Self {
            command_tx,
            connected,
            config,
            client_id,
            next_handle: AtomicU64::new(1),
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Check if connected.
    pub async fn is_connected(&self) -> bool {
        *self.connected.read().await
    }

    /// Leave every channel and close the socket. The connection task
    /// does not reconnect afterwards.
    pub async fn disconnect(&self) {
        let _ = self.command_tx.send(Command::Disconnect).await;
    }

    fn live(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_live(&self, handle: &SubscriptionHandle) -> Result<(), TransportError> {
        if self.live().get(handle.topic()) == Some(&handle.id()) {
            Ok(())
        } else {
            Err(TransportError::NotSubscribed(handle.topic().to_string()))
        }
    }

    async fn request(
        &self,
        topic: &str,
        timeout_secs: u64,
        build: impl FnOnce(Reply) -> Command,
    ) -> Result<serde_json::Value, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(build(tx))
            .await
            .map_err(|_| TransportError::Closed)?;

        match tokio::time::timeout(Duration::from_secs(timeout_secs), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout {
                topic: topic.to_string(),
                secs: timeout_secs,
            }),
        }
    }
}

#[async_trait]
impl Transport for SupabaseTransport {
    async fn open_topic(&self, topic: &str) -> Result<SubscriptionHandle, TransportError> {
        let config = ChannelConfig {
            broadcast_self: false,
            presence_key: self.client_id.to_string(),
        };
        let result = self
            .request(topic, self.config.join_timeout_secs, |reply| Command::Join {
                topic: topic.to_string(),
                config,
                reply,
            })
            .await;

        match result {
            Ok(_) => {
                let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
                self.live().insert(topic.to_string(), id);
                let handle = SubscriptionHandle::new(topic, id);
                debug!(handle = %handle, "Channel joined");
                Ok(handle)
            }
            Err(e) => {
                if matches!(e, TransportError::Timeout { .. }) {
                    warn!(topic = %topic, "Join timed out; leaving");
                    let _ = self
                        .command_tx
                        .send(Command::Leave {
                            topic: topic.to_string(),
                        })
                        .await;
                }
                Err(e)
            }
        }
    }

    async fn close_topic(&self, handle: SubscriptionHandle) {
        let current = {
            let mut live = self.live();
            if live.get(handle.topic()) == Some(&handle.id()) {
                live.remove(handle.topic());
                true
            } else {
                false
            }
        };
        if !current {
            debug!(handle = %handle, "Ignoring close of a superseded handle");
            return;
        }
        let _ = self
            .command_tx
            .send(Command::Leave {
                topic: handle.topic().to_string(),
            })
            .await;
    }

    async fn publish_self(
        &self,
        handle: &SubscriptionHandle,
        record: serde_json::Value,
    ) -> Result<(), TransportError> {
        self.check_live(handle)?;
        self.request(handle.topic(), self.config.push_timeout_secs, |reply| {
            Command::Track {
                topic: handle.topic().to_string(),
                payload: record,
                reply,
            }
        })
        .await
        .map(drop)
    }

    async fn retract_self(&self, handle: &SubscriptionHandle) -> Result<(), TransportError> {
        self.check_live(handle)?;
        self.request(handle.topic(), self.config.push_timeout_secs, |reply| {
            Command::Untrack {
                topic: handle.topic().to_string(),
                reply,
            }
        })
        .await
        .map(drop)
    }

    async fn broadcast(
        &self,
        handle: &SubscriptionHandle,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), TransportError> {
        self.check_live(handle)?;
        self.request(handle.topic(), self.config.push_timeout_secs, |reply| {
            Command::Broadcast {
                topic: handle.topic().to_string(),
                event: event.to_string(),
                payload,
                reply,
            }
        })
        .await
        .map(drop)
    }
}
