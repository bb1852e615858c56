//! A connected realtime session: transport, registry and event pump.

use std::sync::Arc;
use std::time::Duration;

use portal_common::{ClientId, PortalError};
use portal_config::PortalConfig;
use portal_realtime::{ChannelRegistry, RealtimeConfig, SupabaseTransport};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long shutdown waits for the transport to drain.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Map the `[realtime]` config section onto transport settings.
pub fn realtime_config(config: &PortalConfig) -> RealtimeConfig {
    let settings = &config.realtime;
    RealtimeConfig {
        project_ref: settings.project_ref.clone(),
        api_key: settings.api_key.clone(),
        access_token: settings.access_token.clone(),
        heartbeat_interval_secs: u64::from(settings.heartbeat_interval),
        reconnect_delay_secs: u64::from(settings.reconnect_delay),
        max_reconnect_delay_secs: u64::from(settings.max_reconnect_delay),
        join_timeout_secs: u64::from(settings.join_timeout),
        push_timeout_secs: u64::from(settings.push_timeout),
    }
}

/// `None` means wait forever.
pub fn query_timeout(config: &PortalConfig, override_secs: Option<u64>) -> Option<Duration> {
    match override_secs.unwrap_or(u64::from(config.presence.query_timeout)) {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    }
}

/// Everything a command needs to talk to the realtime service.
pub struct Session {
    pub registry: ChannelRegistry,
    transport: Arc<SupabaseTransport>,
    pump: JoinHandle<()>,
}

impl Session {
    /// Start the transport and the registry's event pump.
    pub fn connect(config: &PortalConfig) -> Result<Self, PortalError> {
        if !config.realtime.is_configured() {
            return Err(PortalError::Other(
                "realtime.project_ref and realtime.api_key must be set".into(),
            ));
        }

        let client_id = ClientId::new();
        info!(client = %client_id, project = %config.realtime.project_ref, "Starting realtime session");
        let (transport, events) = SupabaseTransport::connect(realtime_config(config), client_id);
        let transport = Arc::new(transport);
        let registry = ChannelRegistry::new(transport.clone());

        let pump_registry = registry.clone();
        let pump = tokio::spawn(async move { pump_registry.run(events).await });

        Ok(Self {
            registry,
            transport,
            pump,
        })
    }

    /// Disconnect and wait briefly for the event pump to finish.
    pub async fn shutdown(self) {
        self.transport.disconnect().await;
        match tokio::time::timeout(SHUTDOWN_GRACE, self.pump).await {
            Ok(_) => debug!("Event pump finished"),
            Err(_) => warn!("Event pump still running after shutdown grace period"),
        }
    }
}
