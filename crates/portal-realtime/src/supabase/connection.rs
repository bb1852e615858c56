//! Background WebSocket connection loop with auto-reconnect.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use super::handler::{handle_phoenix_message, track_message, ChannelEntry, ConnState, ReplyKind};
use super::types::{Command, PhoenixMessage, RealtimeConfig};
use crate::error::TransportError;
use crate::transport::TransportEvent;

// ---------------------------------------------------------------------------
// Ref Counter
// ---------------------------------------------------------------------------

/// Monotonically increasing ref counter for Phoenix messages.
static REF_COUNTER: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_ref() -> String {
    REF_COUNTER.fetch_add(1, Ordering::Relaxed).to_string()
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// Connection Loop
// ---------------------------------------------------------------------------

/// Background task managing the WebSocket connection with auto-reconnect.
///
/// Runs until [`Command::Disconnect`] or until every command sender is
/// dropped.
pub(crate) async fn connection_loop(
    config: Arc<RealtimeConfig>,
    connected: Arc<RwLock<bool>>,
    event_tx: mpsc::Sender<TransportEvent>,
    command_rx: mpsc::Receiver<Command>,
) {
    let command_rx = Arc::new(Mutex::new(command_rx));
    let state = Arc::new(Mutex::new(ConnState::default()));
    let mut reconnect_delay = config.reconnect_delay_secs;

    loop {
        let url = config.ws_url();
        info!(url = %url.split('?').next().unwrap_or(""), "Connecting to Supabase Realtime");

        match tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(&url)).await {
            Ok(Ok((ws_stream, _))) => {
                reconnect_delay = config.reconnect_delay_secs;
                *connected.write().await = true;
                let _ = event_tx.send(TransportEvent::Connected).await;

                let (ws_write, mut ws_read) = ws_stream.split();
                let ws_write = Arc::new(Mutex::new(ws_write));

                // Rejoin previously-joined channels.
                let rejoins = state
                    .lock()
                    .await
                    .rejoin_messages(config.access_token.as_deref());
                for msg in &rejoins {
                    debug!(topic = %msg.topic, "Rejoining channel");
                    send_message(&ws_write, msg).await;
                }

                let heartbeat_handle = tokio::spawn(heartbeat_task(
                    Arc::clone(&ws_write),
                    config.heartbeat_interval_secs,
                ));
                let mut cmd_handle = tokio::spawn(command_forwarder(
                    Arc::clone(&command_rx),
                    Arc::clone(&ws_write),
                    Arc::clone(&state),
                    Arc::clone(&config),
                ));

                // Process incoming messages until the socket or the command
                // side ends.
                loop {
                    tokio::select! {
                        incoming = ws_read.next() => match incoming {
                            Some(Ok(WsMessage::Text(text))) => {
                                let Ok(msg) = serde_json::from_str::<PhoenixMessage>(&text) else {
                                    debug!(text = %text, "Unrecognized message from Supabase");
                                    continue;
                                };
                                let handled = {
                                    let mut state = state.lock().await;
                                    handle_phoenix_message(&msg, &mut state, Utc::now())
                                };
                                for out in &handled.outgoing {
                                    send_message(&ws_write, out).await;
                                }
                                for event in handled.events {
                                    let _ = event_tx.send(event).await;
                                }
                            }
                            Some(Ok(WsMessage::Close(_))) => {
                                info!("Supabase Realtime closed connection");
                                break;
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "WebSocket error");
                                break;
                            }
                            Some(Ok(_)) => {}
                            None => break,
                        },
                        _ = &mut cmd_handle => break,
                    }
                }

                // Cleanup.
                heartbeat_handle.abort();
                cmd_handle.abort();
                *connected.write().await = false;
                state.lock().await.connection_lost();
                let _ = event_tx.send(TransportEvent::Disconnected).await;
            }
            Ok(Err(e)) => {
                error!(error = %e, "Failed to connect to Supabase Realtime");
                let _ = event_tx
                    .send(TransportEvent::Error(format!("Connection failed: {e}")))
                    .await;
            }
            Err(_elapsed) => {
                error!("WebSocket connection timed out after 15s");
                let _ = event_tx
                    .send(TransportEvent::Error(
                        "Connection timed out after 15s".to_string(),
                    ))
                    .await;
            }
        }

        if state.lock().await.shutdown {
            break;
        }

        // Exponential backoff reconnect.
        info!(
            delay = reconnect_delay,
            "Reconnecting in {} seconds", reconnect_delay
        );
        tokio::time::sleep(Duration::from_secs(reconnect_delay)).await;
        reconnect_delay = (reconnect_delay * 2).min(config.max_reconnect_delay_secs);
    }
    info!("Supabase Realtime connection loop stopped");
}

/// Write one message; false if the socket is gone.
async fn send_message<S>(ws_write: &Arc<Mutex<S>>, msg: &PhoenixMessage) -> bool
where
    S: futures_util::Sink<WsMessage> + Unpin,
{
    let json = match serde_json::to_string(msg) {
        Ok(json) => json,
        Err(e) => {
            error!(error = %e, event = %msg.event, "Failed to encode Phoenix message");
            return false;
        }
    };
    let mut writer = ws_write.lock().await;
    writer.send(WsMessage::Text(json.into())).await.is_ok()
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

async fn heartbeat_task<S>(ws_write: Arc<Mutex<S>>, interval_secs: u64)
where
    S: futures_util::Sink<WsMessage> + Unpin,
{
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    loop {
        interval.tick().await;
        let msg = PhoenixMessage {
            topic: "phoenix".to_string(),
            event: "heartbeat".to_string(),
            payload: serde_json::json!({}),
            msg_ref: Some(next_ref()),
        };
        if !send_message(&ws_write, &msg).await {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Command Forwarder
// ---------------------------------------------------------------------------

async fn command_forwarder<S>(
    cmd_rx: Arc<Mutex<mpsc::Receiver<Command>>>,
    cmd_write: Arc<Mutex<S>>,
    state: Arc<Mutex<ConnState>>,
    config: Arc<RealtimeConfig>,
) where
    S: futures_util::Sink<WsMessage> + Unpin,
{
    let mut rx = cmd_rx.lock().await;
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Join {
                topic,
                config: channel,
                reply,
            } => {
                if reply.is_closed() {
                    debug!(topic = %topic, "Join abandoned before it was sent");
                    continue;
                }
                let msg_ref = next_ref();
                let msg = PhoenixMessage::channel(
                    &topic,
                    "phx_join",
                    channel.to_join_payload(config.access_token.as_deref()),
                    msg_ref.clone(),
                );
                {
                    let mut state = state.lock().await;
                    state.channels.insert(topic.clone(), ChannelEntry::new(channel));
                    state.expect_reply(msg_ref, &topic, ReplyKind::Join, Some(reply));
                }
                debug!(topic = %topic, "Joining channel");
                send_message(&cmd_write, &msg).await;
            }
            Command::Leave { topic } => {
                {
                    let mut state = state.lock().await;
                    state.channels.remove(&topic);
                    state.presence.remove(&topic);
                }
                let msg =
                    PhoenixMessage::channel(&topic, "phx_leave", serde_json::json!({}), next_ref());
                debug!(topic = %topic, "Leaving channel");
                send_message(&cmd_write, &msg).await;
            }
            Command::Broadcast {
                topic,
                event,
                payload,
                reply,
            } => {
                if !is_joined(&state, &topic).await {
                    let _ = reply.send(Err(TransportError::NotSubscribed(topic)));
                    continue;
                }
                let msg = PhoenixMessage::channel(
                    &topic,
                    "broadcast",
                    serde_json::json!({
                        "type": "broadcast",
                        "event": event,
                        "payload": payload
                    }),
                    next_ref(),
                );
                // Broadcasts are not acked; a completed write is success.
                let result = if send_message(&cmd_write, &msg).await {
                    Ok(serde_json::Value::Null)
                } else {
                    Err(TransportError::Closed)
                };
                let _ = reply.send(result);
            }
            Command::Track {
                topic,
                payload,
                reply,
            } => {
                let msg_ref = next_ref();
                {
                    let mut state = state.lock().await;
                    match state.channels.get_mut(&topic) {
                        Some(channel) if channel.joined => {
                            // Stored for re-tracking on reconnect.
                            channel.presence_payload = Some(payload.clone());
                        }
                        _ => {
                            let _ = reply.send(Err(TransportError::NotSubscribed(topic)));
                            continue;
                        }
                    }
                    state.expect_reply(msg_ref.clone(), &topic, ReplyKind::Push, Some(reply));
                }
                send_message(&cmd_write, &track_message(&topic, payload, msg_ref)).await;
            }
            Command::Untrack { topic, reply } => {
                let msg_ref = next_ref();
                {
                    let mut state = state.lock().await;
                    match state.channels.get_mut(&topic) {
                        Some(channel) if channel.joined => channel.presence_payload = None,
                        _ => {
                            let _ = reply.send(Err(TransportError::NotSubscribed(topic)));
                            continue;
                        }
                    }
                    state.expect_reply(msg_ref.clone(), &topic, ReplyKind::Push, Some(reply));
                }
                let msg = PhoenixMessage::channel(
                    &topic,
                    "presence",
                    serde_json::json!({
                        "type": "presence",
                        "event": "untrack"
                    }),
                    msg_ref,
                );
                send_message(&cmd_write, &msg).await;
            }
            Command::Disconnect => {
                // Send phx_leave for all channels, then close.
                let topics: Vec<String> = {
                    let mut state = state.lock().await;
                    state.shutdown = true;
                    state.channels.drain().map(|(topic, _)| topic).collect()
                };
                for topic in topics {
                    let msg = PhoenixMessage::channel(
                        &topic,
                        "phx_leave",
                        serde_json::json!({}),
                        next_ref(),
                    );
                    send_message(&cmd_write, &msg).await;
                }
                let mut writer = cmd_write.lock().await;
                let _ = writer.send(WsMessage::Close(None)).await;
                return; // Exit the command forwarder
            }
        }
    }
    // Every sender is gone.
    state.lock().await.shutdown = true;
}

async fn is_joined(state: &Mutex<ConnState>, topic: &str) -> bool {
    state
        .lock()
        .await
        .channels
        .get(topic)
        .is_some_and(|channel| channel.joined)
}
