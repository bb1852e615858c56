//! Incoming Phoenix message handling.
//!
//! The handler is a plain function over [`ConnState`]: it returns the
//! events to report and the messages to write, and the connection task
//! does the I/O.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::connection::next_ref;
use super::presence_state::{entries, parse_presence_map, PresenceState};
use super::types::{ChannelConfig, PhoenixMessage, Reply, TOPIC_PREFIX};
use crate::error::TransportError;
use crate::transport::{TopicEvent, TransportEvent};

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

/// A channel this client wants joined, re-joined after every reconnect.
#[derive(Debug)]
pub(crate) struct ChannelEntry {
    pub(crate) config: ChannelConfig,
    pub(crate) presence_payload: Option<serde_json::Value>,
    pub(crate) joined: bool,
}

impl ChannelEntry {
    pub(crate) fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            presence_payload: None,
            joined: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplyKind {
    Join,
    Push,
}

/// A push waiting for its `phx_reply`. Re-joins and re-tracks after a
/// reconnect have nobody waiting on them.
#[derive(Debug)]
pub(crate) struct PendingReply {
    topic: String,
    kind: ReplyKind,
    reply: Option<Reply>,
}

#[derive(Debug, Default)]
pub(crate) struct ConnState {
    pub(crate) channels: HashMap<String, ChannelEntry>,
    pub(crate) pending: HashMap<String, PendingReply>,
    pub(crate) presence: HashMap<String, PresenceState>,
    pub(crate) shutdown: bool,
}

impl ConnState {
    pub(crate) fn expect_reply(
        &mut self,
        msg_ref: String,
        topic: &str,
        kind: ReplyKind,
        reply: Option<Reply>,
    ) {
        // Callers that timed out no longer listen.
        self.pending
            .retain(|_, p| p.reply.as_ref().map_or(true, |r| !r.is_closed()));
        self.pending.insert(
            msg_ref,
            PendingReply {
                topic: topic.to_string(),
                kind,
                reply,
            },
        );
    }

    /// The socket is gone: fail every waiter and forget server state.
    pub(crate) fn connection_lost(&mut self) {
        for (_, pending) in self.pending.drain() {
            if let Some(reply) = pending.reply {
                let _ = reply.send(Err(TransportError::Closed));
            }
        }
        for channel in self.channels.values_mut() {
            channel.joined = false;
        }
        self.presence.clear();
    }

    /// Join messages for every known channel, registered as pending.
    pub(crate) fn rejoin_messages(&mut self, access_token: Option<&str>) -> Vec<PhoenixMessage> {
        let joins: Vec<(String, PhoenixMessage)> = self
            .channels
            .iter()
            .map(|(topic, channel)| {
                let msg_ref = next_ref();
                let msg = PhoenixMessage::channel(
                    topic,
                    "phx_join",
                    channel.config.to_join_payload(access_token),
                    msg_ref.clone(),
                );
                (topic.clone(), msg)
            })
            .collect();

        joins
            .into_iter()
            .map(|(topic, msg)| {
                if let Some(msg_ref) = msg.msg_ref.clone() {
                    self.expect_reply(msg_ref, &topic, ReplyKind::Join, None);
                }
                msg
            })
            .collect()
    }
}

/// Presence track push for `topic`.
pub(crate) fn track_message(topic: &str, payload: serde_json::Value, msg_ref: String) -> PhoenixMessage {
    PhoenixMessage::channel(
        topic,
        "presence",
        serde_json::json!({
            "type": "presence",
            "event": "track",
            "payload": payload
        }),
        msg_ref,
    )
}

/// What handling one message produced.
#[derive(Debug, Default)]
pub(crate) struct Handled {
    pub(crate) events: Vec<TransportEvent>,
    pub(crate) outgoing: Vec<PhoenixMessage>,
}

impl Handled {
    fn topic_event(&mut self, topic: &str, event: TopicEvent) {
        self.events.push(TransportEvent::Topic {
            topic: topic.to_string(),
            event,
        });
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Extract the short topic name from a Phoenix topic (strip "realtime:" prefix).
fn strip_topic_prefix(topic: &str) -> &str {
    topic.strip_prefix(TOPIC_PREFIX).unwrap_or(topic)
}

fn reply_reason(payload: &serde_json::Value) -> String {
    let response = payload.get("response");
    response
        .and_then(|r| r.get("reason"))
        .or_else(|| response.and_then(|r| r.get("message")))
        .and_then(|r| r.as_str())
        .unwrap_or("unknown error")
        .to_string()
}

// ---------------------------------------------------------------------------
// Message Handler
// ---------------------------------------------------------------------------

/// Handle a single incoming Phoenix message.
pub(crate) fn handle_phoenix_message(
    msg: &PhoenixMessage,
    state: &mut ConnState,
    received_at: DateTime<Utc>,
) -> Handled {
    let topic = strip_topic_prefix(&msg.topic);
    let mut out = Handled::default();

    match msg.event.as_str() {
        "phx_reply" => handle_reply(msg, state, &mut out),
        "phx_error" | "phx_close" => {
            let Some(channel) = state.channels.get_mut(topic) else {
                debug!(topic = %topic, event = %msg.event, "Closed channel we already left");
                return out;
            };
            channel.joined = false;
            state.presence.remove(topic);
            let message = if msg.event == "phx_error" {
                warn!(topic = %topic, "Channel error");
                "Channel error"
            } else {
                info!(topic = %topic, "Channel closed by server");
                "Channel closed"
            };
            out.events.push(TransportEvent::ChannelError {
                topic: topic.to_string(),
                message: message.to_string(),
            });
        }
        "broadcast" => {
            // Extract the inner event name and payload.
            let inner_event = msg
                .payload
                .get("event")
                .and_then(|e| e.as_str())
                .unwrap_or("unknown")
                .to_string();
            let inner_payload = msg
                .payload
                .get("payload")
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            debug!(topic = %topic, event = %inner_event, "Broadcast received");
            out.topic_event(
                topic,
                TopicEvent::Broadcast {
                    event: inner_event,
                    payload: inner_payload,
                },
            );
        }
        "presence_state" => {
            let presence = state.presence.entry(topic.to_string()).or_default();
            presence.replace(parse_presence_map(&msg.payload));
            let snapshot = presence.snapshot(received_at);
            debug!(topic = %topic, keys = snapshot.keys().count(), "Presence state received");
            out.topic_event(topic, TopicEvent::Sync(snapshot));
        }
        "presence_diff" => {
            let joins = msg
                .payload
                .get("joins")
                .map(parse_presence_map)
                .unwrap_or_default();
            let leaves = msg
                .payload
                .get("leaves")
                .map(parse_presence_map)
                .unwrap_or_default();
            debug!(
                topic = %topic,
                joins = joins.len(),
                leaves = leaves.len(),
                "Presence diff received"
            );

            let presence = state.presence.entry(topic.to_string()).or_default();
            presence.apply_diff(&joins, &leaves);
            let snapshot = presence.snapshot(received_at);

            for (key, metas) in &joins {
                out.topic_event(
                    topic,
                    TopicEvent::Join {
                        key: key.clone(),
                        entries: entries(key, metas, received_at),
                    },
                );
            }
            for (key, metas) in &leaves {
                out.topic_event(
                    topic,
                    TopicEvent::Leave {
                        key: key.clone(),
                        entries: entries(key, metas, received_at),
                    },
                );
            }
            out.topic_event(topic, TopicEvent::Sync(snapshot));
        }
        _ => {
            debug!(
                topic = %topic,
                event = %msg.event,
                "Unhandled Phoenix event"
            );
        }
    }
    out
}

fn handle_reply(msg: &PhoenixMessage, state: &mut ConnState, out: &mut Handled) {
    let Some(pending) = msg.msg_ref.as_ref().and_then(|r| state.pending.remove(r)) else {
        // Heartbeat acks and broadcasts nobody waits on.
        return;
    };
    let status = msg
        .payload
        .get("status")
        .and_then(|s| s.as_str())
        .unwrap_or("error");
    let topic = pending.topic.as_str();

    let result = if status == "ok" {
        debug!(topic = %topic, kind = ?pending.kind, "Channel reply: ok");
        if pending.kind == ReplyKind::Join {
            if let Some(channel) = state.channels.get_mut(topic) {
                channel.joined = true;
                if let Some(payload) = channel.presence_payload.clone() {
                    // Re-track after a re-join so others see us again.
                    let msg_ref = next_ref();
                    out.outgoing
                        .push(track_message(topic, payload, msg_ref.clone()));
                    state.expect_reply(msg_ref, topic, ReplyKind::Push, None);
                }
            }
        }
        Ok(msg
            .payload
            .get("response")
            .cloned()
            .unwrap_or(serde_json::Value::Null))
    } else {
        let reason = reply_reason(&msg.payload);
        warn!(topic = %topic, status = %status, reason = %reason, "Channel reply error");
        if pending.kind == ReplyKind::Join {
            if pending.reply.is_some() {
                state.channels.remove(topic);
            } else {
                out.events.push(TransportEvent::ChannelError {
                    topic: topic.to_string(),
                    message: format!("rejoin refused: {reason}"),
                });
            }
        }
        Err(TransportError::Rejected {
            topic: topic.to_string(),
            reason,
        })
    };

    if let Some(reply) = pending.reply {
        let _ = reply.send(result);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::oneshot;

    use super::*;

    fn incoming(topic: &str, event: &str, payload: serde_json::Value, msg_ref: Option<&str>) -> PhoenixMessage {
        PhoenixMessage {
            topic: format!("realtime:{topic}"),
            event: event.to_string(),
            payload,
            msg_ref: msg_ref.map(str::to_string),
        }
    }

    fn channel() -> ChannelEntry {
        ChannelEntry::new(ChannelConfig {
            broadcast_self: false,
            presence_key: "client-1".into(),
        })
    }

    fn joined_state(topic: &str) -> ConnState {
        let mut state = ConnState::default();
        let mut entry = channel();
        entry.joined = true;
        state.channels.insert(topic.to_string(), entry);
        state
    }

    #[test]
    fn join_reply_routed_by_ref() {
        let mut state = ConnState::default();
        state.channels.insert("dm:1".into(), channel());
        let (tx, mut rx) = oneshot::channel();
        state.expect_reply("5".into(), "dm:1", ReplyKind::Join, Some(tx));

        // Unrelated ref is ignored.
        handle_phoenix_message(
            &incoming("dm:1", "phx_reply", json!({ "status": "ok", "response": {} }), Some("4")),
            &mut state,
            Utc::now(),
        );
        assert!(rx.try_recv().is_err());

        handle_phoenix_message(
            &incoming("dm:1", "phx_reply", json!({ "status": "ok", "response": {} }), Some("5")),
            &mut state,
            Utc::now(),
        );
        assert!(rx.try_recv().unwrap().is_ok());
        assert!(state.channels["dm:1"].joined);
        assert!(state.pending.is_empty());
    }

    #[test]
    fn rejected_join_forgets_channel() {
        let mut state = ConnState::default();
        state.channels.insert("dm:1".into(), channel());
        let (tx, mut rx) = oneshot::channel();
        state.expect_reply("9".into(), "dm:1", ReplyKind::Join, Some(tx));

        handle_phoenix_message(
            &incoming(
                "dm:1",
                "phx_reply",
                json!({ "status": "error", "response": { "reason": "unauthorized" } }),
                Some("9"),
            ),
            &mut state,
            Utc::now(),
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(TransportError::Rejected {
                topic: "dm:1".into(),
                reason: "unauthorized".into()
            })
        );
        assert!(!state.channels.contains_key("dm:1"));
    }

    #[test]
    fn rejoin_retracks_presence() {
        let mut state = ConnState::default();
        let mut entry = channel();
        entry.presence_payload = Some(json!({ "user_id": "alice" }));
        state.channels.insert("global-presence".into(), entry);

        let joins = state.rejoin_messages(Some("jwt"));
        assert_eq!(joins.len(), 1);
        assert_eq!(joins[0].payload["access_token"], "jwt");
        let join_ref = joins[0].msg_ref.clone().unwrap();

        let handled = handle_phoenix_message(
            &incoming("global-presence", "phx_reply", json!({ "status": "ok" }), Some(&join_ref)),
            &mut state,
            Utc::now(),
        );
        assert_eq!(handled.outgoing.len(), 1);
        assert_eq!(handled.outgoing[0].event, "presence");
        assert_eq!(handled.outgoing[0].payload["payload"]["user_id"], "alice");
        assert_eq!(state.pending.len(), 1);
    }

    #[test]
    fn connection_lost_fails_waiters() {
        let mut state = joined_state("dm:1");
        let (tx, mut rx) = oneshot::channel();
        state.expect_reply("1".into(), "dm:1", ReplyKind::Push, Some(tx));
        state.presence.insert("dm:1".into(), PresenceState::default());

        state.connection_lost();
        assert_eq!(rx.try_recv().unwrap(), Err(TransportError::Closed));
        assert!(!state.channels["dm:1"].joined);
        assert!(state.presence.is_empty());
    }

    #[test]
    fn presence_diff_emits_join_leave_and_sync() {
        let mut state = joined_state("global-presence");
        handle_phoenix_message(
            &incoming(
                "global-presence",
                "presence_state",
                json!({ "c1": { "metas": [{ "user_id": "alice", "phx_ref": "a" }] } }),
                None,
            ),
            &mut state,
            Utc::now(),
        );

        let handled = handle_phoenix_message(
            &incoming(
                "global-presence",
                "presence_diff",
                json!({
                    "joins": { "c2": { "metas": [{ "user_id": "bob", "phx_ref": "b" }] } },
                    "leaves": { "c1": { "metas": [{ "user_id": "alice", "phx_ref": "a" }] } },
                }),
                None,
            ),
            &mut state,
            Utc::now(),
        );

        let events: Vec<&TopicEvent> = handled
            .events
            .iter()
            .map(|e| match e {
                TransportEvent::Topic { topic, event } => {
                    assert_eq!(topic, "global-presence");
                    event
                }
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], TopicEvent::Join { key, .. } if key == "c2"));
        assert!(matches!(events[1], TopicEvent::Leave { key, .. } if key == "c1"));
        match events[2] {
            TopicEvent::Sync(snapshot) => {
                assert!(snapshot.contains("bob"));
                assert!(!snapshot.contains("alice"));
            }
            other => panic!("expected sync, got {other:?}"),
        }
    }

    #[test]
    fn broadcast_unwraps_inner_event() {
        let mut state = joined_state("dm:1");
        let handled = handle_phoenix_message(
            &incoming(
                "dm:1",
                "broadcast",
                json!({ "type": "broadcast", "event": "message", "payload": { "content": "hi" } }),
                None,
            ),
            &mut state,
            Utc::now(),
        );
        match &handled.events[..] {
            [TransportEvent::Topic {
                event: TopicEvent::Broadcast { event, payload },
                ..
            }] => {
                assert_eq!(event, "message");
                assert_eq!(payload["content"], "hi");
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[test]
    fn server_error_reports_channel_error_once_known() {
        let mut state = joined_state("dm:1");
        state.presence.insert("dm:1".into(), PresenceState::default());
        let handled = handle_phoenix_message(
            &incoming("dm:1", "phx_error", json!({}), None),
            &mut state,
            Utc::now(),
        );
        assert!(matches!(
            &handled.events[..],
            [TransportEvent::ChannelError { topic, .. }] if topic == "dm:1"
        ));
        assert!(!state.presence.contains_key("dm:1"));

        let handled = handle_phoenix_message(
            &incoming("dm:404", "phx_close", json!({}), None),
            &mut state,
            Utc::now(),
        );
        assert!(handled.events.is_empty());
    }
}
