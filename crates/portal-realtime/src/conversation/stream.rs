//! Per-conversation subscriptions and sends.

use std::sync::Arc;

use tracing::{debug, warn};

use super::types::{DirectMessage, MESSAGE_EVENT};
use crate::error::{ListenerError, RealtimeError};
use crate::registry::{ChannelRegistry, Subscription};
use crate::topics;
use crate::transport::TopicEvent;

/// Message streams for direct conversations, one `dm:<id>` topic each.
#[derive(Clone)]
pub struct ConversationStream {
    registry: ChannelRegistry,
}

impl ConversationStream {
    pub fn new(registry: ChannelRegistry) -> Self {
        Self { registry }
    }

    /// Deliver every message broadcast on the conversation to `on_message`.
    ///
    /// Payloads that do not decode as a [`DirectMessage`] are logged and
    /// skipped. Cancel or drop the returned subscription to stop.
    pub async fn subscribe<F>(
        &self,
        conversation_id: &str,
        on_message: F,
    ) -> Result<Subscription, RealtimeError>
    where
        F: Fn(DirectMessage) + Send + Sync + 'static,
    {
        let topic = topics::direct_message(conversation_id);
        let expected = conversation_id.to_string();

        let subscription = self
            .registry
            .subscribe(
                &topic,
                Arc::new(move |event: &TopicEvent| -> Result<(), ListenerError> {
                    let TopicEvent::Broadcast { event, payload } = event else {
                        return Ok(());
                    };
                    if event != MESSAGE_EVENT {
                        return Ok(());
                    }
                    match serde_json::from_value::<DirectMessage>(payload.clone()) {
                        Ok(msg) if msg.conversation_id == expected => on_message(msg),
                        Ok(msg) => {
                            warn!(
                                conversation = %expected,
                                other = %msg.conversation_id,
                                "Ignoring message addressed to another conversation"
                            );
                        }
                        Err(e) => {
                            warn!(conversation = %expected, error = %e, "Ignoring malformed message");
                        }
                    }
                    Ok(())
                }),
            )
            .await?;

        debug!(topic = %topic, "Conversation subscribed");
        Ok(subscription)
    }

    /// Broadcast `msg` on its conversation topic, which must currently be
    /// subscribed.
    pub async fn send(&self, msg: &DirectMessage) -> Result<(), RealtimeError> {
        let topic = topics::direct_message(&msg.conversation_id);
        let payload = serde_json::to_value(msg)?;
        self.registry.broadcast(&topic, MESSAGE_EVENT, payload).await?;
        debug!(topic = %topic, message = %msg.id, "Message sent");
        Ok(())
    }
}
