//! Subcommand implementations.

use std::sync::{Arc, Mutex, PoisonError};

use portal_common::PortalError;
use portal_config::PortalConfig;
use portal_realtime::{
    ConversationStream, DirectMessage, MessageLog, MessageLogConfig, PresenceTracker,
    SelfPresencePublisher,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::session::{query_timeout, Session};

/// Print the identities currently present on `topic` and exit.
pub async fn online(
    session: &Session,
    config: &PortalConfig,
    topic: &str,
    timeout_secs: Option<u64>,
) -> Result<(), PortalError> {
    let tracker = PresenceTracker::new(session.registry.clone());
    let ids = match query_timeout(config, timeout_secs) {
        Some(limit) => tracker.get_online_identities_within(topic, limit).await?,
        None => tracker.get_online_identities(topic).await?,
    };

    let mut ids: Vec<String> = ids.into_iter().collect();
    ids.sort();
    info!(topic = %topic, count = ids.len(), "Presence snapshot received");
    for id in ids {
        println!("{id}");
    }
    Ok(())
}

/// Log every change of "anyone present on `topic`" until Ctrl-C.
pub async fn watch(session: &Session, topic: &str) -> Result<(), PortalError> {
    let tracker = PresenceTracker::new(session.registry.clone());
    let label = topic.to_string();
    let unwatch = tracker
        .watch(topic, move |present| {
            println!("{label}: {}", if present { "online" } else { "offline" });
        })
        .await?;

    wait_for_ctrl_c().await?;
    unwatch.unwatch().await;
    Ok(())
}

/// Announce `identity` on `topic` until Ctrl-C.
pub async fn announce(session: &Session, topic: &str, identity: &str) -> Result<(), PortalError> {
    let publisher = SelfPresencePublisher::new(session.registry.clone(), topic);
    let guard = publisher.start(identity);

    guard.settled().await;
    info!(topic = %topic, identity = %identity, phase = ?guard.state(), "Announcement settled");

    wait_for_ctrl_c().await?;
    guard.stop().await;
    Ok(())
}

/// Join a conversation: print incoming messages and send each stdin line.
pub async fn converse(
    session: &Session,
    config: &PortalConfig,
    conversation_id: &str,
    sender: &str,
) -> Result<(), PortalError> {
    let log = Arc::new(Mutex::new(MessageLog::new(MessageLogConfig {
        max_messages_per_conversation: config.conversations.history_limit as usize,
    })));

    let presence = config.presence.enabled.then(|| {
        SelfPresencePublisher::new(session.registry.clone(), config.presence.global_topic.as_str())
            .start(sender)
    });

    let stream = ConversationStream::new(session.registry.clone());
    let incoming_log = Arc::clone(&log);
    let me = sender.to_string();
    let subscription = stream
        .subscribe(conversation_id, move |msg| {
            let fresh = incoming_log
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(msg.clone());
            if fresh && msg.sender_id != me {
                println!("[{}] {}: {}", msg.sent_at.format("%H:%M:%S"), msg.sender_id, msg.content);
            }
        })
        .await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let content = line.trim();
                if content.is_empty() {
                    continue;
                }
                let msg = DirectMessage::new(conversation_id, sender, content);
                // Optimistic local copy; the echo is deduplicated by id.
                log.lock().unwrap_or_else(PoisonError::into_inner).push(msg.clone());
                if let Err(e) = stream.send(&msg).await {
                    warn!(conversation = %conversation_id, error = %e, "Message not sent");
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
        }
    }

    let total = log.lock().unwrap_or_else(PoisonError::into_inner).total_messages();
    info!(conversation = %conversation_id, messages = total, "Leaving conversation");
    subscription.cancel().await;
    if let Some(guard) = presence {
        guard.stop().await;
    }
    Ok(())
}

async fn wait_for_ctrl_c() -> Result<(), PortalError> {
    tokio::signal::ctrl_c().await?;
    info!("Interrupted; cleaning up");
    Ok(())
}
