//! Tests for reference counting, open coalescing, and dispatch isolation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::*;
use crate::testing::{settle, snapshot_of, FakeTransport};

fn registry_with_fake() -> (ChannelRegistry, Arc<FakeTransport>) {
    let fake = FakeTransport::new();
    (ChannelRegistry::new(fake.clone()), fake)
}

fn counting(counter: &Arc<AtomicUsize>) -> Listener {
    let counter = Arc::clone(counter);
    Arc::new(move |_event: &TopicEvent| -> Result<(), ListenerError> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

#[tokio::test]
async fn acquire_opens_once_and_counts_refs() {
    let (registry, fake) = registry_with_fake();

    let first = registry.acquire("topic-x").await.unwrap();
    let second = registry.acquire("topic-x").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(fake.open_count("topic-x"), 1);
    assert_eq!(registry.ref_count("topic-x"), 2);
    assert!(registry.is_subscribed("topic-x"));

    assert_eq!(registry.release("topic-x").await, Release::Retained(1));
    assert_eq!(fake.close_count("topic-x"), 0);

    assert_eq!(registry.release("topic-x").await, Release::Closed);
    assert_eq!(fake.close_count("topic-x"), 1);
    assert_eq!(fake.live("topic-x"), 0);
    assert!(registry.topics().is_empty());
}

#[tokio::test]
async fn concurrent_acquires_share_one_open() {
    let (registry, fake) = registry_with_fake();
    fake.hold_opens();

    let (a, b, _) = tokio::join!(
        registry.acquire("topic-x"),
        registry.acquire("topic-x"),
        async {
            settle().await;
            assert_eq!(registry.ref_count("topic-x"), 2);
            assert!(!registry.is_subscribed("topic-x"));
            fake.release_opens();
        }
    );

    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(fake.open_count("topic-x"), 1);
    assert_eq!(fake.max_live("topic-x"), 1);
    assert_eq!(registry.ref_count("topic-x"), 2);
}

#[tokio::test]
async fn release_is_idempotent_after_single_acquire() {
    let (registry, fake) = registry_with_fake();
    registry.acquire("topic-x").await.unwrap();

    assert_eq!(registry.release("topic-x").await, Release::Closed);
    assert_eq!(registry.release("topic-x").await, Release::Stale);
    assert_eq!(registry.release("topic-x").await, Release::Stale);
    assert_eq!(fake.close_count("topic-x"), 1);
}

#[tokio::test]
async fn release_of_unknown_topic_is_noop() {
    let (registry, fake) = registry_with_fake();
    assert_eq!(registry.release("never-opened").await, Release::Stale);
    assert_eq!(fake.close_count("never-opened"), 0);
}

#[tokio::test]
async fn failed_open_leaves_no_registration() {
    let (registry, fake) = registry_with_fake();
    fake.fail_opens_for("topic-x");

    let err = registry.acquire("topic-x").await.unwrap_err();
    assert!(matches!(err, ChannelOpenError::Transport { .. }));
    assert_eq!(registry.ref_count("topic-x"), 0);
    assert!(registry.topics().is_empty());

    fake.heal("topic-x");
    registry.acquire("topic-x").await.unwrap();
    assert_eq!(fake.open_count("topic-x"), 2);
    assert_eq!(registry.ref_count("topic-x"), 1);
}

#[tokio::test]
async fn dropped_waiter_of_failed_open_leaves_new_registration_alone() {
    let (registry, fake) = registry_with_fake();
    fake.hold_opens();
    fake.fail_opens_for("topic-x");

    let mut opener = Box::pin(registry.acquire("topic-x"));
    let mut waiter = Box::pin(registry.acquire("topic-x"));
    assert!(futures_util::poll!(&mut opener).is_pending());
    assert!(futures_util::poll!(&mut waiter).is_pending());
    assert_eq!(registry.ref_count("topic-x"), 2);

    fake.release_opens();
    assert!(opener.await.is_err());
    assert!(registry.topics().is_empty());

    // A new holder arrives before the old waiter ever observes the failure.
    fake.heal("topic-x");
    fake.hold_opens();
    let mut fresh = Box::pin(registry.acquire("topic-x"));
    assert!(futures_util::poll!(&mut fresh).is_pending());
    assert_eq!(registry.ref_count("topic-x"), 1);

    drop(waiter);
    assert_eq!(registry.ref_count("topic-x"), 1);

    fake.release_opens();
    assert!(fresh.await.is_ok());
    assert_eq!(registry.ref_count("topic-x"), 1);
    assert_eq!(fake.open_count("topic-x"), 2);
    assert_eq!(fake.close_count("topic-x"), 0);
}

#[tokio::test]
async fn dropped_opener_does_not_abandon_newer_registration() {
    let (registry, fake) = registry_with_fake();
    fake.hold_opens();

    let mut stale = Box::pin(registry.acquire("topic-x"));
    assert!(futures_util::poll!(&mut stale).is_pending());
    drop(stale);
    assert!(registry.topics().is_empty());

    let mut fresh = Box::pin(registry.acquire("topic-x"));
    assert!(futures_util::poll!(&mut fresh).is_pending());
    // The dropped opener held the first registration.
    registry.abandon_open("topic-x", 1);
    assert_eq!(registry.ref_count("topic-x"), 1);

    fake.release_opens();
    assert!(fresh.await.is_ok());
    assert!(registry.is_subscribed("topic-x"));
}

#[tokio::test]
async fn failed_open_fails_every_coalesced_waiter() {
    let (registry, fake) = registry_with_fake();
    fake.hold_opens();
    fake.fail_opens_for("topic-x");

    let (a, b, _) = tokio::join!(
        registry.acquire("topic-x"),
        registry.acquire("topic-x"),
        async {
            settle().await;
            fake.release_opens();
        }
    );

    assert_eq!(a.unwrap_err(), b.unwrap_err());
    assert_eq!(fake.open_count("topic-x"), 1);
    assert!(registry.topics().is_empty());
}

#[tokio::test]
async fn release_during_open_closes_once_open_settles() {
    let (registry, fake) = registry_with_fake();
    fake.hold_opens();

    let (acquired, _) = tokio::join!(registry.acquire("topic-x"), async {
        settle().await;
        assert_eq!(registry.release("topic-x").await, Release::Cancelled);
        // A second release while nobody holds it is stale.
        assert_eq!(registry.release("topic-x").await, Release::Stale);
        fake.release_opens();
    });

    assert!(matches!(
        acquired,
        Err(ChannelOpenError::Cancelled { .. })
    ));
    assert_eq!(fake.open_count("topic-x"), 1);
    assert_eq!(fake.close_count("topic-x"), 1);
    assert_eq!(fake.live("topic-x"), 0);
    assert!(registry.topics().is_empty());
}

#[tokio::test]
async fn dropped_open_is_abandoned() {
    let (registry, fake) = registry_with_fake();
    fake.hold_opens();

    let timed_out =
        tokio::time::timeout(Duration::from_millis(20), registry.acquire("topic-x")).await;
    assert!(timed_out.is_err());
    assert!(registry.topics().is_empty());

    fake.release_opens();
    registry.acquire("topic-x").await.unwrap();
    assert_eq!(registry.ref_count("topic-x"), 1);
}

#[tokio::test]
async fn failing_listener_does_not_block_siblings() {
    let (registry, _fake) = registry_with_fake();
    let second = Arc::new(AtomicUsize::new(0));
    let third = Arc::new(AtomicUsize::new(0));

    registry.add_listener(
        "topic-x",
        Arc::new(|_event: &TopicEvent| -> Result<(), ListenerError> {
            Err(ListenerError::new("render failed"))
        }),
    );
    registry.add_listener("topic-x", counting(&second));
    registry.add_listener("topic-x", counting(&third));

    let delivered = registry.dispatch("topic-x", &TopicEvent::Interrupted);
    assert_eq!(delivered, 2);
    assert_eq!(second.load(Ordering::SeqCst), 1);
    assert_eq!(third.load(Ordering::SeqCst), 1);
    assert_eq!(registry.listener_failures(), 1);
}

#[tokio::test]
async fn panicking_listener_is_isolated() {
    let (registry, _fake) = registry_with_fake();
    let after = Arc::new(AtomicUsize::new(0));

    registry.add_listener(
        "topic-x",
        Arc::new(|_event: &TopicEvent| -> Result<(), ListenerError> {
            panic!("listener bug")
        }),
    );
    registry.add_listener("topic-x", counting(&after));

    registry.dispatch("topic-x", &TopicEvent::Interrupted);
    registry.dispatch("topic-x", &TopicEvent::Interrupted);
    assert_eq!(after.load(Ordering::SeqCst), 2);
    assert_eq!(registry.listener_failures(), 2);
}

#[tokio::test]
async fn dispatch_follows_registration_order() {
    let (registry, _fake) = registry_with_fake();
    let order = Arc::new(Mutex::new(Vec::new()));

    for n in 0..3 {
        let order = Arc::clone(&order);
        registry.add_listener(
            "topic-x",
            Arc::new(move |_event: &TopicEvent| -> Result<(), ListenerError> {
                order.lock().unwrap().push(n);
                Ok(())
            }),
        );
    }
    registry.dispatch("topic-x", &TopicEvent::Interrupted);
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
}

#[tokio::test]
async fn dispatch_to_other_topic_is_not_delivered() {
    let (registry, _fake) = registry_with_fake();
    let hits = Arc::new(AtomicUsize::new(0));
    registry.add_listener("topic-x", counting(&hits));

    assert_eq!(registry.dispatch("topic-y", &TopicEvent::Interrupted), 0);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn snapshot_is_cached_while_registered() {
    let (registry, _fake) = registry_with_fake();

    // Not registered yet: nothing cached.
    registry.dispatch("topic-x", &TopicEvent::Sync(snapshot_of(&["alice"])));
    assert!(registry.snapshot("topic-x").is_none());

    registry.acquire("topic-x").await.unwrap();
    registry.dispatch("topic-x", &TopicEvent::Sync(snapshot_of(&["alice"])));
    let cached = registry.snapshot("topic-x").unwrap();
    assert!(cached.contains("alice"));

    registry.dispatch("topic-x", &TopicEvent::Interrupted);
    assert!(registry.snapshot("topic-x").is_none());

    registry.dispatch("topic-x", &TopicEvent::Sync(snapshot_of(&["bob"])));
    registry.release("topic-x").await;
    assert!(registry.snapshot("topic-x").is_none());
}

#[tokio::test]
async fn subscription_cancel_is_idempotent() {
    let (registry, fake) = registry_with_fake();
    let hits = Arc::new(AtomicUsize::new(0));

    let sub = registry.subscribe("topic-x", counting(&hits)).await.unwrap();
    assert!(sub.is_active());
    assert_eq!(registry.listener_count("topic-x"), 1);

    assert_eq!(sub.cancel().await, Some(Release::Closed));
    assert_eq!(sub.cancel().await, None);
    assert!(!sub.is_active());
    assert_eq!(registry.listener_count("topic-x"), 0);
    assert_eq!(fake.close_count("topic-x"), 1);
}

#[tokio::test]
async fn dropped_subscription_cleans_up() {
    let (registry, fake) = registry_with_fake();
    let hits = Arc::new(AtomicUsize::new(0));

    let sub = registry.subscribe("topic-x", counting(&hits)).await.unwrap();
    drop(sub);
    settle().await;

    assert_eq!(registry.listener_count("topic-x"), 0);
    assert_eq!(registry.ref_count("topic-x"), 0);
    assert_eq!(fake.close_count("topic-x"), 1);
}

#[tokio::test]
async fn failed_subscribe_removes_listener() {
    let (registry, fake) = registry_with_fake();
    fake.fail_opens_for("topic-x");
    let hits = Arc::new(AtomicUsize::new(0));

    assert!(registry.subscribe("topic-x", counting(&hits)).await.is_err());
    assert_eq!(registry.listener_count("topic-x"), 0);
}

#[tokio::test]
async fn publish_requires_live_subscription() {
    let (registry, fake) = registry_with_fake();

    let err = registry
        .publish_self("global-presence", serde_json::json!({ "user_id": "u1" }))
        .await
        .unwrap_err();
    assert_eq!(err, TransportError::NotSubscribed("global-presence".into()));

    registry.acquire("global-presence").await.unwrap();
    registry
        .publish_self("global-presence", serde_json::json!({ "user_id": "u1" }))
        .await
        .unwrap();
    registry
        .broadcast("global-presence", "ping", serde_json::json!({}))
        .await
        .unwrap();
    assert_eq!(fake.published().len(), 1);
    assert_eq!(fake.broadcasts()[0].1, "ping");
}

#[tokio::test]
async fn run_pumps_events_and_interrupts_on_disconnect() {
    let (registry, _fake) = registry_with_fake();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_by_listener = Arc::clone(&seen);

    let _sub = registry
        .subscribe(
            "topic-x",
            Arc::new(move |event: &TopicEvent| -> Result<(), ListenerError> {
                let label = match event {
                    TopicEvent::Sync(_) => "sync",
                    TopicEvent::Interrupted => "interrupted",
                    _ => "other",
                };
                seen_by_listener.lock().unwrap().push(label);
                Ok(())
            }),
        )
        .await
        .unwrap();

    let (tx, rx) = mpsc::channel(8);
    let pump = tokio::spawn({
        let registry = registry.clone();
        async move { registry.run(rx).await }
    });

    tx.send(TransportEvent::Connected).await.unwrap();
    tx.send(TransportEvent::Topic {
        topic: "topic-x".into(),
        event: TopicEvent::Sync(snapshot_of(&["alice"])),
    })
    .await
    .unwrap();
    tx.send(TransportEvent::Disconnected).await.unwrap();
    drop(tx);
    pump.await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["sync", "interrupted"]);
    assert!(registry.snapshot("topic-x").is_none());
}
