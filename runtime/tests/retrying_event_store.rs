//! `RetryingEventStore` against a fault-injecting in-memory store.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use eventline_core::event::SerializedEvent;
use eventline_core::event_store::EventStore;
use eventline_core::stream::{StreamName, Version};
use eventline_core::subscription::{SubscribeToAll, SubscriptionFilter, SubscriptionMessage};
use eventline_runtime::{RetryPolicy, RetryingEventStore};
use eventline_testing::InMemoryEventStore;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

fn fast_policy(max_retries: usize) -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(max_retries)
        .initial_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(5))
        .build()
}

fn event(event_type: &str) -> SerializedEvent {
    SerializedEvent::new(event_type.to_string(), vec![0], None)
}

async fn seeded() -> (Arc<InMemoryEventStore>, StreamName) {
    let inner = Arc::new(InMemoryEventStore::new());
    let stream = StreamName::new("order-1");
    inner
        .append_new_events(stream.clone(), vec![event("OrderPlaced.v1")])
        .await
        .unwrap();
    (inner, stream)
}

#[tokio::test]
async fn transient_read_failures_are_retried() {
    let (inner, stream) = seeded().await;
    let store = RetryingEventStore::new(inner.clone(), fast_policy(3));

    inner.fail_next_reads(2);
    let events = store.read_events_from_start(stream.clone()).await.unwrap();
    assert_eq!(events.len(), 1);

    inner.fail_next_reads(1);
    assert!(store.stream_exists(stream).await.unwrap());
}

#[tokio::test]
async fn read_gives_up_after_policy_is_exhausted() {
    let (inner, stream) = seeded().await;
    let store = RetryingEventStore::new(inner.clone(), fast_policy(2));

    inner.fail_next_reads(5);
    let error = store.read_events_from_start(stream).await.unwrap_err();
    assert!(error.is_transient());
}

#[tokio::test]
async fn stream_not_found_is_not_retried() {
    let (inner, _) = seeded().await;
    let store = RetryingEventStore::new(inner.clone(), fast_policy(3));

    inner.fail_next_reads(0);
    let error = store
        .read_events_from_start(StreamName::new("order-404"))
        .await
        .unwrap_err();
    assert!(!error.is_transient());
}

#[tokio::test]
async fn appends_are_not_retried() {
    let (inner, stream) = seeded().await;
    let store = RetryingEventStore::new(inner.clone(), fast_policy(5));

    inner.set_offline(true);
    let error = store
        .append_events(
            stream.clone(),
            eventline_core::stream::ExpectedVersion::Exact(Version::new(1)),
            vec![event("OrderPaid.v1")],
        )
        .await
        .unwrap_err();
    assert!(error.is_transient());

    inner.set_offline(false);
    assert_eq!(inner.stream_version(&stream), Some(Version::new(1)));
    assert_eq!(inner.event_count(), 1);
}

#[tokio::test]
async fn works_behind_a_trait_object() {
    let (inner, stream) = seeded().await;
    let store: Arc<dyn EventStore> = Arc::new(RetryingEventStore::new(inner.clone(), fast_policy(3)));

    inner.fail_next_reads(1);
    let last = store.read_last_event(stream).await.unwrap().expect("one event");
    assert_eq!(last.event_type, "OrderPlaced.v1");
}

#[tokio::test]
async fn subscribe_retries_while_store_is_offline() {
    let (inner, _) = seeded().await;
    let store = RetryingEventStore::new(inner.clone(), fast_policy(50));

    inner.set_offline(true);
    let toggler = {
        let inner = inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            inner.set_offline(false);
        })
    };

    let mut subscription = store
        .subscribe_to_all(SubscriptionFilter::all(), None)
        .await
        .unwrap();
    toggler.await.unwrap();

    let first = subscription.next().await.unwrap().unwrap();
    assert!(matches!(first, SubscriptionMessage::Event(ref e) if e.global_position.value() == 1));
    assert_eq!(subscription.next().await.unwrap().unwrap(), SubscriptionMessage::CaughtUp);
}
