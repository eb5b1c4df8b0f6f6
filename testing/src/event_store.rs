//! In-memory event store for fast, deterministic tests.
//!
//! [`InMemoryEventStore`] implements the full [`EventStore`] contract
//! (expected versions, truncation, soft delete) and [`SubscribeToAll`] with
//! live push: appends are broadcast to open subscriptions while the store
//! lock is held, so a subscription never misses or reorders an event between
//! its catch-up snapshot and the live feed.
//!
//! Failures can be injected to exercise retry and reconnect paths:
//! [`set_offline`](InMemoryEventStore::set_offline),
//! [`fail_next_reads`](InMemoryEventStore::fail_next_reads) and
//! [`disconnect_subscribers`](InMemoryEventStore::disconnect_subscribers).

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on a poisoned lock

use eventline_core::environment::{Clock, SystemClock};
use eventline_core::event::{RecordedEvent, SerializedEvent};
use eventline_core::event_store::{AppendEventsResult, EventStore, EventStoreError, ReadRequest};
use eventline_core::stream::{ExpectedVersion, GlobalPosition, StreamName, StreamPosition, Version};
use eventline_core::subscription::{
    SubscribeToAll, SubscriptionFilter, SubscriptionMessage, SubscriptionStream,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const LIVE_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
enum LiveMessage {
    Event(RecordedEvent),
    Disconnect,
}

#[derive(Debug)]
struct StreamState {
    version: Version,
    truncate_before: StreamPosition,
    deleted: bool,
    events: Vec<RecordedEvent>,
}

impl Default for StreamState {
    fn default() -> Self {
        Self {
            version: Version::INITIAL,
            truncate_before: StreamPosition::START,
            deleted: false,
            events: Vec::new(),
        }
    }
}

impl StreamState {
    fn visible(&self) -> Vec<RecordedEvent> {
        self.events
            .iter()
            .filter(|event| event.stream_position >= self.truncate_before)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Default)]
struct State {
    streams: HashMap<StreamName, StreamState>,
    log: Vec<RecordedEvent>,
}

#[derive(Debug, Default)]
struct Faults {
    offline: AtomicBool,
    failing_reads: AtomicUsize,
}

impl Faults {
    fn check_online(&self) -> Result<(), EventStoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(EventStoreError::Transport("event store is offline".to_string()));
        }
        Ok(())
    }

    fn check_read(&self) -> Result<(), EventStoreError> {
        self.check_online()?;
        let injected = self
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(EventStoreError::Transport("injected read failure".to_string()));
        }
        Ok(())
    }
}

/// In-memory [`EventStore`] and [`SubscribeToAll`] implementation.
///
/// Cloning shares the underlying log.
///
/// # Example
///
/// ```
/// use eventline_core::event::SerializedEvent;
/// use eventline_core::event_store::EventStore;
/// use eventline_core::stream::StreamName;
/// use eventline_testing::InMemoryEventStore;
///
/// # tokio_test::block_on(async {
/// let store = InMemoryEventStore::new();
/// let stream = StreamName::new("order-1");
///
/// let event = SerializedEvent::new("OrderCreated.v1".to_string(), vec![1], None);
/// store.append_new_events(stream.clone(), vec![event]).await.unwrap();
///
/// let events = store.read_events_from_start(stream).await.unwrap();
/// assert_eq!(events.len(), 1);
/// # });
/// ```
#[derive(Clone)]
pub struct InMemoryEventStore {
    state: Arc<Mutex<State>>,
    live: broadcast::Sender<LiveMessage>,
    faults: Arc<Faults>,
    clock: Arc<dyn Clock>,
}

impl InMemoryEventStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            live,
            faults: Arc::new(Faults::default()),
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` for `recorded_at` timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Make every operation fail with a transient error until set back.
    pub fn set_offline(&self, offline: bool) {
        self.faults.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `count` reads with a transient error.
    pub fn fail_next_reads(&self, count: usize) {
        self.faults.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Break every open subscription with a transient error.
    pub fn disconnect_subscribers(&self) {
        let _ = self.live.send(LiveMessage::Disconnect);
    }

    /// Every event in global order (including deleted streams).
    #[must_use]
    pub fn global_log(&self) -> Vec<RecordedEvent> {
        self.state.lock().unwrap().log.clone()
    }

    /// Number of events in the global log.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.state.lock().unwrap().log.len()
    }

    /// Position of the most recent event in the global log.
    #[must_use]
    pub fn last_global_position(&self) -> Option<GlobalPosition> {
        self.state
            .lock()
            .unwrap()
            .log
            .last()
            .map(|event| event.global_position)
    }

    /// Current version of a live stream.
    #[must_use]
    pub fn stream_version(&self, stream_name: &StreamName) -> Option<Version> {
        let state = self.state.lock().unwrap();
        state
            .streams
            .get(stream_name)
            .filter(|stream| !stream.deleted)
            .map(|stream| stream.version)
    }

    fn append(
        &self,
        stream_name: StreamName,
        expected_version: ExpectedVersion,
        events: Vec<SerializedEvent>,
    ) -> Result<AppendEventsResult, EventStoreError> {
        self.faults.check_online()?;
        if events.is_empty() {
            return Err(EventStoreError::EmptyAppend(stream_name));
        }

        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;

        let current = state
            .streams
            .get(&stream_name)
            .filter(|stream| !stream.deleted)
            .map(|stream| stream.version);
        if !expected_version.matches(current) {
            return Err(EventStoreError::ConcurrencyConflict {
                stream_name,
                expected: expected_version,
                actual: current,
            });
        }

        let stream = state.streams.entry(stream_name.clone()).or_default();
        if stream.deleted {
            stream.deleted = false;
            stream.truncate_before = stream.version.next_position();
        }

        let recorded_at = self.clock.now();
        let mut global_position = GlobalPosition::FIRST;
        for event in events {
            global_position = GlobalPosition::new(state.log.len() as u64 + 1);
            let recorded = RecordedEvent {
                stream_name: stream_name.clone(),
                stream_position: stream.version.next_position(),
                global_position,
                event_id: event.event_id,
                event_type: event.event_type,
                data: event.data,
                metadata: event.metadata,
                recorded_at,
            };
            stream.version = stream.version.next();
            stream.events.push(recorded.clone());
            state.log.push(recorded.clone());
            // No receivers is fine.
            let _ = self.live.send(LiveMessage::Event(recorded));
        }

        Ok(AppendEventsResult {
            next_expected_version: stream.version,
            global_position,
        })
    }

    fn read(
        &self,
        stream_name: &StreamName,
        request: ReadRequest,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        self.faults.check_read()?;
        let state = self.state.lock().unwrap();
        match state.streams.get(stream_name) {
            Some(stream) if !stream.deleted => Ok(request.select(&stream.visible())),
            _ => Err(EventStoreError::StreamNotFound(stream_name.clone())),
        }
    }

    fn modify<F>(
        &self,
        stream_name: StreamName,
        expected_version: ExpectedVersion,
        change: F,
    ) -> Result<(), EventStoreError>
    where
        F: FnOnce(&mut StreamState),
    {
        self.faults.check_online()?;
        let mut state = self.state.lock().unwrap();
        let Some(stream) = state.streams.get_mut(&stream_name).filter(|s| !s.deleted) else {
            return Err(EventStoreError::StreamNotFound(stream_name));
        };
        if !expected_version.matches(Some(stream.version)) {
            return Err(EventStoreError::ConcurrencyConflict {
                actual: Some(stream.version),
                stream_name,
                expected: expected_version,
            });
        }
        change(stream);
        Ok(())
    }

    fn open_subscription(
        &self,
        filter: SubscriptionFilter,
        after: Option<GlobalPosition>,
    ) -> Result<SubscriptionStream, EventStoreError> {
        self.faults.check_online()?;

        // Snapshot and subscribe under the lock so no append falls in between.
        let (history, mut receiver) = {
            let state = self.state.lock().unwrap();
            let history: Vec<RecordedEvent> = state
                .log
                .iter()
                .filter(|event| after.is_none_or(|after| event.global_position > after))
                .filter(|event| filter.matches(&event.stream_name))
                .cloned()
                .collect();
            (history, self.live.subscribe())
        };

        let stream = async_stream::stream! {
            let mut last_seen = after;
            for event in history {
                last_seen = Some(event.global_position);
                yield Ok(SubscriptionMessage::Event(event));
            }
            yield Ok(SubscriptionMessage::CaughtUp);

            loop {
                match receiver.recv().await {
                    Ok(LiveMessage::Event(event)) => {
                        if last_seen.is_some_and(|seen| event.global_position <= seen) {
                            continue;
                        }
                        last_seen = Some(event.global_position);
                        if filter.matches(&event.stream_name) {
                            yield Ok(SubscriptionMessage::Event(event));
                        }
                    }
                    Ok(LiveMessage::Disconnect) => {
                        yield Err(EventStoreError::Transport("subscription dropped".to_string()));
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        yield Err(EventStoreError::Transport(format!(
                            "subscription lagged behind by {skipped} events"
                        )));
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        Ok(stream.boxed())
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEventStore")
            .field("events", &self.event_count())
            .finish_non_exhaustive()
    }
}

impl EventStore for InMemoryEventStore {
    fn stream_exists(
        &self,
        stream_name: StreamName,
    ) -> Pin<Box<dyn Future<Output = Result<bool, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            self.faults.check_read()?;
            Ok(self.stream_version(&stream_name).is_some())
        })
    }

    fn read_stream(
        &self,
        stream_name: StreamName,
        request: ReadRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RecordedEvent>, EventStoreError>> + Send + '_>> {
        Box::pin(async move { self.read(&stream_name, request) })
    }

    fn append_events(
        &self,
        stream_name: StreamName,
        expected_version: ExpectedVersion,
        events: Vec<SerializedEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<AppendEventsResult, EventStoreError>> + Send + '_>> {
        Box::pin(async move { self.append(stream_name, expected_version, events) })
    }

    fn truncate_stream(
        &self,
        stream_name: StreamName,
        before: StreamPosition,
        expected_version: ExpectedVersion,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            self.modify(stream_name, expected_version, |stream| {
                stream.truncate_before = stream.truncate_before.max(before);
            })
        })
    }

    fn delete_stream(
        &self,
        stream_name: StreamName,
        expected_version: ExpectedVersion,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            self.modify(stream_name, expected_version, |stream| stream.deleted = true)
        })
    }
}

impl SubscribeToAll for InMemoryEventStore {
    fn subscribe_to_all(
        &self,
        filter: SubscriptionFilter,
        after: Option<GlobalPosition>,
    ) -> Pin<Box<dyn Future<Output = Result<SubscriptionStream, EventStoreError>> + Send + '_>> {
        Box::pin(async move { self.open_subscription(filter, after) })
    }
}
