//! Event store trait and related types.
//!
//! An event store is an append-only log with one stream per aggregate
//! instance, plus a global order across all streams. This module defines the
//! contract the rest of the workspace codes against:
//!
//! - Forward and backward reads of one stream, from a position, with an
//!   optional maximum count
//! - Atomic compare-and-append guarded by an [`ExpectedVersion`]
//! - Version-guarded truncation and (soft) deletion
//!
//! # Implementations
//!
//! - `PostgresEventStore` (in `eventline-postgres`): Production implementation
//! - `InMemoryEventStore` (in `eventline-testing`): Fast, deterministic testing
//! - `RetryingEventStore` (in `eventline-runtime`): Retries transient read failures
//!
//! # Deletion semantics
//!
//! [`EventStore::delete_stream`] is a **soft delete**. After deletion the
//! stream reads as [`EventStoreError::StreamNotFound`] and `stream_exists`
//! returns `false`, but the events stay in the global log. Appending again
//! with `NoStream` or `Any` recreates the stream; its positions continue
//! after the last deleted event and are never reused.
//!
//! # Example
//!
//! ```no_run
//! use eventline_core::event_store::{EventStore, EventStoreError};
//! use eventline_core::stream::{ExpectedVersion, StreamName, Version};
//!
//! async fn example(store: &dyn EventStore) -> Result<(), EventStoreError> {
//!     let stream = StreamName::new("order-123");
//!
//!     let result = store.append_new_events(stream.clone(), vec![/* ... */]).await?;
//!     store
//!         .append_events(
//!             stream.clone(),
//!             ExpectedVersion::Exact(result.next_expected_version),
//!             vec![/* ... */],
//!         )
//!         .await?;
//!
//!     let events = store.read_events_from_start(stream).await?;
//!     Ok(())
//! }
//! ```

use crate::event::{RecordedEvent, SerializedEvent};
use crate::stream::{ExpectedVersion, GlobalPosition, StreamName, StreamPosition, Version};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventStoreError {
    /// Optimistic concurrency conflict: the stream is not at the expected version.
    ///
    /// Nothing was appended. Callers decide whether to reload and retry.
    #[error("Concurrency conflict on {stream_name}: expected {expected}, found {}", display_actual(.actual))]
    ConcurrencyConflict {
        /// The stream where the conflict occurred.
        stream_name: StreamName,
        /// The expectation passed to the append.
        expected: ExpectedVersion,
        /// The actual current version (`None` when the stream does not exist).
        actual: Option<Version>,
    },

    /// Stream not found (never created, or soft-deleted).
    #[error("Stream not found: {0}")]
    StreamNotFound(StreamName),

    /// An append was attempted with no events.
    #[error("Empty append to stream {0}")]
    EmptyAppend(StreamName),

    /// The backing service is unreachable or the query failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A record could not be encoded or decoded by the store.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

fn display_actual(actual: &Option<Version>) -> String {
    actual.map_or_else(|| "no stream".to_string(), |version| version.to_string())
}

impl EventStoreError {
    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Whether this is an optimistic concurrency conflict.
    #[must_use]
    pub const fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

/// Direction of a stream read.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReadDirection {
    /// Ascending stream positions.
    Forward,
    /// Descending stream positions.
    Backward,
}

/// Where a stream read begins (inclusive).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReadFrom {
    /// The first readable event.
    Start,
    /// The last event.
    End,
    /// A specific position.
    Position(StreamPosition),
}

/// Parameters of a stream read.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ReadRequest {
    /// Read direction.
    pub direction: ReadDirection,
    /// Starting point (inclusive).
    pub from: ReadFrom,
    /// Maximum number of events to return (`None` = all).
    pub max_count: Option<usize>,
}

impl ReadRequest {
    /// Every readable event, oldest first.
    #[must_use]
    pub const fn forward_from_start() -> Self {
        Self {
            direction: ReadDirection::Forward,
            from: ReadFrom::Start,
            max_count: None,
        }
    }

    /// Events at or after `position`, oldest first.
    #[must_use]
    pub const fn forward(position: StreamPosition) -> Self {
        Self {
            direction: ReadDirection::Forward,
            from: ReadFrom::Position(position),
            max_count: None,
        }
    }

    /// Every readable event, newest first.
    #[must_use]
    pub const fn backward_from_end() -> Self {
        Self {
            direction: ReadDirection::Backward,
            from: ReadFrom::End,
            max_count: None,
        }
    }

    /// Events at or before `position`, newest first.
    #[must_use]
    pub const fn backward(position: StreamPosition) -> Self {
        Self {
            direction: ReadDirection::Backward,
            from: ReadFrom::Position(position),
            max_count: None,
        }
    }

    /// Limit the number of returned events.
    #[must_use]
    pub const fn with_max_count(mut self, max_count: usize) -> Self {
        self.max_count = Some(max_count);
        self
    }

    /// Apply this request to a stream's readable events (ascending order).
    ///
    /// Shared by the in-memory stores so every implementation selects the
    /// same events for the same request.
    #[must_use]
    pub fn select(&self, events: &[RecordedEvent]) -> Vec<RecordedEvent> {
        let limit = self.max_count.unwrap_or(usize::MAX);
        match self.direction {
            ReadDirection::Forward => {
                let from = match self.from {
                    ReadFrom::Start => StreamPosition::START,
                    ReadFrom::End => return events.last().cloned().into_iter().take(limit).collect(),
                    ReadFrom::Position(position) => position,
                };
                events
                    .iter()
                    .filter(|event| event.stream_position >= from)
                    .take(limit)
                    .cloned()
                    .collect()
            }
            ReadDirection::Backward => {
                let upto = match self.from {
                    ReadFrom::Start => {
                        return events.first().cloned().into_iter().take(limit).collect();
                    }
                    ReadFrom::End => None,
                    ReadFrom::Position(position) => Some(position),
                };
                events
                    .iter()
                    .rev()
                    .filter(|event| upto.is_none_or(|upto| event.stream_position <= upto))
                    .take(limit)
                    .cloned()
                    .collect()
            }
        }
    }
}

/// Result of a successful append.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AppendEventsResult {
    /// The stream version after the append; pass it as `ExpectedVersion::Exact`
    /// on the next append.
    pub next_expected_version: Version,
    /// Global position of the last appended event.
    pub global_position: GlobalPosition,
}

/// Event store abstraction over an append-only, per-stream log.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` to be shared across tasks.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// to enable trait object usage (`Arc<dyn EventStore>`).
pub trait EventStore: Send + Sync {
    /// Whether the stream exists (and is not soft-deleted).
    ///
    /// # Errors
    ///
    /// - `Transport`: The backing service failed
    fn stream_exists(
        &self,
        stream_name: StreamName,
    ) -> Pin<Box<dyn Future<Output = Result<bool, EventStoreError>> + Send + '_>>;

    /// Read events from a stream.
    ///
    /// Returns events in the requested direction. A stream that holds fewer
    /// events than requested yields the ones it has (possibly none); it is
    /// never an error.
    ///
    /// # Errors
    ///
    /// - `StreamNotFound`: The stream does not exist or was deleted
    /// - `Transport`: The backing service failed
    fn read_stream(
        &self,
        stream_name: StreamName,
        request: ReadRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RecordedEvent>, EventStoreError>> + Send + '_>>;

    /// Atomically append events if the stream matches `expected_version`.
    ///
    /// Either every event is appended, in order, or none is.
    ///
    /// # Errors
    ///
    /// - `ConcurrencyConflict`: The stream is not at the expected version
    /// - `EmptyAppend`: `events` is empty
    /// - `Transport`: The backing service failed
    fn append_events(
        &self,
        stream_name: StreamName,
        expected_version: ExpectedVersion,
        events: Vec<SerializedEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<AppendEventsResult, EventStoreError>> + Send + '_>>;

    /// Hide every event whose position is below `before`.
    ///
    /// The stream version is unchanged; later appends continue numbering.
    ///
    /// # Errors
    ///
    /// - `StreamNotFound`: The stream does not exist
    /// - `ConcurrencyConflict`: The stream is not at the expected version
    /// - `Transport`: The backing service failed
    fn truncate_stream(
        &self,
        stream_name: StreamName,
        before: StreamPosition,
        expected_version: ExpectedVersion,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send + '_>>;

    /// Soft-delete a stream (see the module docs).
    ///
    /// # Errors
    ///
    /// - `StreamNotFound`: The stream does not exist
    /// - `ConcurrencyConflict`: The stream is not at the expected version
    /// - `Transport`: The backing service failed
    fn delete_stream(
        &self,
        stream_name: StreamName,
        expected_version: ExpectedVersion,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send + '_>>;

    /// Append to a stream that must not exist yet.
    ///
    /// # Errors
    ///
    /// Same as [`append_events`](Self::append_events).
    fn append_new_events(
        &self,
        stream_name: StreamName,
        events: Vec<SerializedEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<AppendEventsResult, EventStoreError>> + Send + '_>> {
        self.append_events(stream_name, ExpectedVersion::NoStream, events)
    }

    /// Every readable event of a stream, oldest first.
    ///
    /// # Errors
    ///
    /// Same as [`read_stream`](Self::read_stream).
    fn read_events_from_start(
        &self,
        stream_name: StreamName,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RecordedEvent>, EventStoreError>> + Send + '_>> {
        self.read_stream(stream_name, ReadRequest::forward_from_start())
    }

    /// Events at or after `position`, oldest first.
    ///
    /// # Errors
    ///
    /// Same as [`read_stream`](Self::read_stream).
    fn read_events(
        &self,
        stream_name: StreamName,
        position: StreamPosition,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RecordedEvent>, EventStoreError>> + Send + '_>> {
        self.read_stream(stream_name, ReadRequest::forward(position))
    }

    /// At most `max_count` events at or after `position`, oldest first.
    ///
    /// # Errors
    ///
    /// Same as [`read_stream`](Self::read_stream).
    fn read_events_with_max_count(
        &self,
        stream_name: StreamName,
        position: StreamPosition,
        max_count: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RecordedEvent>, EventStoreError>> + Send + '_>> {
        self.read_stream(stream_name, ReadRequest::forward(position).with_max_count(max_count))
    }

    /// Events at or before `position`, newest first.
    ///
    /// # Errors
    ///
    /// Same as [`read_stream`](Self::read_stream).
    fn read_events_backwards(
        &self,
        stream_name: StreamName,
        position: StreamPosition,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RecordedEvent>, EventStoreError>> + Send + '_>> {
        self.read_stream(stream_name, ReadRequest::backward(position))
    }

    /// At most `max_count` events at or before `position`, newest first.
    ///
    /// # Errors
    ///
    /// Same as [`read_stream`](Self::read_stream).
    fn read_events_backwards_with_max_count(
        &self,
        stream_name: StreamName,
        position: StreamPosition,
        max_count: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RecordedEvent>, EventStoreError>> + Send + '_>> {
        self.read_stream(stream_name, ReadRequest::backward(position).with_max_count(max_count))
    }

    /// The most recent event of a stream, if it has a readable one.
    ///
    /// Used for last-event-wins lookups.
    ///
    /// # Errors
    ///
    /// Same as [`read_stream`](Self::read_stream).
    fn read_last_event(
        &self,
        stream_name: StreamName,
    ) -> Pin<Box<dyn Future<Output = Result<Option<RecordedEvent>, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            let events = self
                .read_stream(stream_name, ReadRequest::backward_from_end().with_max_count(1))
                .await?;
            Ok(events.into_iter().next())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn recorded(position: u64) -> RecordedEvent {
        RecordedEvent {
            stream_name: StreamName::new("order-1"),
            stream_position: StreamPosition::new(position),
            global_position: GlobalPosition::new(position + 1),
            event_id: Uuid::new_v4(),
            event_type: "Test.v1".to_string(),
            data: vec![],
            metadata: None,
            recorded_at: Utc::now(),
        }
    }

    fn positions(events: &[RecordedEvent]) -> Vec<u64> {
        events.iter().map(|e| e.stream_position.value()).collect()
    }

    #[test]
    fn concurrency_conflict_error_display() {
        let error = EventStoreError::ConcurrencyConflict {
            stream_name: StreamName::new("order-1"),
            expected: ExpectedVersion::Exact(Version::new(5)),
            actual: Some(Version::new(7)),
        };
        let display = format!("{error}");
        assert!(display.contains("expected 5"));
        assert!(display.contains("found 7"));

        let error = EventStoreError::ConcurrencyConflict {
            stream_name: StreamName::new("order-1"),
            expected: ExpectedVersion::Exact(Version::new(5)),
            actual: None,
        };
        assert!(error.to_string().contains("found no stream"));
    }

    #[test]
    fn only_transport_errors_are_transient() {
        assert!(EventStoreError::Transport("down".into()).is_transient());
        assert!(!EventStoreError::StreamNotFound(StreamName::new("x")).is_transient());
        assert!(!EventStoreError::Serialization("bad".into()).is_transient());
    }

    #[test]
    fn select_forward() {
        let events: Vec<_> = (0..5).map(recorded).collect();
        assert_eq!(positions(&ReadRequest::forward_from_start().select(&events)), [0, 1, 2, 3, 4]);
        assert_eq!(positions(&ReadRequest::forward(StreamPosition::new(3)).select(&events)), [3, 4]);
        assert_eq!(
            positions(&ReadRequest::forward(StreamPosition::new(1)).with_max_count(2).select(&events)),
            [1, 2]
        );
    }

    #[test]
    fn select_past_the_end_is_empty() {
        let events: Vec<_> = (0..2).map(recorded).collect();
        assert!(ReadRequest::forward(StreamPosition::new(10)).select(&events).is_empty());
        assert_eq!(
            positions(&ReadRequest::forward_from_start().with_max_count(100).select(&events)),
            [0, 1]
        );
    }

    #[test]
    fn select_backward() {
        let events: Vec<_> = (0..5).map(recorded).collect();
        assert_eq!(positions(&ReadRequest::backward_from_end().select(&events)), [4, 3, 2, 1, 0]);
        assert_eq!(
            positions(&ReadRequest::backward(StreamPosition::new(2)).select(&events)),
            [2, 1, 0]
        );
        assert_eq!(
            positions(&ReadRequest::backward_from_end().with_max_count(1).select(&events)),
            [4]
        );
    }

    proptest::proptest! {
        #[test]
        fn forward_reads_are_ascending_and_bounded(len in 0u64..40, from in 0u64..50, max in 0usize..50) {
            let events: Vec<_> = (0..len).map(recorded).collect();
            let selected = ReadRequest::forward(StreamPosition::new(from))
                .with_max_count(max)
                .select(&events);

            let available = usize::try_from(len.saturating_sub(from)).unwrap_or(usize::MAX);
            proptest::prop_assert_eq!(selected.len(), available.min(max));
            proptest::prop_assert!(selected.windows(2).all(|w| w[0].stream_position < w[1].stream_position));
            proptest::prop_assert!(selected.iter().all(|e| e.stream_position.value() >= from));
        }
    }
}
