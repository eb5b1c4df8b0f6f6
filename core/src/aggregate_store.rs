//! Loading and storing aggregates through an event store.
//!
//! [`AggregateStore`] replays an aggregate's stream to rebuild it and appends
//! its pending events guarded by the version it was loaded at. Two handlers
//! that load the same version and both store will see exactly one success;
//! the other gets [`AggregateStoreError::ConcurrencyConflict`] and nothing of
//! its batch is written.
//!
//! # Example
//!
//! ```ignore
//! let store = AggregateStore::<Order>::new(event_store, serializer);
//!
//! let mut order = store.load(&order_id).await?;
//! order.pay(amount)?;
//! store.store(&mut order, &CommandMetadata::correlated(request_id)).await?;
//! ```

use crate::aggregate::Aggregate;
use crate::environment::{Clock, SystemClock};
use crate::event::{CommandMetadata, EventError, RecordedEvent};
use crate::event_store::{AppendEventsResult, EventStore, EventStoreError};
use crate::serializer::Serializer;
use crate::stream::{ExpectedVersion, StreamName, StreamPosition, Version};
use std::sync::Arc;
use thiserror::Error;

/// Errors returned by [`AggregateStore`].
#[derive(Error, Debug)]
pub enum AggregateStoreError {
    /// The aggregate's stream does not exist.
    #[error("Aggregate not found: {0}")]
    NotFound(StreamName),

    /// The stream exists but every event in it was truncated away.
    ///
    /// The stream keeps its version, so it cannot be recreated with a fresh
    /// aggregate either.
    #[error("Aggregate stream {0} is truncated and has no readable events")]
    Truncated(StreamName),

    /// Another writer stored the aggregate since it was loaded.
    #[error("Concurrency conflict on {stream_name}: expected {expected}, found {}", display_actual(.actual))]
    ConcurrencyConflict {
        /// The aggregate's stream.
        stream_name: StreamName,
        /// Expectation derived from the loaded version.
        expected: ExpectedVersion,
        /// Version found in the store.
        actual: Option<Version>,
    },

    /// The requested historical version does not exist in the stream.
    #[error("Version {requested} of {stream_name} is not available")]
    VersionUnavailable {
        /// The aggregate's stream.
        stream_name: StreamName,
        /// The version asked for.
        requested: Version,
    },

    /// An event could not be encoded or decoded.
    #[error(transparent)]
    Serialization(#[from] EventError),

    /// A stored event was rejected by the aggregate during replay.
    #[error("Failed to replay {stream_name} at position {position}: {source}")]
    Replay {
        /// The aggregate's stream.
        stream_name: StreamName,
        /// Position of the rejected event.
        position: StreamPosition,
        /// Error returned by the aggregate.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Any other event store failure.
    #[error(transparent)]
    EventStore(EventStoreError),
}

fn display_actual(actual: &Option<Version>) -> String {
    actual.map_or_else(|| "no stream".to_string(), |version| version.to_string())
}

impl AggregateStoreError {
    /// Whether reloading and retrying the command may succeed.
    #[must_use]
    pub const fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }

    /// Whether the failure came from an unreachable backing service.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::EventStore(error) if error.is_transient())
    }
}

impl From<EventStoreError> for AggregateStoreError {
    fn from(error: EventStoreError) -> Self {
        match error {
            EventStoreError::StreamNotFound(stream_name) => Self::NotFound(stream_name),
            EventStoreError::ConcurrencyConflict {
                stream_name,
                expected,
                actual,
            } => Self::ConcurrencyConflict {
                stream_name,
                expected,
                actual,
            },
            other => Self::EventStore(other),
        }
    }
}

/// Repository of aggregates of type `A`, backed by an [`EventStore`].
pub struct AggregateStore<A: Aggregate> {
    event_store: Arc<dyn EventStore>,
    serializer: Serializer<A::Event>,
    clock: Arc<dyn Clock>,
}

impl<A: Aggregate> AggregateStore<A> {
    /// Create a store using the system clock for event timestamps.
    #[must_use]
    pub fn new(event_store: Arc<dyn EventStore>, serializer: Serializer<A::Event>) -> Self {
        Self {
            event_store,
            serializer,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` for event metadata timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The serializer used for this aggregate's events.
    #[must_use]
    pub const fn serializer(&self) -> &Serializer<A::Event> {
        &self.serializer
    }

    /// Rebuild the aggregate from its readable stream.
    ///
    /// The result has no pending events and its version equals the number of
    /// events committed to the stream. Events hidden by a truncation or by a
    /// delete-then-recreate are not replayed: the first readable event is
    /// applied to a fresh aggregate.
    ///
    /// # Errors
    ///
    /// - `NotFound`: The stream does not exist
    /// - `Truncated`: The stream exists but has no readable events
    /// - `Serialization`: A stored event has an unknown type or corrupt payload
    /// - `Replay`: The aggregate rejected a stored event
    /// - `EventStore`: The store failed
    #[tracing::instrument(skip_all, fields(aggregate_type = A::AGGREGATE_TYPE, id = %id))]
    pub async fn load(&self, id: &A::Id) -> Result<A, AggregateStoreError> {
        let stream_name = A::stream_name_for(id);
        let events = self
            .event_store
            .read_events_from_start(stream_name.clone())
            .await?;
        if events.is_empty() {
            return Err(AggregateStoreError::Truncated(stream_name));
        }

        let aggregate = self.replay(id, &stream_name, &events)?;
        metrics::counter!("eventline_aggregate_loads_total", "aggregate_type" => A::AGGREGATE_TYPE)
            .increment(1);
        tracing::debug!(version = %aggregate.version(), events = events.len(), "Aggregate loaded");
        Ok(aggregate)
    }

    /// Like [`load`](Self::load), but a missing stream yields a fresh aggregate.
    ///
    /// A truncated stream is not missing and still fails with `Truncated`.
    ///
    /// # Errors
    ///
    /// Same as [`load`](Self::load), except `NotFound`.
    pub async fn load_or_new(&self, id: &A::Id) -> Result<A, AggregateStoreError> {
        match self.load(id).await {
            Err(AggregateStoreError::NotFound(_)) => Ok(A::new(id.clone())),
            other => other,
        }
    }

    /// Rebuild the aggregate as it was after its first `version` events.
    ///
    /// The returned aggregate carries `version`; storing it will conflict if
    /// the stream has moved on since.
    ///
    /// # Errors
    ///
    /// - `VersionUnavailable`: The stream never reached `version`, or the
    ///   events leading to it were truncated
    /// - Everything [`load`](Self::load) can return
    #[tracing::instrument(skip_all, fields(aggregate_type = A::AGGREGATE_TYPE, id = %id, version = %version))]
    pub async fn load_at_version(
        &self,
        id: &A::Id,
        version: Version,
    ) -> Result<A, AggregateStoreError> {
        let stream_name = A::stream_name_for(id);
        let unavailable = || AggregateStoreError::VersionUnavailable {
            stream_name: stream_name.clone(),
            requested: version,
        };

        let max_count = usize::try_from(version.value()).map_err(|_| unavailable())?;
        let mut events = self
            .event_store
            .read_events_with_max_count(stream_name.clone(), StreamPosition::START, max_count)
            .await?;
        events.retain(|event| event.stream_position < version.next_position());

        match events.last() {
            Some(last) if last.stream_position.version_after() == version => {}
            _ => return Err(unavailable()),
        }

        self.replay(id, &stream_name, &events)
    }

    /// Whether the aggregate's stream exists.
    ///
    /// # Errors
    ///
    /// Returns `EventStore` if the store fails.
    pub async fn exists(&self, id: &A::Id) -> Result<bool, AggregateStoreError> {
        Ok(self.event_store.stream_exists(A::stream_name_for(id)).await?)
    }

    /// Append the aggregate's pending events in one atomic write.
    ///
    /// The append expects the stream to be at the aggregate's loaded version
    /// (`NoStream` for a never-persisted aggregate). On success the pending
    /// events are cleared and the version advances; on any error the
    /// aggregate is left untouched. Returns `None` when nothing was pending.
    ///
    /// # Errors
    ///
    /// - `ConcurrencyConflict`: The stream moved since the aggregate was loaded
    /// - `Serialization`: A pending event could not be encoded
    /// - `EventStore`: The store failed
    #[tracing::instrument(
        skip_all,
        fields(
            stream = %aggregate.stream_name(),
            version = %aggregate.version(),
            pending = aggregate.pending_events().len()
        )
    )]
    pub async fn store(
        &self,
        aggregate: &mut A,
        metadata: &CommandMetadata,
    ) -> Result<Option<AppendEventsResult>, AggregateStoreError> {
        if !aggregate.base().has_pending() {
            return Ok(None);
        }

        let timestamp = self.clock.now();
        let events = aggregate
            .pending_events()
            .iter()
            .map(|event| self.serializer.serialize(event, metadata, timestamp))
            .collect::<Result<Vec<_>, _>>()?;

        let expected = ExpectedVersion::from_loaded(aggregate.version());
        let result = match self
            .event_store
            .append_events(aggregate.stream_name(), expected, events)
            .await
        {
            Ok(result) => result,
            Err(error) => {
                if error.is_concurrency_conflict() {
                    metrics::counter!(
                        "eventline_aggregate_conflicts_total",
                        "aggregate_type" => A::AGGREGATE_TYPE
                    )
                    .increment(1);
                    tracing::warn!(%error, "Concurrency conflict while storing aggregate");
                }
                return Err(error.into());
            }
        };

        let base = aggregate.base_mut();
        base.clear();
        base.set_version(result.next_expected_version);

        metrics::counter!("eventline_aggregate_stores_total", "aggregate_type" => A::AGGREGATE_TYPE)
            .increment(1);
        tracing::debug!(
            next_version = %result.next_expected_version,
            global_position = %result.global_position,
            "Aggregate stored"
        );
        Ok(Some(result))
    }

    fn replay(
        &self,
        id: &A::Id,
        stream_name: &StreamName,
        events: &[RecordedEvent],
    ) -> Result<A, AggregateStoreError> {
        let Some(last) = events.last() else {
            return Err(AggregateStoreError::NotFound(stream_name.clone()));
        };
        let version = last.stream_position.version_after();

        let mut aggregate = A::new(id.clone());
        for recorded in events {
            let event = self.serializer.deserialize(recorded)?;
            aggregate
                .when(&event)
                .map_err(|error| AggregateStoreError::Replay {
                    stream_name: stream_name.clone(),
                    position: recorded.stream_position,
                    source: Box::new(error),
                })?;
        }
        aggregate.base_mut().set_version(version);
        Ok(aggregate)
    }
}

impl<A: Aggregate> Clone for AggregateStore<A> {
    fn clone(&self) -> Self {
        Self {
            event_store: Arc::clone(&self.event_store),
            serializer: self.serializer.clone(),
            clock: Arc::clone(&self.clock),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_not_found_maps_to_not_found() {
        let error: AggregateStoreError =
            EventStoreError::StreamNotFound(StreamName::new("order-1")).into();
        assert!(matches!(error, AggregateStoreError::NotFound(ref name) if name.as_str() == "order-1"));
    }

    #[test]
    fn conflicts_are_recognised() {
        let error: AggregateStoreError = EventStoreError::ConcurrencyConflict {
            stream_name: StreamName::new("order-1"),
            expected: ExpectedVersion::NoStream,
            actual: Some(Version::new(1)),
        }
        .into();
        assert!(error.is_concurrency_conflict());
        assert!(!error.is_transient());
        assert!(error.to_string().contains("expected no stream, found 1"));
    }

    #[test]
    fn transport_errors_are_transient() {
        let error: AggregateStoreError = EventStoreError::Transport("timeout".into()).into();
        assert!(error.is_transient());
        assert!(!error.is_concurrency_conflict());
    }
}
