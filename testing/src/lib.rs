//! # Eventline Testing
//!
//! Testing utilities and helpers for Eventline applications.
//!
//! This crate provides:
//! - In-memory implementations of the event store, checkpoint repository,
//!   projection store and event bus, with fault injection
//! - A fixed clock for deterministic timestamps
//! - Helpers to build recorded events and a projection test harness
//!
//! ## Example
//!
//! ```ignore
//! use eventline_testing::{InMemoryEventStore, test_clock};
//!
//! #[tokio::test]
//! async fn paying_twice_is_rejected() {
//!     let event_store = Arc::new(InMemoryEventStore::new());
//!     let orders = AggregateStore::<Order>::new(event_store, order_serializer()?)
//!         .with_clock(Arc::new(test_clock()));
//!     // ...
//! }
//! ```

use chrono::{DateTime, Utc};
use eventline_core::environment::Clock;

pub mod event_bus;
pub mod event_store;
pub mod projection_mocks;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Clock that always returns the same instant.
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a clock frozen at `time`.
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// A [`FixedClock`] at `2025-01-01T00:00:00Z`.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Builders for test data.
pub mod helpers {
    use eventline_core::environment::Clock;
    use eventline_core::event::{Event, RecordedEvent};
    use eventline_core::stream::{GlobalPosition, StreamName, StreamPosition};
    use uuid::Uuid;

    /// Build a [`RecordedEvent`] as the log would hand it out.
    ///
    /// # Panics
    ///
    /// Panics if `event` cannot be encoded.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn recorded_event<E: Event>(
        stream_name: &str,
        stream_position: u64,
        global_position: u64,
        event: &E,
    ) -> RecordedEvent {
        RecordedEvent {
            stream_name: StreamName::new(stream_name),
            stream_position: StreamPosition::new(stream_position),
            global_position: GlobalPosition::new(global_position),
            event_id: Uuid::new_v4(),
            event_type: event.event_type().to_string(),
            data: event.to_payload().expect("test event should encode"),
            metadata: None,
            recorded_at: super::mocks::test_clock().now(),
        }
    }

    /// A recorded event with an opaque payload.
    #[must_use]
    pub fn raw_event(
        stream_name: &str,
        stream_position: u64,
        global_position: u64,
        event_type: &str,
    ) -> RecordedEvent {
        RecordedEvent {
            stream_name: StreamName::new(stream_name),
            stream_position: StreamPosition::new(stream_position),
            global_position: GlobalPosition::new(global_position),
            event_id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            data: Vec::new(),
            metadata: None,
            recorded_at: super::mocks::test_clock().now(),
        }
    }
}

// Re-export commonly used items
pub use event_bus::InMemoryEventBus;
pub use event_store::InMemoryEventStore;
pub use mocks::{FixedClock, test_clock};
pub use projection_mocks::{
    InMemoryCheckpointRepository, InMemoryProjectionStore, ProjectionTestHarness,
    RecordingProjection,
};
