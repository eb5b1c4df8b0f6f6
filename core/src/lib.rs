//! # Eventline Core
//!
//! Core traits and types for event-sourced applications.
//!
//! This crate defines the write side (aggregates persisted as event streams
//! with optimistic concurrency) and the read side (catch-up subscriptions
//! feeding projections, with durable checkpoints). Storage backends and the
//! subscription worker live in sibling crates and code against the traits
//! defined here.
//!
//! ## Core Concepts
//!
//! - **Aggregate**: Decision model rebuilt by folding its own stream
//! - **Event store**: Append-only log of streams with a global order
//! - **Serializer**: Explicit type-name registry for events
//! - **Aggregate store**: Load / store aggregates with expected-version checks
//! - **Subscription**: Catch-up-then-live delivery of the global log
//! - **Checkpoint**: Last fully processed global position of a subscription
//! - **Projection**: Idempotent handler updating a read model
//!
//! ## Architecture Principles
//!
//! - The log is the only source of truth
//! - Closed event enums with stable, versioned type names
//! - Conflicts are surfaced, never silently retried
//! - At-least-once delivery to projections
//!
//! ## Example
//!
//! ```ignore
//! use eventline_core::*;
//!
//! let registry = Arc::new(order_event_registry()?);
//! let orders = AggregateStore::<Order>::new(event_store, Serializer::new(registry));
//!
//! let mut order = orders.load_or_new(&order_id).await?;
//! order.pay(amount)?;
//! orders.store(&mut order, &CommandMetadata::correlated(request_id)).await?;
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod aggregate;
pub mod aggregate_store;
pub mod checkpoint;
pub mod event;
pub mod event_bus;
pub mod event_store;
pub mod projection;
pub mod serializer;
pub mod stream;
pub mod subscription;

pub use aggregate::{Aggregate, AggregateBase};
pub use aggregate_store::{AggregateStore, AggregateStoreError};
pub use checkpoint::{Checkpoint, CheckpointError, CheckpointRepository};
pub use event::{CommandMetadata, Event, EventError, EventMetadata, RecordedEvent, SerializedEvent};
pub use event_bus::{EventBus, EventBusError};
pub use event_store::{AppendEventsResult, EventStore, EventStoreError, ReadDirection, ReadFrom, ReadRequest};
pub use projection::{Projection, ProjectionError, ProjectionStore, Projections, ProjectionsBuilder};
pub use serializer::{EventTypeRegistry, Serializer};
pub use stream::{ExpectedVersion, GlobalPosition, StreamName, StreamPosition, Version};
pub use subscription::{SubscribeToAll, SubscriptionFilter, SubscriptionMessage, SubscriptionStream};

/// Environment module - injected dependencies.
///
/// External dependencies are abstracted behind traits so tests can swap in
/// deterministic implementations.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use eventline_core::environment::{Clock, SystemClock};
    ///
    /// let before = chrono::Utc::now();
    /// assert!(SystemClock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
