//! Event bus abstraction for integration events.
//!
//! Projections may republish domain events to other systems as integration
//! events. The log remains the source of truth: an event is published only
//! after it was committed, and because workers deliver at-least-once the same
//! integration event can be published more than once. Consumers deduplicate
//! on the event id carried in the envelope.
//!
//! ```text
//! ┌─────────────┐     ┌──────────────────┐     ┌────────────────┐
//! │  Event log  │ ──► │ Subscription     │ ──► │ Integration    │ ──► bus topic
//! │ (committed) │     │ worker           │     │ projection     │
//! └─────────────┘     └──────────────────┘     └────────────────┘
//! ```
//!
//! # Implementations
//!
//! - `InMemoryEventBus` (in `eventline-testing`): Records published events for assertions

use crate::event::SerializedEvent;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    /// Failed to connect to the event bus
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish an event to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },
}

/// Publisher of integration events.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// to enable trait object usage (`Arc<dyn EventBus>`).
pub trait EventBus: Send + Sync {
    /// Publish an event to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the publish operation fails.
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;
}
