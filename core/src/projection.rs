//! Projections: event handlers that maintain read models.
//!
//! # Overview
//!
//! Projections are the **query side of CQRS**. A
//! `SubscriptionAllWorker` tails the global log and hands every event to each
//! registered [`Projection`] that handles its type, in log order. A projection
//! updates a read model (through a [`ProjectionStore`]) and/or republishes the
//! event as an integration event on an [`EventBus`](crate::event_bus::EventBus).
//!
//! Delivery is at-least-once: after a crash the event that was in flight is
//! delivered again. Projections must therefore be idempotent, typically by
//! upserting keyed by aggregate id and remembering the last applied global
//! position.
//!
//! ## Composition
//!
//! [`ProjectionsBuilder`] collects projections in order and freezes them into
//! an immutable [`Projections`] list. Order matters when several projections
//! write to the same external resource.
//!
//! ```ignore
//! let projections = ProjectionsBuilder::new()
//!     .add_projection(OrderReadModelProjection::new(store, serializer.clone()))
//!     .add_projection(OrderIntegrationProjection::new(bus, serializer))
//!     .build();
//! ```

use crate::event::{EventError, RecordedEvent};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Error type for projection operations.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Event processing error
    #[error("Event processing error: {0}")]
    EventProcessing(String),

    /// Republishing to the event bus failed
    #[error("Publish error: {0}")]
    Publish(String),

    /// Generic error
    #[error("Projection error: {0}")]
    Other(String),
}

impl From<EventError> for ProjectionError {
    fn from(error: EventError) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;

/// A handler that folds recorded events into a read model.
///
/// # Idempotency
///
/// `handle` may be called more than once for the same event (after a crash,
/// a reconnect or a checkpoint reset). Processing an event twice must leave
/// the read model as if it had been processed once.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns so projections can
/// be stored as `Arc<dyn Projection>` in a [`Projections`] list.
pub trait Projection: Send + Sync {
    /// Unique projection name (used in logs, metrics and errors).
    fn name(&self) -> &str;

    /// Whether this projection handles events of `event_type`.
    ///
    /// Events of other types are never passed to [`handle`](Self::handle).
    fn handles(&self, event_type: &str) -> bool;

    /// Apply one event.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if the event cannot be processed. The
    /// worker does not advance its checkpoint past a failing event.
    fn handle<'a>(
        &'a self,
        event: &'a RecordedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Ordered collection of projections under construction.
#[derive(Default)]
pub struct ProjectionsBuilder {
    projections: Vec<Arc<dyn Projection>>,
}

impl ProjectionsBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a projection.
    #[must_use]
    pub fn add_projection<P: Projection + 'static>(mut self, projection: P) -> Self {
        self.projections.push(Arc::new(projection));
        self
    }

    /// Append projections that are already shared, preserving their order.
    #[must_use]
    pub fn add_projections<I>(mut self, projections: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Projection>>,
    {
        self.projections.extend(projections);
        self
    }

    /// Freeze the list.
    #[must_use]
    pub fn build(self) -> Projections {
        Projections {
            projections: self.projections.into(),
        }
    }
}

impl fmt::Debug for ProjectionsBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectionsBuilder")
            .field("projections", &names(&self.projections))
            .finish()
    }
}

/// Immutable, ordered list of projections. Cheap to clone.
#[derive(Clone)]
pub struct Projections {
    projections: Arc<[Arc<dyn Projection>]>,
}

impl Projections {
    /// Number of projections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.projections.len()
    }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.projections.is_empty()
    }

    /// All projections, in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Projection>> {
        self.projections.iter()
    }

    /// Projections handling `event_type`, in registration order.
    pub fn matching<'a>(
        &'a self,
        event_type: &'a str,
    ) -> impl Iterator<Item = &'a Arc<dyn Projection>> + 'a {
        self.projections
            .iter()
            .filter(move |projection| projection.handles(event_type))
    }

    /// Projection names, in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        names(&self.projections)
    }
}

impl fmt::Debug for Projections {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Projections")
            .field("projections", &self.names())
            .finish()
    }
}

fn names(projections: &[Arc<dyn Projection>]) -> Vec<&str> {
    projections.iter().map(|projection| projection.name()).collect()
}

/// Storage backend for read-model documents.
///
/// Projections can use different storage from the event store, optimized
/// for query patterns. Documents are opaque bytes (usually JSON) under a
/// string key.
///
/// # Example
///
/// ```ignore
/// let store = PostgresProjectionStore::new(pool, "order_summaries");
/// store.save("order:123", &serde_json::to_vec(&summary)?).await?;
/// let data = store.get("order:123").await?;
/// ```
pub trait ProjectionStore: Send + Sync {
    /// Insert or replace the document under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if save fails.
    fn save(&self, key: &str, data: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Get the document under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if retrieval fails.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// Delete the document under `key` (no-op if absent).
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if deletion fails.
    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Check if a document exists.
    ///
    /// Default implementation uses [`ProjectionStore::get`].
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if check fails.
    fn exists(&self, key: &str) -> impl Future<Output = Result<bool>> + Send {
        async move { Ok(self.get(key).await?.is_some()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named {
        name: &'static str,
        types: &'static [&'static str],
    }

    impl Projection for Named {
        fn name(&self) -> &str {
            self.name
        }

        fn handles(&self, event_type: &str) -> bool {
            self.types.contains(&event_type)
        }

        fn handle<'a>(
            &'a self,
            _event: &'a RecordedEvent,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[test]
    fn build_preserves_registration_order() {
        let shared: Vec<Arc<dyn Projection>> = vec![
            Arc::new(Named { name: "b", types: &["A.v1"] }),
            Arc::new(Named { name: "c", types: &["A.v1"] }),
        ];
        let projections = ProjectionsBuilder::new()
            .add_projection(Named { name: "a", types: &["A.v1"] })
            .add_projections(shared)
            .add_projection(Named { name: "d", types: &["A.v1"] })
            .build();

        assert_eq!(projections.names(), ["a", "b", "c", "d"]);
        assert_eq!(projections.len(), 4);
    }

    #[test]
    fn matching_filters_by_event_type() {
        let projections = ProjectionsBuilder::new()
            .add_projection(Named { name: "orders", types: &["OrderCreated.v1", "OrderPaid.v1"] })
            .add_projection(Named { name: "payments", types: &["OrderPaid.v1"] })
            .build();

        let created: Vec<_> = projections
            .matching("OrderCreated.v1")
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(created, ["orders"]);

        let paid: Vec<_> = projections
            .matching("OrderPaid.v1")
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(paid, ["orders", "payments"]);

        assert_eq!(projections.matching("Unrelated.v1").count(), 0);
    }

    #[test]
    fn empty_builder_builds_empty_list() {
        let projections = ProjectionsBuilder::new().build();
        assert!(projections.is_empty());
    }
}
