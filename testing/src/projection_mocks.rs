//! In-memory projection testing utilities
//!
//! Provides fast, deterministic testing infrastructure for the read side:
//! - [`InMemoryProjectionStore`]: HashMap-based read-model storage
//! - [`InMemoryCheckpointRepository`]: Monotonic in-memory checkpoints
//! - [`RecordingProjection`]: Records what it handled, fails on demand
//! - [`ProjectionTestHarness`]: Fluent API for projection tests

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use eventline_core::checkpoint::{Checkpoint, CheckpointError, CheckpointRepository, ensure_forward};
use eventline_core::environment::{Clock, SystemClock};
use eventline_core::event::RecordedEvent;
use eventline_core::projection::{Projection, ProjectionError, ProjectionStore, Result};
use eventline_core::stream::GlobalPosition;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// In-memory projection store for fast, deterministic testing.
///
/// # Example
///
/// ```
/// use eventline_testing::InMemoryProjectionStore;
/// use eventline_core::projection::ProjectionStore;
///
/// # tokio_test::block_on(async {
/// let store = InMemoryProjectionStore::new();
/// store.save("order:123", b"summary").await.unwrap();
/// assert!(store.get("order:123").await.unwrap().is_some());
/// # });
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryProjectionStore {
    data: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl InMemoryProjectionStore {
    /// Create a new empty in-memory projection store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all projection data (for test isolation)
    pub fn clear(&self) {
        self.data.write().unwrap().clear();
    }

    /// Get the number of stored documents
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().unwrap().len()
    }

    /// Check if the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().unwrap().is_empty()
    }

    /// Check if a key exists in the store
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.data.read().unwrap().contains_key(key)
    }

    /// All keys, sorted
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.read().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Copy of every document, for comparing read-model states.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, Vec<u8>> {
        self.data.read().unwrap().clone()
    }
}

impl ProjectionStore for InMemoryProjectionStore {
    async fn save(&self, key: &str, data: &[u8]) -> Result<()> {
        self.data
            .write()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().unwrap().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.data.write().unwrap().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.data.read().unwrap().contains_key(key))
    }
}

/// In-memory checkpoint repository for testing worker resumption.
///
/// Enforces the same monotonicity as the Postgres repository.
///
/// # Example
///
/// ```
/// use eventline_testing::InMemoryCheckpointRepository;
/// use eventline_core::checkpoint::CheckpointRepository;
/// use eventline_core::stream::GlobalPosition;
///
/// # tokio_test::block_on(async {
/// let checkpoints = InMemoryCheckpointRepository::new();
/// checkpoints.store("orders", GlobalPosition::new(42)).await.unwrap();
///
/// let loaded = checkpoints.load("orders").await.unwrap();
/// assert_eq!(loaded.map(|c| c.position), Some(GlobalPosition::new(42)));
/// # });
/// ```
#[derive(Clone)]
pub struct InMemoryCheckpointRepository {
    checkpoints: Arc<RwLock<HashMap<String, Checkpoint>>>,
    failing_stores: Arc<AtomicUsize>,
    clock: Arc<dyn Clock>,
}

impl InMemoryCheckpointRepository {
    /// Create an empty repository
    #[must_use]
    pub fn new() -> Self {
        Self {
            checkpoints: Arc::new(RwLock::new(HashMap::new())),
            failing_stores: Arc::new(AtomicUsize::new(0)),
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` for `updated_at`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Seed a checkpoint directly (bypasses monotonicity).
    pub fn seed(&self, subscription_id: &str, position: GlobalPosition) {
        self.checkpoints.write().unwrap().insert(
            subscription_id.to_string(),
            Checkpoint {
                subscription_id: subscription_id.to_string(),
                position,
                updated_at: self.clock.now(),
            },
        );
    }

    /// Current position of a subscription, if any.
    #[must_use]
    pub fn position(&self, subscription_id: &str) -> Option<GlobalPosition> {
        self.checkpoints
            .read()
            .unwrap()
            .get(subscription_id)
            .map(|checkpoint| checkpoint.position)
    }

    /// Fail the next `count` stores with a storage error.
    pub fn fail_next_stores(&self, count: usize) {
        self.failing_stores.store(count, Ordering::SeqCst);
    }
}

impl Default for InMemoryCheckpointRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryCheckpointRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCheckpointRepository")
            .field("checkpoints", &*self.checkpoints.read().unwrap())
            .finish_non_exhaustive()
    }
}

impl CheckpointRepository for InMemoryCheckpointRepository {
    fn load(
        &self,
        subscription_id: &str,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<Option<Checkpoint>, CheckpointError>> + Send + '_>>
    {
        let subscription_id = subscription_id.to_string();
        Box::pin(async move { Ok(self.checkpoints.read().unwrap().get(&subscription_id).cloned()) })
    }

    fn store(
        &self,
        subscription_id: &str,
        position: GlobalPosition,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<(), CheckpointError>> + Send + '_>> {
        let subscription_id = subscription_id.to_string();
        Box::pin(async move {
            let injected = self
                .failing_stores
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if injected {
                return Err(CheckpointError::Storage("injected store failure".to_string()));
            }

            let mut checkpoints = self.checkpoints.write().unwrap();
            let current = checkpoints.get(&subscription_id).map(|c| c.position);
            ensure_forward(&subscription_id, current, position)?;
            checkpoints.insert(
                subscription_id.clone(),
                Checkpoint {
                    subscription_id,
                    position,
                    updated_at: self.clock.now(),
                },
            );
            Ok(())
        })
    }

    fn reset(
        &self,
        subscription_id: &str,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<(), CheckpointError>> + Send + '_>> {
        let subscription_id = subscription_id.to_string();
        Box::pin(async move {
            self.checkpoints.write().unwrap().remove(&subscription_id);
            Ok(())
        })
    }
}

/// Projection that records every event it handles.
///
/// Handles every event type unless restricted with
/// [`with_event_types`](Self::with_event_types). Failures can be scheduled
/// for a given global position to exercise the worker's failure handling.
#[derive(Clone)]
pub struct RecordingProjection {
    name: String,
    event_types: Option<Vec<String>>,
    handled: Arc<RwLock<Vec<RecordedEvent>>>,
    failures: Arc<RwLock<HashMap<GlobalPosition, usize>>>,
    journal: Option<Arc<RwLock<Vec<String>>>>,
}

impl RecordingProjection {
    /// A projection named `name` handling every event type.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            event_types: None,
            handled: Arc::new(RwLock::new(Vec::new())),
            failures: Arc::new(RwLock::new(HashMap::new())),
            journal: None,
        }
    }

    /// Only handle these event types.
    #[must_use]
    pub fn with_event_types<I, S>(mut self, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types = Some(event_types.into_iter().map(Into::into).collect());
        self
    }

    /// Append `"{name}@{global_position}"` to a journal shared with other
    /// projections, to assert cross-projection ordering.
    #[must_use]
    pub fn with_journal(mut self, journal: Arc<RwLock<Vec<String>>>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Fail the next `times` deliveries of the event at `position`.
    pub fn fail_at(&self, position: GlobalPosition, times: usize) {
        self.failures.write().unwrap().insert(position, times);
    }

    /// Every successfully handled event, in handling order (duplicates included).
    #[must_use]
    pub fn handled(&self) -> Vec<RecordedEvent> {
        self.handled.read().unwrap().clone()
    }

    /// Global positions of successfully handled events, in handling order.
    #[must_use]
    pub fn handled_positions(&self) -> Vec<u64> {
        self.handled
            .read()
            .unwrap()
            .iter()
            .map(|event| event.global_position.value())
            .collect()
    }

    fn take_failure(&self, position: GlobalPosition) -> bool {
        let mut failures = self.failures.write().unwrap();
        match failures.get_mut(&position) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

impl Projection for RecordingProjection {
    fn name(&self) -> &str {
        &self.name
    }

    fn handles(&self, event_type: &str) -> bool {
        self.event_types
            .as_ref()
            .is_none_or(|types| types.iter().any(|t| t == event_type))
    }

    fn handle<'a>(
        &'a self,
        event: &'a RecordedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if self.take_failure(event.global_position) {
                return Err(ProjectionError::EventProcessing(format!(
                    "injected failure at {}",
                    event.global_position
                )));
            }
            self.handled.write().unwrap().push(event.clone());
            if let Some(journal) = &self.journal {
                journal
                    .write()
                    .unwrap()
                    .push(format!("{}@{}", self.name, event.global_position));
            }
            Ok(())
        })
    }
}

/// Test harness for projections providing a fluent testing API.
///
/// # Example
///
/// ```ignore
/// let store = Arc::new(InMemoryProjectionStore::new());
/// let mut harness = ProjectionTestHarness::new(OrderReadModelProjection::new(store.clone(), serializer), store);
///
/// harness.given_events(vec![created, paid]).await?;
/// harness.then_contains("order:1").await?;
/// ```
pub struct ProjectionTestHarness<P: Projection> {
    projection: P,
    store: Arc<InMemoryProjectionStore>,
}

impl<P: Projection> ProjectionTestHarness<P> {
    /// Create a new test harness for the given projection.
    ///
    /// `store` must be the instance the projection writes to.
    #[must_use]
    pub const fn new(projection: P, store: Arc<InMemoryProjectionStore>) -> Self {
        Self { projection, store }
    }

    /// Deliver events in order, skipping types the projection does not handle
    /// (as the worker does).
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if any event fails to apply.
    pub async fn given_events(&mut self, events: Vec<RecordedEvent>) -> Result<&mut Self> {
        for event in &events {
            self.deliver(event).await?;
        }
        Ok(self)
    }

    /// Deliver a single event.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if the event fails to apply.
    pub async fn given_event(&mut self, event: RecordedEvent) -> Result<&mut Self> {
        self.deliver(&event).await?;
        Ok(self)
    }

    async fn deliver(&self, event: &RecordedEvent) -> Result<()> {
        if self.projection.handles(&event.event_type) {
            self.projection.handle(event).await?;
        }
        Ok(())
    }

    /// Assert that the projection store contains the given key.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if the query fails.
    ///
    /// # Panics
    ///
    /// Panics if the key is not found in the store (this is a test assertion).
    pub async fn then_contains(&self, key: &str) -> Result<&Self> {
        let exists = self.store.exists(key).await?;
        assert!(
            exists,
            "Expected projection store to contain key '{key}', but it was not found"
        );
        Ok(self)
    }

    /// Assert that the projection store does not contain the given key.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if the query fails.
    ///
    /// # Panics
    ///
    /// Panics if the key is found in the store (this is a test assertion).
    pub async fn then_not_contains(&self, key: &str) -> Result<&Self> {
        let exists = self.store.exists(key).await?;
        assert!(
            !exists,
            "Expected projection store to NOT contain key '{key}', but it was found"
        );
        Ok(self)
    }

    /// Get a document from the projection store.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if the query fails.
    pub async fn get_data(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.store.get(key).await
    }

    /// The underlying projection store.
    #[must_use]
    pub const fn store(&self) -> &Arc<InMemoryProjectionStore> {
        &self.store
    }

    /// The projection under test.
    #[must_use]
    pub const fn projection(&self) -> &P {
        &self.projection
    }
}
