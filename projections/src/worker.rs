//! `SubscriptionAllWorker`: drives projections from the global event log.
//!
//! # Overview
//!
//! The worker owns one subscription id. On start it loads the persisted
//! checkpoint, subscribes to every event after it (optionally filtered by
//! stream-name prefixes) and dispatches each event, in global order, to every
//! projection handling its type. Only after all of them succeed is the
//! checkpoint advanced to the event's position.
//!
//! ```text
//! ┌──────────────┐  catch-up + live   ┌───────────────────────┐
//! │  Event log   │ ─────────────────► │ SubscriptionAllWorker │
//! └──────────────┘                    └───┬───────────────┬───┘
//!                                         │ in order      │ after success
//!                                         ▼               ▼
//!                                   ┌────────────┐  ┌────────────┐
//!                                   │Projections │  │ Checkpoint │
//!                                   └────────────┘  └────────────┘
//! ```
//!
//! # States
//!
//! `Idle → Starting → CatchingUp → Live → Stopped`, with `Failed` reachable
//! from every state. A dropped subscription goes back to `Starting` and
//! resumes from the **persisted** checkpoint, never from the in-memory
//! cursor, so delivery is at-least-once.
//!
//! # Failure policy
//!
//! A failing projection is retried up to `projection_retry.max_retries`
//! times; after that the worker stops with [`WorkerError::Projection`] and the
//! checkpoint stays on the last fully processed event.
//!
//! # Example
//!
//! ```ignore
//! let projections = ProjectionsBuilder::new()
//!     .add_projection(OrderReadModelProjection::new(store, serializer.clone()))
//!     .add_projection(OrderIntegrationProjection::new(bus))
//!     .build();
//!
//! let worker = SubscriptionAllWorker::new(
//!     event_store,
//!     checkpoints,
//!     projections,
//!     WorkerConfig::new("orders-read-model").with_filter_prefixes(["order-"]),
//! );
//!
//! let mut handle = worker.start();
//! handle.wait_for(WorkerState::Live).await;
//!
//! // On shutdown: the in-flight event finishes, then the worker stops.
//! handle.stop().await?;
//! ```

use eventline_core::checkpoint::{CheckpointError, CheckpointRepository};
use eventline_core::event::RecordedEvent;
use eventline_core::event_store::EventStoreError;
use eventline_core::projection::{Projection, ProjectionError, Projections};
use eventline_core::stream::GlobalPosition;
use eventline_core::subscription::{SubscribeToAll, SubscriptionFilter, SubscriptionMessage};
use eventline_runtime::metrics::SubscriptionMetrics;
use eventline_runtime::retry::{RetryPolicy, retry_with_backoff, retry_with_predicate};
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Lifecycle state of a worker.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// Created, not started.
    Idle,
    /// Loading the checkpoint and opening the subscription.
    Starting,
    /// Replaying events committed before the subscription opened.
    CatchingUp,
    /// Receiving new events as they are committed.
    Live,
    /// Stopped on request.
    Stopped,
    /// Stopped on an unrecoverable error.
    Failed,
}

impl WorkerState {
    /// Whether the worker has finished.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::CatchingUp => "catching_up",
            Self::Live => "live",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Errors that stop a worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Loading or storing the checkpoint failed.
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// A projection kept failing on an event.
    #[error("Projection '{projection}' failed at global position {position}: {source}")]
    Projection {
        /// Name of the failing projection.
        projection: String,
        /// Position of the event that was not processed.
        position: GlobalPosition,
        /// Last error returned by the projection.
        #[source]
        source: ProjectionError,
    },

    /// The subscription failed with a non-transient error.
    #[error("Subscription error: {0}")]
    Subscription(EventStoreError),

    /// The event store stayed unreachable for longer than the reconnect policy allows.
    #[error("Gave up reconnecting after {attempts} attempts: {source}")]
    ReconnectExhausted {
        /// Reconnect attempts made.
        attempts: usize,
        /// Last connection error.
        #[source]
        source: EventStoreError,
    },

    /// The worker task panicked or was aborted.
    #[error("Worker task failed: {0}")]
    Task(String),
}

/// Configuration of one worker.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    subscription_id: String,
    filter: SubscriptionFilter,
    projection_retry: RetryPolicy,
    reconnect: RetryPolicy,
}

impl WorkerConfig {
    /// Configuration for `subscription_id`: every stream, three projection
    /// retries, reconnects with the default backoff.
    #[must_use]
    pub fn new(subscription_id: impl Into<String>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            filter: SubscriptionFilter::all(),
            projection_retry: RetryPolicy::default(),
            reconnect: RetryPolicy::builder()
                .max_retries(10)
                .initial_delay(Duration::from_millis(200))
                .max_delay(Duration::from_secs(30))
                .build(),
        }
    }

    /// Only process streams whose name starts with one of `prefixes`.
    #[must_use]
    pub fn with_filter_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter = SubscriptionFilter::with_prefixes(prefixes);
        self
    }

    /// Retries granted to a failing projection before the worker stops.
    #[must_use]
    pub fn with_projection_retry(mut self, policy: RetryPolicy) -> Self {
        self.projection_retry = policy;
        self
    }

    /// Backoff between reconnect attempts; exhausting it stops the worker.
    #[must_use]
    pub fn with_reconnect(mut self, policy: RetryPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// The subscription id (checkpoint key).
    #[must_use]
    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    /// The stream filter.
    #[must_use]
    pub const fn filter(&self) -> &SubscriptionFilter {
        &self.filter
    }
}

/// Catch-up-then-live subscription over the whole log feeding projections.
///
/// Exactly one worker may run per subscription id.
pub struct SubscriptionAllWorker {
    store: Arc<dyn SubscribeToAll>,
    checkpoints: Arc<dyn CheckpointRepository>,
    projections: Projections,
    config: WorkerConfig,
    state: watch::Sender<WorkerState>,
}

impl SubscriptionAllWorker {
    /// Create an idle worker.
    #[must_use]
    pub fn new(
        store: Arc<dyn SubscribeToAll>,
        checkpoints: Arc<dyn CheckpointRepository>,
        projections: Projections,
        config: WorkerConfig,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Idle);
        Self {
            store,
            checkpoints,
            projections,
            config,
            state,
        }
    }

    /// The worker's configuration.
    #[must_use]
    pub const fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Spawn the worker on the tokio runtime.
    #[must_use]
    pub fn start(self) -> WorkerHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let state = self.state.subscribe();
        let task = tokio::spawn(async move { self.run(shutdown_rx).await });
        WorkerHandle {
            shutdown,
            state,
            task,
        }
    }

    /// Run until `shutdown` turns `true` (or its sender is dropped) or an
    /// unrecoverable error occurs.
    ///
    /// # Errors
    ///
    /// Returns the [`WorkerError`] that stopped the worker; the state is then
    /// `Failed`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        let subscription_id = self.config.subscription_id.as_str();
        tracing::info!(
            subscription_id,
            projections = ?self.projections.names(),
            prefixes = ?self.config.filter.stream_prefixes(),
            "Starting subscription worker"
        );

        let result = self.run_until_stopped(&mut shutdown).await;
        SubscriptionMetrics::record_live(subscription_id, false);
        match &result {
            Ok(()) => {
                self.set_state(WorkerState::Stopped);
                tracing::info!(subscription_id, "Subscription worker stopped");
            }
            Err(error) => {
                self.set_state(WorkerState::Failed);
                tracing::error!(subscription_id, %error, "Subscription worker failed");
            }
        }
        result
    }

    fn set_state(&self, state: WorkerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(
                subscription_id = %self.config.subscription_id,
                from = %previous,
                to = %state,
                "Worker state changed"
            );
        }
    }

    async fn run_until_stopped(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), WorkerError> {
        let subscription_id = self.config.subscription_id.as_str();
        let mut reconnects = 0;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            self.set_state(WorkerState::Starting);

            let checkpoint = self
                .checkpoints
                .load(subscription_id)
                .await?
                .map(|checkpoint| checkpoint.position);
            match checkpoint {
                Some(position) => {
                    tracing::info!(subscription_id, %position, "Resuming after checkpoint");
                }
                None => tracing::info!(subscription_id, "Starting from the beginning of the log"),
            }

            let opened = self
                .store
                .subscribe_to_all(self.config.filter.clone(), checkpoint)
                .await;
            let mut subscription = match opened {
                Ok(subscription) => subscription,
                Err(error) => {
                    if self.wait_before_reconnect(&mut reconnects, error, shutdown).await? {
                        return Ok(());
                    }
                    continue;
                }
            };
            self.set_state(WorkerState::CatchingUp);

            let mut last_processed = checkpoint;
            let dropped = loop {
                tokio::select! {
                    biased;

                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::info!(subscription_id, "Shutdown signal received");
                            return Ok(());
                        }
                    }

                    message = subscription.next() => match message {
                        Some(Ok(SubscriptionMessage::Event(event))) => {
                            self.process(&event, &mut last_processed).await?;
                            reconnects = 0;
                        }
                        Some(Ok(SubscriptionMessage::CaughtUp)) => {
                            tracing::info!(subscription_id, "Caught up, now live");
                            self.set_state(WorkerState::Live);
                            SubscriptionMetrics::record_live(subscription_id, true);
                            reconnects = 0;
                        }
                        Some(Err(error)) => break error,
                        None => break EventStoreError::Transport("subscription ended".to_string()),
                    }
                }
            };

            SubscriptionMetrics::record_live(subscription_id, false);
            if self.wait_before_reconnect(&mut reconnects, dropped, shutdown).await? {
                return Ok(());
            }
        }
    }

    /// Back off before resubscribing. Returns `true` if shutdown was
    /// requested while waiting.
    async fn wait_before_reconnect(
        &self,
        attempt: &mut usize,
        error: EventStoreError,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<bool, WorkerError> {
        let subscription_id = self.config.subscription_id.as_str();
        if !error.is_transient() {
            return Err(WorkerError::Subscription(error));
        }
        if self.config.reconnect.is_exhausted(*attempt) {
            return Err(WorkerError::ReconnectExhausted {
                attempts: *attempt,
                source: error,
            });
        }

        let delay = self.config.reconnect.delay_for_attempt(*attempt);
        *attempt += 1;
        SubscriptionMetrics::record_reconnect(subscription_id);
        tracing::warn!(
            subscription_id,
            attempt = *attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            %error,
            "Subscription dropped, reconnecting from checkpoint"
        );

        tokio::select! {
            () = tokio::time::sleep(delay) => Ok(false),
            changed = shutdown.changed() => Ok(changed.is_err() || *shutdown.borrow()),
        }
    }

    #[tracing::instrument(
        skip_all,
        fields(
            subscription_id = %self.config.subscription_id,
            position = %event.global_position,
            event_type = %event.event_type
        )
    )]
    async fn process(
        &self,
        event: &RecordedEvent,
        last_processed: &mut Option<GlobalPosition>,
    ) -> Result<(), WorkerError> {
        let subscription_id = self.config.subscription_id.as_str();
        if last_processed.is_some_and(|last| event.global_position <= last) {
            SubscriptionMetrics::record_duplicate(subscription_id);
            tracing::debug!("Skipping re-delivered event");
            return Ok(());
        }

        for projection in self.projections.matching(&event.event_type) {
            self.dispatch(projection.as_ref(), event).await?;
        }

        retry_with_predicate(
            &self.config.projection_retry,
            "store_checkpoint",
            || self.checkpoints.store(subscription_id, event.global_position),
            |error| matches!(error, CheckpointError::Storage(_)),
        )
        .await?;

        *last_processed = Some(event.global_position);
        SubscriptionMetrics::record_processed(subscription_id, event.global_position.value());
        tracing::debug!("Event processed, checkpoint stored");
        Ok(())
    }

    async fn dispatch(&self, projection: &dyn Projection, event: &RecordedEvent) -> Result<(), WorkerError> {
        let started = Instant::now();
        let result = retry_with_backoff(
            &self.config.projection_retry,
            "projection_handle",
            || projection.handle(event),
        )
        .await;

        match result {
            Ok(()) => {
                SubscriptionMetrics::record_handle(projection.name(), started.elapsed());
                Ok(())
            }
            Err(source) => {
                SubscriptionMetrics::record_projection_failure(
                    &self.config.subscription_id,
                    projection.name(),
                );
                tracing::error!(
                    projection = projection.name(),
                    error = %source,
                    "Projection failed, stopping before the checkpoint moves past this event"
                );
                Err(WorkerError::Projection {
                    projection: projection.name().to_string(),
                    position: event.global_position,
                    source,
                })
            }
        }
    }
}

impl fmt::Debug for SubscriptionAllWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionAllWorker")
            .field("config", &self.config)
            .field("projections", &self.projections)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Handle to a worker spawned with [`SubscriptionAllWorker::start`].
///
/// Dropping the handle stops the worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<WorkerState>,
    task: JoinHandle<Result<(), WorkerError>>,
}

impl WorkerHandle {
    /// Current state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Wait until the worker reaches `target` or finishes, and return the
    /// state it is in.
    pub async fn wait_for(&mut self, target: WorkerState) -> WorkerState {
        let reached = self
            .state
            .wait_for(|state| *state == target || state.is_terminal())
            .await
            .map(|state| *state);
        reached.unwrap_or_else(|_| *self.state.borrow())
    }

    /// Whether the worker task has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Ask the worker to stop after the in-flight event and wait for it.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the worker if it had already failed.
    pub async fn stop(self) -> Result<(), WorkerError> {
        // The worker may already be gone.
        let _ = self.shutdown.send(true);
        self.join().await
    }

    /// Wait for the worker to finish on its own.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the worker.
    pub async fn join(self) -> Result<(), WorkerError> {
        let Self { shutdown, task, .. } = self;
        let result = task
            .await
            .map_err(|e| WorkerError::Task(e.to_string()))?;
        drop(shutdown);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(WorkerState::Stopped.is_terminal());
        assert!(WorkerState::Failed.is_terminal());
        assert!(!WorkerState::Live.is_terminal());
        assert!(!WorkerState::Idle.is_terminal());
    }

    #[test]
    fn state_display() {
        assert_eq!(WorkerState::CatchingUp.to_string(), "catching_up");
        assert_eq!(WorkerState::Live.to_string(), "live");
    }

    #[test]
    fn config_builder() {
        let config = WorkerConfig::new("orders")
            .with_filter_prefixes(["order-"])
            .with_projection_retry(RetryPolicy::no_retry());

        assert_eq!(config.subscription_id(), "orders");
        assert_eq!(config.filter().stream_prefixes(), ["order-".to_string()]);
        assert_eq!(config.projection_retry.max_retries, 0);
        assert_eq!(config.reconnect.max_retries, 10);
    }

    #[test]
    fn projection_error_names_projection_and_position() {
        let error = WorkerError::Projection {
            projection: "order_read_model".to_string(),
            position: GlobalPosition::new(12),
            source: ProjectionError::Storage("connection reset".to_string()),
        };
        let message = error.to_string();
        assert!(message.contains("order_read_model"));
        assert!(message.contains("12"));
    }
}
