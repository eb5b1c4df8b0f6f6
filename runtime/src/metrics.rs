//! Prometheus metrics for observability and monitoring.
//!
//! This module describes every metric the workspace emits and exposes them
//! over HTTP for Prometheus scraping:
//! - Aggregate loads, stores and conflicts
//! - Event store appends and reads
//! - Subscription worker progress, failures and reconnects
//! - Retries
//!
//! # Example
//!
//! ```rust,no_run
//! use eventline_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other crates
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Installs the global recorder and serves `/metrics` on `addr`.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the recorder and spawn the HTTP listener.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built (for example when the
    /// address cannot be bound) or the recorder cannot be installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., in tests), this logs a
    /// warning and leaves [`handle`](Self::handle) empty.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        if let Err(e) = metrics::set_global_recorder(recorder) {
            tracing::warn!(error = %e, "Metrics recorder already initialized, skipping re-initialization");
            return Ok(());
        }

        tokio::spawn(async move {
            // The exporter error type has no Debug or Display impl.
            if exporter.await.is_err() {
                tracing::error!("Metrics exporter stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(addr = %self.addr, "Metrics server started - available at http://{}/metrics", self.addr);
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Aggregate store
    describe_counter!("eventline_aggregate_loads_total", "Aggregates rebuilt from their stream");
    describe_counter!("eventline_aggregate_stores_total", "Successful aggregate stores");
    describe_counter!(
        "eventline_aggregate_conflicts_total",
        "Aggregate stores rejected by an expected-version mismatch"
    );

    // Event store
    describe_counter!(
        "eventline_event_store_events_appended_total",
        "Total number of events appended to the event store"
    );
    describe_counter!(
        "eventline_event_store_events_read_total",
        "Total number of events read from the event store"
    );
    describe_histogram!(
        "eventline_event_store_append_duration_seconds",
        "Time taken to append events"
    );
    describe_histogram!(
        "eventline_event_store_read_duration_seconds",
        "Time taken to read a stream"
    );

    // Subscription workers
    describe_counter!(
        "eventline_subscription_events_processed_total",
        "Events fully processed by a subscription worker"
    );
    describe_counter!(
        "eventline_subscription_duplicates_skipped_total",
        "Re-delivered events skipped because they were at or below the checkpoint"
    );
    describe_counter!(
        "eventline_subscription_projection_failures_total",
        "Projection failures that stopped a worker"
    );
    describe_counter!(
        "eventline_subscription_reconnects_total",
        "Subscription reconnect attempts"
    );
    describe_gauge!(
        "eventline_subscription_checkpoint",
        "Last stored checkpoint of a subscription"
    );
    describe_gauge!("eventline_subscription_live", "1 when a subscription has caught up");
    describe_histogram!(
        "eventline_projection_handle_duration_seconds",
        "Time taken by a projection to handle one event"
    );

    // Retries
    describe_counter!("eventline_retry_attempts_total", "Total number of retry attempts");
    describe_counter!("eventline_retry_successes_total", "Operations that succeeded after retrying");
    describe_counter!(
        "eventline_retry_exhausted_total",
        "Operations that failed after exhausting their retries"
    );
}

fn as_count(count: usize) -> u64 {
    u64::try_from(count).unwrap_or(u64::MAX)
}

/// Event store metrics recorder.
pub struct EventStoreMetrics;

impl EventStoreMetrics {
    /// Record an append of `count` events.
    pub fn record_append(count: usize, duration: Duration) {
        counter!("eventline_event_store_events_appended_total").increment(as_count(count));
        histogram!("eventline_event_store_append_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a read returning `count` events.
    pub fn record_read(count: usize, duration: Duration) {
        counter!("eventline_event_store_events_read_total").increment(as_count(count));
        histogram!("eventline_event_store_read_duration_seconds").record(duration.as_secs_f64());
    }
}

/// Subscription worker metrics recorder.
pub struct SubscriptionMetrics;

impl SubscriptionMetrics {
    /// Record a fully processed event and the checkpoint stored after it.
    #[allow(clippy::cast_precision_loss)] // gauge values are f64
    pub fn record_processed(subscription_id: &str, checkpoint: u64) {
        counter!("eventline_subscription_events_processed_total", "subscription" => subscription_id.to_string())
            .increment(1);
        gauge!("eventline_subscription_checkpoint", "subscription" => subscription_id.to_string())
            .set(checkpoint as f64);
    }

    /// Record a re-delivered event that was skipped.
    pub fn record_duplicate(subscription_id: &str) {
        counter!("eventline_subscription_duplicates_skipped_total", "subscription" => subscription_id.to_string())
            .increment(1);
    }

    /// Record a projection failure that stopped the worker.
    pub fn record_projection_failure(subscription_id: &str, projection: &str) {
        counter!(
            "eventline_subscription_projection_failures_total",
            "subscription" => subscription_id.to_string(),
            "projection" => projection.to_string()
        )
        .increment(1);
    }

    /// Record a reconnect attempt.
    pub fn record_reconnect(subscription_id: &str) {
        counter!("eventline_subscription_reconnects_total", "subscription" => subscription_id.to_string())
            .increment(1);
    }

    /// Record whether the subscription is live.
    pub fn record_live(subscription_id: &str, live: bool) {
        gauge!("eventline_subscription_live", "subscription" => subscription_id.to_string())
            .set(if live { 1.0 } else { 0.0 });
    }

    /// Record how long one projection took for one event.
    pub fn record_handle(projection: &str, duration: Duration) {
        histogram!("eventline_projection_handle_duration_seconds", "projection" => projection.to_string())
            .record(duration.as_secs_f64());
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt(operation: &'static str) {
        counter!("eventline_retry_attempts_total", "operation" => operation).increment(1);
    }

    /// Record a successful retry.
    pub fn record_success(operation: &'static str) {
        counter!("eventline_retry_successes_total", "operation" => operation).increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted(operation: &'static str) {
        counter!("eventline_retry_exhausted_total", "operation" => operation).increment(1);
    }
}
