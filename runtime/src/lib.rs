//! # Eventline Runtime
//!
//! Runtime support shared by the event store backends and the subscription
//! worker.
//!
//! ## Core Components
//!
//! - **Retry**: Exponential backoff policies and retry helpers
//! - **Retrying event store**: Decorator retrying transient read failures
//! - **Metrics**: Prometheus exporter and metric recorders
//!
//! ## Example
//!
//! ```ignore
//! use eventline_runtime::{RetryPolicy, RetryingEventStore};
//!
//! let store = RetryingEventStore::new(Arc::new(postgres_store), RetryPolicy::default());
//! ```

/// Retry logic with exponential backoff
pub mod retry;

/// Event store decorator retrying transient reads
pub mod retrying;

/// Prometheus metrics for observability
pub mod metrics;

pub use metrics::{MetricsError, MetricsServer};
pub use retry::{RetryPolicy, RetryPolicyBuilder, retry_with_backoff, retry_with_predicate};
pub use retrying::RetryingEventStore;
