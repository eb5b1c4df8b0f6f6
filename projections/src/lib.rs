//! Read-side runtime for Eventline.
//!
//! # Overview
//!
//! - [`SubscriptionAllWorker`]: catch-up-then-live subscription over the whole
//!   log that feeds a set of projections and checkpoints its progress
//! - [`PostgresCheckpointRepository`]: durable, monotonic checkpoints
//! - [`PostgresProjectionStore`]: key/value read models
//!
//! # CQRS Separation
//!
//! The read side may use a different database than the event store:
//!
//! ```text
//! Event Store DB (Write)  →  SubscriptionAllWorker  →  Projection DB (Read)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use eventline_projections::{PostgresCheckpointRepository, SubscriptionAllWorker, WorkerConfig};
//!
//! let checkpoints = PostgresCheckpointRepository::new_with_separate_db(url).await?;
//! checkpoints.migrate().await?;
//!
//! let worker = SubscriptionAllWorker::new(
//!     Arc::new(event_store),
//!     Arc::new(checkpoints),
//!     projections,
//!     WorkerConfig::new("orders-read-model"),
//! );
//! let handle = worker.start();
//! ```

pub mod postgres;
pub mod worker;

pub use postgres::{PostgresCheckpointRepository, PostgresProjectionStore};
pub use worker::{SubscriptionAllWorker, WorkerConfig, WorkerError, WorkerHandle, WorkerState};
