//! `PostgreSQL` event store implementation for Eventline.
//!
//! This crate provides a PostgreSQL-based event log that implements the
//! `EventStore` and `SubscribeToAll` traits from `eventline-core`:
//!
//! - One row per stream (`streams`) holding its version, truncation point and
//!   soft-delete flag
//! - A single global log (`events`) with dense, commit-ordered global positions
//! - Atomic compare-and-append under a transaction-scoped advisory lock
//! - A polling subscribe-to-all that catches up in batches, then tails the log
//!
//! # Example
//!
//! ```ignore
//! use eventline_postgres::PostgresEventStore;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let event_store = PostgresEventStore::new("postgres://localhost/mydb").await?;
//!     event_store.migrate().await?;
//!     Ok(())
//! }
//! ```

mod event_store;
mod subscription;

pub use event_store::PostgresEventStore;
