//! Durable subscription checkpoints.
//!
//! A checkpoint is the global position of the last event a subscription has
//! fully processed. Workers load it on start and resume *after* it; they store
//! it only once every projection has handled the event, so a crash between
//! the two replays at most that event (at-least-once delivery).
//!
//! Checkpoints only move forward. [`CheckpointRepository::store`] refuses a
//! position lower than the stored one; [`CheckpointRepository::reset`] is the
//! explicit way back, used to rebuild read models from the start of the log.
//!
//! # Implementations
//!
//! - `PostgresCheckpointRepository` (in `eventline-projections`)
//! - `InMemoryCheckpointRepository` (in `eventline-testing`)

use crate::stream::GlobalPosition;
use crate::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors from checkpoint storage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckpointError {
    /// The backing storage failed.
    #[error("Checkpoint storage error: {0}")]
    Storage(String),

    /// A store attempted to move the checkpoint backwards.
    #[error("Checkpoint for {subscription_id} cannot move back from {current} to {attempted}")]
    Regression {
        /// Subscription whose checkpoint was being stored.
        subscription_id: String,
        /// Stored position.
        current: GlobalPosition,
        /// Rejected position.
        attempted: GlobalPosition,
    },
}

/// A stored checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Subscription the checkpoint belongs to.
    pub subscription_id: String,
    /// Global position of the last fully processed event.
    pub position: GlobalPosition,
    /// When the checkpoint was last stored.
    pub updated_at: DateTime<Utc>,
}

/// Persistence for subscription checkpoints.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `impl Future`
/// to enable trait object usage (`Arc<dyn CheckpointRepository>`), which is
/// how workers receive it.
pub trait CheckpointRepository: Send + Sync {
    /// Load the checkpoint of a subscription.
    ///
    /// Returns `None` for a subscription that never stored one (start from
    /// the beginning of the log).
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Storage`] if the load fails.
    fn load(
        &self,
        subscription_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Checkpoint>, CheckpointError>> + Send + '_>>;

    /// Durably store a checkpoint.
    ///
    /// Storing the current position again is a no-op.
    ///
    /// # Errors
    ///
    /// - [`CheckpointError::Regression`] if `position` is below the stored one
    /// - [`CheckpointError::Storage`] if the write fails
    fn store(
        &self,
        subscription_id: &str,
        position: GlobalPosition,
    ) -> Pin<Box<dyn Future<Output = Result<(), CheckpointError>> + Send + '_>>;

    /// Remove a subscription's checkpoint so it restarts from the beginning.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Storage`] if the delete fails.
    fn reset(
        &self,
        subscription_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), CheckpointError>> + Send + '_>>;
}

/// Check that storing `attempted` would not move `current` backwards.
///
/// # Errors
///
/// Returns [`CheckpointError::Regression`] when `attempted < current`.
pub fn ensure_forward(
    subscription_id: &str,
    current: Option<GlobalPosition>,
    attempted: GlobalPosition,
) -> Result<(), CheckpointError> {
    match current {
        Some(current) if attempted < current => Err(CheckpointError::Regression {
            subscription_id: subscription_id.to_string(),
            current,
            attempted,
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_and_equal_positions_are_accepted() {
        assert!(ensure_forward("orders", None, GlobalPosition::new(3)).is_ok());
        assert!(ensure_forward("orders", Some(GlobalPosition::new(3)), GlobalPosition::new(3)).is_ok());
        assert!(ensure_forward("orders", Some(GlobalPosition::new(3)), GlobalPosition::new(4)).is_ok());
    }

    #[test]
    fn regression_is_rejected() {
        let result = ensure_forward("orders", Some(GlobalPosition::new(5)), GlobalPosition::new(2));
        assert_eq!(
            result,
            Err(CheckpointError::Regression {
                subscription_id: "orders".to_string(),
                current: GlobalPosition::new(5),
                attempted: GlobalPosition::new(2),
            })
        );
    }
}
