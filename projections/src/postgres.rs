//! `PostgreSQL` storage for the read side.
//!
//! # Overview
//!
//! - [`PostgresCheckpointRepository`]: one row per subscription in
//!   `subscription_checkpoints`, moved forward with a guarded upsert
//! - [`PostgresProjectionStore`]: key/value documents in `projection_data`
//!   (or any table with the same shape)
//!
//! Both can live in the event store's database or in a separate one:
//!
//! ```text
//! Write Side (Event Store)          Read Side (Projections)
//! ┌─────────────────────┐          ┌──────────────────────────┐
//! │  PostgreSQL DB #1   │          │  PostgreSQL DB #2        │
//! │                     │          │                          │
//! │  streams            │   →→→    │  subscription_checkpoints│
//! │  events             │  Worker  │  projection_data         │
//! └─────────────────────┘          └──────────────────────────┘
//! ```
//!
//! Keeping both tables in one database does not make a projection write and
//! its checkpoint atomic: the worker stores the checkpoint after the
//! projections, so projections must tolerate re-delivery.
//!
//! # Example
//!
//! ```ignore
//! let checkpoints = PostgresCheckpointRepository::new_with_separate_db(
//!     "postgres://localhost/projections",
//! ).await?;
//! checkpoints.migrate().await?;
//!
//! let documents = PostgresProjectionStore::new(
//!     checkpoints.pool().clone(),
//!     "projection_data".to_string(),
//! );
//! ```

use chrono::{DateTime, Utc};
use eventline_core::checkpoint::{Checkpoint, CheckpointError, CheckpointRepository};
use eventline_core::projection::{ProjectionError, ProjectionStore, Result};
use eventline_core::stream::GlobalPosition;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::future::Future;
use std::pin::Pin;

/// Apply the read-side migrations. The event store may share the database
/// and its `_sqlx_migrations` table, so versions applied by other migrators
/// are tolerated.
async fn run_migrations(pool: &PgPool) -> std::result::Result<(), sqlx::migrate::MigrateError> {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator.run(pool).await
}

fn storage(context: &str, error: &sqlx::Error) -> CheckpointError {
    CheckpointError::Storage(format!("{context}: {error}"))
}

fn position_to_db(position: GlobalPosition) -> std::result::Result<i64, CheckpointError> {
    i64::try_from(position.value()).map_err(|_| {
        CheckpointError::Storage(format!("global position {position} exceeds BIGINT range"))
    })
}

fn position_from_db(value: i64) -> std::result::Result<GlobalPosition, CheckpointError> {
    u64::try_from(value)
        .map(GlobalPosition::new)
        .map_err(|_| CheckpointError::Storage(format!("negative checkpoint position {value}")))
}

/// `PostgreSQL`-backed checkpoints.
///
/// # Schema
///
/// ```sql
/// CREATE TABLE subscription_checkpoints (
///     subscription_id TEXT PRIMARY KEY,
///     position BIGINT NOT NULL,
///     updated_at TIMESTAMPTZ NOT NULL
/// );
/// ```
///
/// A store only takes effect when the new position is not below the stored
/// one; the regression check and the write happen in a single statement.
#[derive(Clone, Debug)]
pub struct PostgresCheckpointRepository {
    pool: PgPool,
}

impl PostgresCheckpointRepository {
    /// Create a repository using an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a repository with its own connection pool.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Storage`] if the connection fails.
    pub async fn new_with_separate_db(database_url: &str) -> std::result::Result<Self, CheckpointError> {
        let pool = PgPoolOptions::new()
            .max_connections(5) // Checkpoints are low-volume
            .connect(database_url)
            .await
            .map_err(|e| storage("Failed to connect", &e))?;

        Ok(Self::new(pool))
    }

    /// Create the read-side tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Storage`] if a migration fails.
    pub async fn migrate(&self) -> std::result::Result<(), CheckpointError> {
        run_migrations(&self.pool)
            .await
            .map_err(|e| CheckpointError::Storage(format!("Migration failed: {e}")))
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_checkpoint(
        &self,
        subscription_id: String,
    ) -> std::result::Result<Option<Checkpoint>, CheckpointError> {
        let row: Option<(i64, DateTime<Utc>)> = sqlx::query_as(
            "SELECT position, updated_at
             FROM subscription_checkpoints
             WHERE subscription_id = $1",
        )
        .bind(&subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage("Failed to load checkpoint", &e))?;

        row.map(|(position, updated_at)| {
            Ok(Checkpoint {
                subscription_id,
                position: position_from_db(position)?,
                updated_at,
            })
        })
        .transpose()
    }

    async fn store_checkpoint(
        &self,
        subscription_id: String,
        position: GlobalPosition,
    ) -> std::result::Result<(), CheckpointError> {
        let value = position_to_db(position)?;

        let stored: Option<(i64,)> = sqlx::query_as(
            "INSERT INTO subscription_checkpoints (subscription_id, position, updated_at)
             VALUES ($1, $2, now())
             ON CONFLICT (subscription_id) DO UPDATE
             SET position = EXCLUDED.position, updated_at = now()
             WHERE subscription_checkpoints.position <= EXCLUDED.position
             RETURNING position",
        )
        .bind(&subscription_id)
        .bind(value)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage("Failed to store checkpoint", &e))?;

        if stored.is_some() {
            tracing::trace!(subscription_id = %subscription_id, %position, "Checkpoint stored");
            return Ok(());
        }

        // The guard rejected the update; report what is stored.
        let (current,): (i64,) = sqlx::query_as(
            "SELECT position FROM subscription_checkpoints WHERE subscription_id = $1",
        )
        .bind(&subscription_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| storage("Failed to read checkpoint", &e))?;

        Err(CheckpointError::Regression {
            subscription_id,
            current: position_from_db(current)?,
            attempted: position,
        })
    }

    async fn reset_checkpoint(&self, subscription_id: String) -> std::result::Result<(), CheckpointError> {
        let result = sqlx::query("DELETE FROM subscription_checkpoints WHERE subscription_id = $1")
            .bind(&subscription_id)
            .execute(&self.pool)
            .await
            .map_err(|e| storage("Failed to reset checkpoint", &e))?;

        tracing::info!(
            subscription_id = %subscription_id,
            existed = result.rows_affected() > 0,
            "Checkpoint reset"
        );
        Ok(())
    }
}

impl CheckpointRepository for PostgresCheckpointRepository {
    fn load(
        &self,
        subscription_id: &str,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<Option<Checkpoint>, CheckpointError>> + Send + '_>>
    {
        Box::pin(self.load_checkpoint(subscription_id.to_string()))
    }

    fn store(
        &self,
        subscription_id: &str,
        position: GlobalPosition,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<(), CheckpointError>> + Send + '_>> {
        Box::pin(self.store_checkpoint(subscription_id.to_string(), position))
    }

    fn reset(
        &self,
        subscription_id: &str,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<(), CheckpointError>> + Send + '_>> {
        Box::pin(self.reset_checkpoint(subscription_id.to_string()))
    }
}

/// `PostgreSQL`-backed projection documents.
///
/// The table needs `key TEXT PRIMARY KEY`, `data BYTEA` and
/// `updated_at TIMESTAMPTZ`; the migration creates `projection_data`.
/// Queryable read models with their own columns and indexes should use their
/// own tables through [`PostgresProjectionStore::pool`].
#[derive(Clone, Debug)]
pub struct PostgresProjectionStore {
    pool: PgPool,
    table_name: String,
}

impl PostgresProjectionStore {
    /// Create a store on `table_name` using an existing connection pool.
    ///
    /// `table_name` is interpolated into SQL and must come from trusted
    /// configuration.
    #[must_use]
    pub const fn new(pool: PgPool, table_name: String) -> Self {
        Self { pool, table_name }
    }

    /// Create a store with its own connection pool.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the connection fails.
    pub async fn new_with_separate_db(database_url: &str, table_name: String) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to connect: {e}")))?;

        Ok(Self::new(pool, table_name))
    }

    /// Create the read-side tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        run_migrations(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Migration failed: {e}")))
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The table documents are stored in.
    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table_name
    }
}

impl ProjectionStore for PostgresProjectionStore {
    async fn save(&self, key: &str, data: &[u8]) -> Result<()> {
        let query = format!(
            "INSERT INTO {} (key, data, updated_at)
             VALUES ($1, $2, now())
             ON CONFLICT (key) DO UPDATE
             SET data = EXCLUDED.data, updated_at = now()",
            self.table_name
        );

        sqlx::query(&query)
            .bind(key)
            .bind(data)
            .execute(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to save '{key}': {e}")))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let query = format!("SELECT data FROM {} WHERE key = $1", self.table_name);

        let row: Option<(Vec<u8>,)> = sqlx::query_as(&query)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to get '{key}': {e}")))?;
        Ok(row.map(|(data,)| data))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let query = format!("DELETE FROM {} WHERE key = $1", self.table_name);

        sqlx::query(&query)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to delete '{key}': {e}")))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let query = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE key = $1)",
            self.table_name
        );

        let (exists,): (bool,) = sqlx::query_as(&query)
            .bind(key)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to check '{key}': {e}")))?;
        Ok(exists)
    }
}
