//! [`EventStore`] over two tables: `streams` and the global `events` log.
//!
//! Appends, truncations and deletions run in one transaction that first takes
//! a transaction-scoped advisory lock shared by every writer. Writers are
//! therefore serialized: global positions are assigned as `MAX + 1` and
//! become visible strictly in order, so a reader polling the log can never
//! observe position `n + 1` before position `n`.

use eventline_core::event::{RecordedEvent, SerializedEvent};
use eventline_core::event_store::{
    AppendEventsResult, EventStore, EventStoreError, ReadDirection, ReadFrom, ReadRequest,
};
use eventline_core::stream::{ExpectedVersion, GlobalPosition, StreamName, StreamPosition, Version};
use eventline_runtime::metrics::EventStoreMetrics;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

/// Advisory lock key taken by every writer ("evtline" in ASCII).
const WRITE_LOCK_KEY: i64 = 0x0065_7674_6c69_6e65;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const DEFAULT_BATCH_SIZE: u32 = 512;

pub(crate) const EVENT_COLUMNS: &str = "global_position, stream_name, stream_position, event_id, \
                                        event_type, data, metadata, recorded_at";

pub(crate) fn transport(error: sqlx::Error) -> EventStoreError {
    EventStoreError::Transport(error.to_string())
}

pub(crate) fn to_db(value: u64) -> Result<i64, EventStoreError> {
    i64::try_from(value)
        .map_err(|_| EventStoreError::Serialization(format!("position {value} exceeds BIGINT")))
}

fn from_db(value: i64) -> Result<u64, EventStoreError> {
    u64::try_from(value)
        .map_err(|_| EventStoreError::Serialization(format!("negative position {value} in database")))
}

pub(crate) fn recorded_from_row(row: &PgRow) -> Result<RecordedEvent, EventStoreError> {
    let column = |e: sqlx::Error| EventStoreError::Serialization(e.to_string());
    Ok(RecordedEvent {
        global_position: GlobalPosition::new(from_db(row.try_get("global_position").map_err(column)?)?),
        stream_name: StreamName::new(row.try_get::<String, _>("stream_name").map_err(column)?),
        stream_position: StreamPosition::new(from_db(row.try_get("stream_position").map_err(column)?)?),
        event_id: row.try_get("event_id").map_err(column)?,
        event_type: row.try_get("event_type").map_err(column)?,
        data: row.try_get("data").map_err(column)?,
        metadata: row.try_get("metadata").map_err(column)?,
        recorded_at: row.try_get("recorded_at").map_err(column)?,
    })
}

/// Stream row as seen by a writer.
struct StreamRow {
    version: Version,
    truncate_before: StreamPosition,
    deleted: bool,
}

impl StreamRow {
    /// Version as reported to expected-version checks (`None` = no stream).
    fn current(&self) -> Option<Version> {
        (!self.deleted).then_some(self.version)
    }
}

/// PostgreSQL-backed event store.
///
/// # Delete semantics
///
/// [`delete_stream`](EventStore::delete_stream) is a soft delete: the stream
/// row is flagged, reads report `StreamNotFound` and the events stay in the
/// global log. Appending to a deleted stream with `NoStream` or `Any`
/// recreates it; numbering continues and the old events stay hidden.
///
/// # Example
///
/// ```ignore
/// let store = PostgresEventStore::from_pool(pool)
///     .with_poll_interval(Duration::from_millis(100))
///     .with_batch_size(1_000);
/// store.migrate().await?;
/// ```
#[derive(Clone, Debug)]
pub struct PostgresEventStore {
    pool: PgPool,
    pub(crate) poll_interval: Duration,
    pub(crate) batch_size: u32,
}

impl PostgresEventStore {
    /// Connect to `database_url` with a default pool.
    ///
    /// # Errors
    ///
    /// Returns `EventStoreError::Transport` if the connection fails.
    pub async fn new(database_url: &str) -> Result<Self, EventStoreError> {
        Self::connect(database_url, 10).await
    }

    /// Connect to `database_url` with at most `max_connections` connections.
    ///
    /// # Errors
    ///
    /// Returns `EventStoreError::Transport` if the connection fails.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, EventStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(transport)?;
        Ok(Self::from_pool(pool))
    }

    /// Use an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            poll_interval: DEFAULT_POLL_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// How long a caught-up subscription waits between polls.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// How many events a subscription fetches per query.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = if batch_size == 0 { 1 } else { batch_size };
        self
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `streams` and `events` tables if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns `EventStoreError::Transport` if a migration fails.
    pub async fn migrate(&self) -> Result<(), EventStoreError> {
        // The read side may keep its own migrations in the same database.
        let mut migrator = sqlx::migrate!("./migrations");
        migrator.set_ignore_missing(true);
        migrator
            .run(&self.pool)
            .await
            .map_err(|e| EventStoreError::Transport(format!("Migration failed: {e}")))?;
        Ok(())
    }

    async fn begin_write(&self) -> Result<Transaction<'static, Postgres>, EventStoreError> {
        let mut tx = self.pool.begin().await.map_err(transport)?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(WRITE_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(transport)?;
        Ok(tx)
    }

    async fn stream_row(
        tx: &mut Transaction<'static, Postgres>,
        stream_name: &StreamName,
    ) -> Result<Option<StreamRow>, EventStoreError> {
        let row: Option<(i64, i64, bool)> = sqlx::query_as(
            "SELECT version, truncate_before, deleted FROM streams WHERE stream_name = $1",
        )
        .bind(stream_name.as_str())
        .fetch_optional(&mut **tx)
        .await
        .map_err(transport)?;

        row.map(|(version, truncate_before, deleted)| {
            Ok(StreamRow {
                version: Version::new(from_db(version)?),
                truncate_before: StreamPosition::new(from_db(truncate_before)?),
                deleted,
            })
        })
        .transpose()
    }

    #[tracing::instrument(skip_all, fields(stream = %stream_name, expected = %expected_version, count = events.len()))]
    async fn append(
        &self,
        stream_name: StreamName,
        expected_version: ExpectedVersion,
        events: Vec<SerializedEvent>,
    ) -> Result<AppendEventsResult, EventStoreError> {
        if events.is_empty() {
            return Err(EventStoreError::EmptyAppend(stream_name));
        }
        let started = Instant::now();
        let count = events.len();

        let mut tx = self.begin_write().await?;
        let existing = Self::stream_row(&mut tx, &stream_name).await?;
        let current = existing.as_ref().and_then(StreamRow::current);
        if !expected_version.matches(current) {
            tracing::debug!(actual = ?current, "Expected version mismatch");
            return Err(EventStoreError::ConcurrencyConflict {
                stream_name,
                expected: expected_version,
                actual: current,
            });
        }

        let (start_version, truncate_before) = match existing {
            None => {
                sqlx::query("INSERT INTO streams (stream_name, version) VALUES ($1, 0)")
                    .bind(stream_name.as_str())
                    .execute(&mut *tx)
                    .await
                    .map_err(transport)?;
                (Version::INITIAL, StreamPosition::START)
            }
            // Recreating a deleted stream hides everything written before.
            Some(row) if row.deleted => (row.version, row.version.next_position()),
            Some(row) => (row.version, row.truncate_before),
        };

        let (last_global,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(global_position), 0) FROM events")
                .fetch_one(&mut *tx)
                .await
                .map_err(transport)?;
        let first_global = from_db(last_global)? + 1;

        let mut rows = Vec::with_capacity(count);
        let mut version = start_version;
        let mut global = first_global;
        for event in events {
            rows.push((to_db(global)?, to_db(version.value())?, event));
            version = version.next();
            global += 1;
        }
        let last_global = global - 1;

        let mut insert = QueryBuilder::<Postgres>::new(
            "INSERT INTO events (global_position, stream_name, stream_position, event_id, event_type, data, metadata) ",
        );
        insert.push_values(rows, |mut b, (global_position, stream_position, event)| {
            b.push_bind(global_position)
                .push_bind(stream_name.as_str().to_string())
                .push_bind(stream_position)
                .push_bind(event.event_id)
                .push_bind(event.event_type)
                .push_bind(event.data)
                .push_bind(event.metadata);
        });
        insert.build().execute(&mut *tx).await.map_err(transport)?;

        sqlx::query(
            "UPDATE streams
             SET version = $2, truncate_before = $3, deleted = FALSE, updated_at = now()
             WHERE stream_name = $1",
        )
        .bind(stream_name.as_str())
        .bind(to_db(version.value())?)
        .bind(to_db(truncate_before.value())?)
        .execute(&mut *tx)
        .await
        .map_err(transport)?;

        tx.commit().await.map_err(transport)?;

        EventStoreMetrics::record_append(count, started.elapsed());
        tracing::debug!(next_version = %version, global_position = last_global, "Events appended");
        Ok(AppendEventsResult {
            next_expected_version: version,
            global_position: GlobalPosition::new(last_global),
        })
    }

    async fn read(
        &self,
        stream_name: StreamName,
        request: ReadRequest,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        let started = Instant::now();
        let row: Option<(i64, bool)> =
            sqlx::query_as("SELECT truncate_before, deleted FROM streams WHERE stream_name = $1")
                .bind(stream_name.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(transport)?;
        let truncate_before = match row {
            Some((truncate_before, false)) => truncate_before,
            _ => return Err(EventStoreError::StreamNotFound(stream_name)),
        };

        // (lower bound, upper bound, ascending, limit); `End` forward and
        // `Start` backward select a single boundary event.
        let limit = request.max_count.map(|n| i64::try_from(n).unwrap_or(i64::MAX));
        let single = Some(limit.map_or(1, |n| n.min(1)));
        let (lower, upper, ascending, limit) = match (request.direction, request.from) {
            (ReadDirection::Forward, ReadFrom::Start) => (truncate_before, None, true, limit),
            (ReadDirection::Forward, ReadFrom::Position(p)) => {
                (truncate_before.max(to_db(p.value())?), None, true, limit)
            }
            (ReadDirection::Forward, ReadFrom::End) => (truncate_before, None, false, single),
            (ReadDirection::Backward, ReadFrom::End) => (truncate_before, None, false, limit),
            (ReadDirection::Backward, ReadFrom::Position(p)) => {
                (truncate_before, Some(to_db(p.value())?), false, limit)
            }
            (ReadDirection::Backward, ReadFrom::Start) => (truncate_before, None, true, single),
        };

        let mut query = QueryBuilder::<Postgres>::new("SELECT ");
        query
            .push(EVENT_COLUMNS)
            .push(" FROM events WHERE stream_name = ")
            .push_bind(stream_name.as_str().to_string())
            .push(" AND stream_position >= ")
            .push_bind(lower);
        if let Some(upper) = upper {
            query.push(" AND stream_position <= ").push_bind(upper);
        }
        query.push(if ascending {
            " ORDER BY stream_position ASC"
        } else {
            " ORDER BY stream_position DESC"
        });
        if let Some(limit) = limit {
            query.push(" LIMIT ").push_bind(limit);
        }

        let rows = query.build().fetch_all(&self.pool).await.map_err(transport)?;
        let events = rows
            .iter()
            .map(recorded_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        EventStoreMetrics::record_read(events.len(), started.elapsed());
        Ok(events)
    }

    async fn modify(
        &self,
        stream_name: StreamName,
        expected_version: ExpectedVersion,
        set: &'static str,
        value: Option<i64>,
    ) -> Result<(), EventStoreError> {
        let mut tx = self.begin_write().await?;
        let current = match Self::stream_row(&mut tx, &stream_name).await? {
            Some(row) if !row.deleted => row.version,
            _ => return Err(EventStoreError::StreamNotFound(stream_name)),
        };
        if !expected_version.matches(Some(current)) {
            return Err(EventStoreError::ConcurrencyConflict {
                stream_name,
                expected: expected_version,
                actual: Some(current),
            });
        }

        let sql = format!("UPDATE streams SET {set}, updated_at = now() WHERE stream_name = $1");
        let mut query = sqlx::query(&sql).bind(stream_name.as_str());
        if let Some(value) = value {
            query = query.bind(value);
        }
        query.execute(&mut *tx).await.map_err(transport)?;
        tx.commit().await.map_err(transport)?;
        Ok(())
    }
}

impl EventStore for PostgresEventStore {
    fn stream_exists(
        &self,
        stream_name: StreamName,
    ) -> Pin<Box<dyn Future<Output = Result<bool, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            let (exists,): (bool,) = sqlx::query_as(
                "SELECT EXISTS(SELECT 1 FROM streams WHERE stream_name = $1 AND NOT deleted)",
            )
            .bind(stream_name.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(transport)?;
            Ok(exists)
        })
    }

    fn read_stream(
        &self,
        stream_name: StreamName,
        request: ReadRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RecordedEvent>, EventStoreError>> + Send + '_>> {
        Box::pin(self.read(stream_name, request))
    }

    fn append_events(
        &self,
        stream_name: StreamName,
        expected_version: ExpectedVersion,
        events: Vec<SerializedEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<AppendEventsResult, EventStoreError>> + Send + '_>> {
        Box::pin(self.append(stream_name, expected_version, events))
    }

    fn truncate_stream(
        &self,
        stream_name: StreamName,
        before: StreamPosition,
        expected_version: ExpectedVersion,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            let before = to_db(before.value())?;
            self.modify(
                stream_name,
                expected_version,
                "truncate_before = GREATEST(truncate_before, $2)",
                Some(before),
            )
            .await
        })
    }

    fn delete_stream(
        &self,
        stream_name: StreamName,
        expected_version: ExpectedVersion,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send + '_>> {
        Box::pin(self.modify(stream_name, expected_version, "deleted = TRUE", None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_convert_both_ways() {
        assert_eq!(to_db(42), Ok(42));
        assert!(to_db(u64::MAX).is_err());
        assert_eq!(from_db(7), Ok(7));
        assert!(from_db(-1).is_err());
    }

    #[test]
    fn deleted_stream_has_no_current_version() {
        let row = StreamRow {
            version: Version::new(3),
            truncate_before: StreamPosition::START,
            deleted: true,
        };
        assert_eq!(row.current(), None);
        let live = StreamRow { deleted: false, ..row };
        assert_eq!(live.current(), Some(Version::new(3)));
    }

    #[tokio::test]
    async fn zero_batch_size_is_clamped() {
        let options = sqlx::postgres::PgConnectOptions::new();
        let pool = PgPoolOptions::new().connect_lazy_with(options);
        let store = PostgresEventStore::from_pool(pool).with_batch_size(0);
        assert_eq!(store.batch_size, 1);
    }
}
