//! Polling subscribe-to-all.
//!
//! The subscription reads the global log in batches of `batch_size` events
//! after its cursor. The first batch shorter than `batch_size` means the
//! subscription has caught up; it yields `CaughtUp` once and from then on
//! polls every `poll_interval`. Writers commit in global-position order, so a
//! poll never skips an event that commits later with a lower position.

use crate::event_store::{EVENT_COLUMNS, PostgresEventStore, recorded_from_row, to_db, transport};
use eventline_core::event::RecordedEvent;
use eventline_core::event_store::EventStoreError;
use eventline_core::stream::GlobalPosition;
use eventline_core::subscription::{
    SubscribeToAll, SubscriptionFilter, SubscriptionMessage, SubscriptionStream,
};
use futures::StreamExt;
use sqlx::PgPool;
use std::future::Future;
use std::pin::Pin;

/// Turn stream-name prefixes into `LIKE` patterns.
fn like_patterns(filter: &SubscriptionFilter) -> Vec<String> {
    filter
        .stream_prefixes()
        .iter()
        .map(|prefix| {
            let escaped = prefix
                .replace('\\', "\\\\")
                .replace('%', "\\%")
                .replace('_', "\\_");
            format!("{escaped}%")
        })
        .collect()
}

async fn fetch_after(
    pool: &PgPool,
    after: i64,
    patterns: &[String],
    batch_size: u32,
) -> Result<Vec<RecordedEvent>, EventStoreError> {
    let sql = format!(
        "SELECT {EVENT_COLUMNS} FROM events
         WHERE global_position > $1
           AND (cardinality($2::text[]) = 0 OR stream_name LIKE ANY($2))
         ORDER BY global_position ASC
         LIMIT $3"
    );
    let rows = sqlx::query(&sql)
        .bind(after)
        .bind(patterns)
        .bind(i64::from(batch_size))
        .fetch_all(pool)
        .await
        .map_err(transport)?;
    rows.iter().map(recorded_from_row).collect()
}

impl PostgresEventStore {
    async fn open_subscription(
        &self,
        filter: SubscriptionFilter,
        after: Option<GlobalPosition>,
    ) -> Result<SubscriptionStream, EventStoreError> {
        sqlx::query("SELECT 1")
            .execute(self.pool())
            .await
            .map_err(transport)?;

        let pool = self.pool().clone();
        let poll_interval = self.poll_interval;
        let batch_size = self.batch_size;
        let patterns = like_patterns(&filter);
        let mut cursor = to_db(after.map_or(0, GlobalPosition::value))?;

        tracing::debug!(
            prefixes = ?filter.stream_prefixes(),
            after = cursor,
            "Opening subscription to all streams"
        );

        let stream = async_stream::stream! {
            let mut caught_up = false;
            loop {
                let batch = match fetch_after(&pool, cursor, &patterns, batch_size).await {
                    Ok(batch) => batch,
                    Err(error) => {
                        yield Err(error);
                        break;
                    }
                };
                let exhausted = batch.len() < usize::try_from(batch_size).unwrap_or(usize::MAX);

                for event in batch {
                    match to_db(event.global_position.value()) {
                        Ok(position) => cursor = position,
                        Err(error) => {
                            yield Err(error);
                            return;
                        }
                    }
                    yield Ok(SubscriptionMessage::Event(event));
                }

                if exhausted {
                    if !caught_up {
                        caught_up = true;
                        yield Ok(SubscriptionMessage::CaughtUp);
                    }
                    tokio::time::sleep(poll_interval).await;
                }
            }
        };

        Ok(stream.boxed())
    }
}

impl SubscribeToAll for PostgresEventStore {
    fn subscribe_to_all(
        &self,
        filter: SubscriptionFilter,
        after: Option<GlobalPosition>,
    ) -> Pin<Box<dyn Future<Output = Result<SubscriptionStream, EventStoreError>> + Send + '_>> {
        Box::pin(self.open_subscription(filter, after))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_has_no_patterns() {
        assert!(like_patterns(&SubscriptionFilter::all()).is_empty());
    }

    #[test]
    fn like_wildcards_in_prefixes_are_escaped() {
        let filter = SubscriptionFilter::with_prefixes(["order-", "odd_%"]);
        assert_eq!(like_patterns(&filter), ["order-%", "odd\\_\\%%"]);
    }
}
