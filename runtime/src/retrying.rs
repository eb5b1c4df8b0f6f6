//! Event store decorator that retries transient read failures.
//!
//! Reads (`stream_exists`, `read_stream` and everything built on it) are
//! retried with exponential backoff while the error is transient. Writes are
//! passed through untouched: an append that timed out may still have been
//! committed, and resending it would either conflict or, with
//! `ExpectedVersion::Any`, write the batch twice. Callers decide how to
//! recover from a failed write.

use crate::retry::{RetryPolicy, retry_with_predicate};
use eventline_core::event::{RecordedEvent, SerializedEvent};
use eventline_core::event_store::{AppendEventsResult, EventStore, EventStoreError, ReadRequest};
use eventline_core::stream::{ExpectedVersion, GlobalPosition, StreamName, StreamPosition};
use eventline_core::subscription::{SubscribeToAll, SubscriptionFilter, SubscriptionStream};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Wraps an event store and retries its transient read failures.
///
/// # Example
///
/// ```ignore
/// let store: Arc<dyn EventStore> = Arc::new(RetryingEventStore::new(
///     Arc::new(PostgresEventStore::new(&database_url).await?),
///     RetryPolicy::default(),
/// ));
/// ```
pub struct RetryingEventStore<S: ?Sized> {
    inner: Arc<S>,
    policy: RetryPolicy,
}

impl<S: ?Sized> Clone for RetryingEventStore<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            policy: self.policy.clone(),
        }
    }
}

impl<S: ?Sized> RetryingEventStore<S> {
    /// Wrap `inner` with `policy`.
    #[must_use]
    pub const fn new(inner: Arc<S>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// The wrapped store.
    #[must_use]
    pub const fn inner(&self) -> &Arc<S> {
        &self.inner
    }
}

impl<S: EventStore + ?Sized> EventStore for RetryingEventStore<S> {
    fn stream_exists(
        &self,
        stream_name: StreamName,
    ) -> Pin<Box<dyn Future<Output = Result<bool, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            retry_with_predicate(
                &self.policy,
                "stream_exists",
                || self.inner.stream_exists(stream_name.clone()),
                EventStoreError::is_transient,
            )
            .await
        })
    }

    fn read_stream(
        &self,
        stream_name: StreamName,
        request: ReadRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RecordedEvent>, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            retry_with_predicate(
                &self.policy,
                "read_stream",
                || self.inner.read_stream(stream_name.clone(), request),
                EventStoreError::is_transient,
            )
            .await
        })
    }

    fn append_events(
        &self,
        stream_name: StreamName,
        expected_version: ExpectedVersion,
        events: Vec<SerializedEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<AppendEventsResult, EventStoreError>> + Send + '_>> {
        self.inner.append_events(stream_name, expected_version, events)
    }

    fn truncate_stream(
        &self,
        stream_name: StreamName,
        before: StreamPosition,
        expected_version: ExpectedVersion,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send + '_>> {
        self.inner.truncate_stream(stream_name, before, expected_version)
    }

    fn delete_stream(
        &self,
        stream_name: StreamName,
        expected_version: ExpectedVersion,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send + '_>> {
        self.inner.delete_stream(stream_name, expected_version)
    }
}

impl<S: SubscribeToAll + ?Sized> SubscribeToAll for RetryingEventStore<S> {
    fn subscribe_to_all(
        &self,
        filter: SubscriptionFilter,
        after: Option<GlobalPosition>,
    ) -> Pin<Box<dyn Future<Output = Result<SubscriptionStream, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            retry_with_predicate(
                &self.policy,
                "subscribe_to_all",
                || self.inner.subscribe_to_all(filter.clone(), after),
                EventStoreError::is_transient,
            )
            .await
        })
    }
}
