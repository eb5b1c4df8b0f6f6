//! Catch-up subscriptions to the global log.
//!
//! A subscription delivers every event whose global position is greater than
//! a starting checkpoint, in global order: first the historical events
//! (catch-up), then a single [`SubscriptionMessage::CaughtUp`] marker, then
//! new events as they are committed (live).
//!
//! Subscriptions do not track progress themselves. Consumers persist their
//! own checkpoint and pass it back in when they resubscribe.

use crate::event::RecordedEvent;
use crate::event_store::EventStoreError;
use crate::stream::{GlobalPosition, StreamName};
use futures::stream::BoxStream;
use std::future::Future;
use std::pin::Pin;

/// Which streams a subscription delivers.
///
/// An empty filter delivers every stream. Otherwise a stream is delivered
/// when its name starts with one of the prefixes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionFilter {
    stream_prefixes: Vec<String>,
}

impl SubscriptionFilter {
    /// Deliver every stream.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            stream_prefixes: Vec::new(),
        }
    }

    /// Deliver streams starting with any of `prefixes`.
    #[must_use]
    pub fn with_prefixes<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            stream_prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }

    /// The configured prefixes.
    #[must_use]
    pub fn stream_prefixes(&self) -> &[String] {
        &self.stream_prefixes
    }

    /// Whether events of `stream_name` pass this filter.
    #[must_use]
    pub fn matches(&self, stream_name: &StreamName) -> bool {
        self.stream_prefixes.is_empty()
            || self
                .stream_prefixes
                .iter()
                .any(|prefix| stream_name.has_prefix(prefix))
    }
}

/// One item of a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionMessage {
    /// An event, in global order.
    Event(RecordedEvent),
    /// Every event committed before the subscription started has been delivered.
    CaughtUp,
}

/// The stream returned by [`SubscribeToAll::subscribe_to_all`].
///
/// An `Err` item means the subscription broke; consumers resubscribe from
/// their checkpoint.
pub type SubscriptionStream = BoxStream<'static, Result<SubscriptionMessage, EventStoreError>>;

/// Event stores that can stream their global log.
pub trait SubscribeToAll: Send + Sync {
    /// Subscribe to every event after `after` (from the start when `None`)
    /// whose stream passes `filter`.
    ///
    /// # Errors
    ///
    /// Returns `Transport` if the subscription cannot be opened.
    fn subscribe_to_all(
        &self,
        filter: SubscriptionFilter,
        after: Option<GlobalPosition>,
    ) -> Pin<Box<dyn Future<Output = Result<SubscriptionStream, EventStoreError>> + Send + '_>>;
}
