//! In-memory event bus that records published integration events.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on a poisoned lock

use eventline_core::event::SerializedEvent;
use eventline_core::event_bus::{EventBus, EventBusError};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// Event bus double: every publish is appended to an in-memory list.
///
/// # Example
///
/// ```
/// use eventline_core::event::SerializedEvent;
/// use eventline_core::event_bus::EventBus;
/// use eventline_testing::InMemoryEventBus;
///
/// # tokio_test::block_on(async {
/// let bus = InMemoryEventBus::new();
/// let event = SerializedEvent::new("OrderPaid.v1".to_string(), vec![], None);
/// bus.publish("orders.integration", &event).await.unwrap();
/// assert_eq!(bus.published_to("orders.integration").len(), 1);
/// # });
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryEventBus {
    published: Arc<RwLock<Vec<(String, SerializedEvent)>>>,
    failing_publishes: Arc<AtomicUsize>,
}

impl InMemoryEventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `(topic, event)` published so far, in order.
    #[must_use]
    pub fn published(&self) -> Vec<(String, SerializedEvent)> {
        self.published.read().unwrap().clone()
    }

    /// Events published to `topic`, in order.
    #[must_use]
    pub fn published_to(&self, topic: &str) -> Vec<SerializedEvent> {
        self.published
            .read()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// Fail the next `count` publishes.
    pub fn fail_next_publishes(&self, count: usize) {
        self.failing_publishes.store(count, Ordering::SeqCst);
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let event = event.clone();
        Box::pin(async move {
            let injected = self
                .failing_publishes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if injected {
                return Err(EventBusError::PublishFailed {
                    topic,
                    reason: "injected publish failure".to_string(),
                });
            }
            self.published.write().unwrap().push((topic, event));
            Ok(())
        })
    }
}
