//! Event bus used by the demo binary.

use eventline_core::event::SerializedEvent;
use eventline_core::event_bus::{EventBus, EventBusError};
use std::future::Future;
use std::pin::Pin;

/// Writes every published integration event to the log.
///
/// Stands in for a broker when running the demo locally.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingEventBus;

impl EventBus for TracingEventBus {
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        tracing::info!(
            topic,
            event_id = %event.event_id,
            event_type = %event.event_type,
            bytes = event.data.len(),
            "Integration event"
        );
        Box::pin(async { Ok(()) })
    }
}
