//! Read side of the order domain.
//!
//! - [`OrderReadModelProjection`]: one JSON document per order, queryable by id
//! - [`OrderIntegrationProjection`]: republishes order events on the bus

use crate::order::{ORDER_STREAM_PREFIX, OrderEvent};
use crate::types::{CustomerId, DeliveryAddress, Money, OrderId, OrderStatus, ShopItem};
use chrono::{DateTime, Utc};
use eventline_core::event::{RecordedEvent, SerializedEvent};
use eventline_core::event_bus::EventBus;
use eventline_core::projection::{Projection, ProjectionError, ProjectionStore, Result};
use eventline_core::serializer::Serializer;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Topic integration events are published to.
pub const INTEGRATION_TOPIC: &str = "orders.integration";

/// Denormalized view of an order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderView {
    /// Order identifier
    pub order_id: OrderId,
    /// Customer who placed the order
    pub customer_id: CustomerId,
    /// Current cart
    pub shop_items: Vec<ShopItem>,
    /// `Σ price * quantity`
    pub total_price: Money,
    /// Current status
    pub status: OrderStatus,
    /// Current delivery address
    pub delivery_address: DeliveryAddress,
    /// When the order was paid
    pub paid_at: Option<DateTime<Utc>>,
    /// Why the order was canceled
    pub cancel_reason: Option<String>,
    /// Global position of the last event folded into this view
    pub last_global_position: u64,
    /// When the last event was recorded
    pub updated_at: DateTime<Utc>,
}

/// Key of an order's document.
#[must_use]
pub fn order_view_key(order_id: &OrderId) -> String {
    format!("order:{order_id}")
}

fn order_id_of(event: &RecordedEvent) -> Result<OrderId> {
    event
        .stream_name
        .as_str()
        .strip_prefix(ORDER_STREAM_PREFIX)
        .map(OrderId::new)
        .ok_or_else(|| {
            ProjectionError::EventProcessing(format!("{} is not an order stream", event.stream_name))
        })
}

/// Keeps an [`OrderView`] per order in a [`ProjectionStore`].
///
/// Each view remembers the global position of the last event it applied;
/// re-delivered events at or below it are ignored.
pub struct OrderReadModelProjection<S> {
    store: Arc<S>,
    serializer: Serializer<OrderEvent>,
}

impl<S: ProjectionStore> OrderReadModelProjection<S> {
    /// Create the projection over `store`.
    #[must_use]
    pub const fn new(store: Arc<S>, serializer: Serializer<OrderEvent>) -> Self {
        Self { store, serializer }
    }

    /// Query: the view of one order.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the read fails, or
    /// [`ProjectionError::Serialization`] for a corrupt document.
    pub async fn get_order(&self, order_id: &OrderId) -> Result<Option<OrderView>> {
        self.load(&order_view_key(order_id)).await
    }

    async fn load(&self, key: &str) -> Result<Option<OrderView>> {
        self.store
            .get(key)
            .await?
            .map(|bytes| {
                serde_json::from_slice(&bytes).map_err(|e| {
                    ProjectionError::Serialization(format!("corrupt order view '{key}': {e}"))
                })
            })
            .transpose()
    }

    async fn apply(&self, recorded: &RecordedEvent) -> Result<()> {
        let order_id = order_id_of(recorded)?;
        let key = order_view_key(&order_id);
        let position = recorded.global_position.value();
        let event = self.serializer.deserialize(recorded)?;

        let current = self.load(&key).await?;
        if current.as_ref().is_some_and(|view| view.last_global_position >= position) {
            tracing::debug!(%order_id, position, "Order view already up to date");
            return Ok(());
        }

        let view = match (current, event) {
            // A later creation means the stream was deleted and recreated;
            // its history starts over.
            (_, OrderEvent::Created(e)) => OrderView {
                order_id: e.order_id,
                customer_id: e.customer_id,
                shop_items: e.shop_items,
                total_price: e.total_price,
                status: OrderStatus::Pending,
                delivery_address: e.delivery_address,
                paid_at: None,
                cancel_reason: None,
                last_global_position: position,
                updated_at: recorded.recorded_at,
            },
            (Some(mut view), event) => {
                match event {
                    OrderEvent::Created(_) => {}
                    OrderEvent::ShoppingCartUpdated(e) => {
                        view.shop_items = e.shop_items;
                        view.total_price = e.total_price;
                    }
                    OrderEvent::Paid(e) => {
                        view.paid_at = Some(e.paid_at);
                        view.status = OrderStatus::Paid;
                    }
                    OrderEvent::Submitted(_) => view.status = OrderStatus::Submitted,
                    OrderEvent::DeliveryAddressChanged(e) => view.delivery_address = e.delivery_address,
                    OrderEvent::Canceled(e) => {
                        view.cancel_reason = Some(e.reason);
                        view.status = OrderStatus::Canceled;
                    }
                    OrderEvent::Completed(_) => view.status = OrderStatus::Completed,
                }
                view.last_global_position = position;
                view.updated_at = recorded.recorded_at;
                view
            }
            (None, _) => {
                return Err(ProjectionError::EventProcessing(format!(
                    "{} at {} for unknown order {order_id}",
                    recorded.event_type, recorded.global_position
                )));
            }
        };

        let bytes = serde_json::to_vec(&view)
            .map_err(|e| ProjectionError::Serialization(format!("order view '{key}': {e}")))?;
        self.store.save(&key, &bytes).await?;
        tracing::debug!(%order_id, position, status = %view.status, "Order view updated");
        Ok(())
    }
}

impl<S: ProjectionStore + 'static> Projection for OrderReadModelProjection<S> {
    fn name(&self) -> &str {
        "order_read_model"
    }

    fn handles(&self, event_type: &str) -> bool {
        OrderEvent::ALL_TYPES.contains(&event_type)
    }

    fn handle<'a>(
        &'a self,
        event: &'a RecordedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.apply(event))
    }
}

/// Republishes committed order events as integration events.
///
/// The published envelope keeps the event id so consumers can drop the
/// duplicates at-least-once delivery produces.
pub struct OrderIntegrationProjection {
    bus: Arc<dyn EventBus>,
}

impl OrderIntegrationProjection {
    /// Publish to `bus` on [`INTEGRATION_TOPIC`].
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self { bus }
    }
}

impl Projection for OrderIntegrationProjection {
    fn name(&self) -> &str {
        "order_integration"
    }

    fn handles(&self, event_type: &str) -> bool {
        OrderEvent::ALL_TYPES.contains(&event_type)
    }

    fn handle<'a>(
        &'a self,
        event: &'a RecordedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let envelope = SerializedEvent::new(
                event.event_type.clone(),
                event.data.clone(),
                event.metadata.clone(),
            )
            .with_event_id(event.event_id);

            self.bus
                .publish(INTEGRATION_TOPIC, &envelope)
                .await
                .map_err(|e| ProjectionError::Publish(e.to_string()))?;

            tracing::debug!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                topic = INTEGRATION_TOPIC,
                "Integration event published"
            );
            Ok(())
        })
    }
}
