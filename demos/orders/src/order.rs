//! The `Order` aggregate.
//!
//! Orders progress `Pending → Paid → Submitted → Completed`; any order that
//! is not completed can be canceled. The shopping cart can only change while
//! the order is pending, the delivery address until it is closed.

use crate::types::{CustomerId, DeliveryAddress, Money, OrderId, OrderStatus, ShopItem, total_price};
use chrono::{DateTime, Utc};
use eventline_core::aggregate::{Aggregate, AggregateBase};
use eventline_core::event::{Event, EventError, encode_payload};
use eventline_core::serializer::{EventTypeRegistry, Serializer};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Prefix of every order stream name.
pub const ORDER_STREAM_PREFIX: &str = "order-";

/// An order was opened with an initial cart.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreated {
    /// Order identifier
    pub order_id: OrderId,
    /// Customer placing the order
    pub customer_id: CustomerId,
    /// Initial cart
    pub shop_items: Vec<ShopItem>,
    /// `Σ price * quantity` of the cart
    pub total_price: Money,
    /// Requested delivery address
    pub delivery_address: DeliveryAddress,
}

/// The cart was replaced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShoppingCartUpdated {
    /// New cart
    pub shop_items: Vec<ShopItem>,
    /// `Σ price * quantity` of the new cart
    pub total_price: Money,
}

/// Payment was received.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPaid {
    /// Amount paid
    pub amount: Money,
    /// When the payment was made
    pub paid_at: DateTime<Utc>,
}

/// The order was handed to fulfilment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSubmitted {
    /// When it was submitted
    pub submitted_at: DateTime<Utc>,
}

/// The delivery address changed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAddressChanged {
    /// New address
    pub delivery_address: DeliveryAddress,
}

/// The order was canceled.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCanceled {
    /// Why
    pub reason: String,
}

/// The order was delivered.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCompleted {
    /// When it was completed
    pub completed_at: DateTime<Utc>,
}

/// Every event of an order stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OrderEvent {
    /// See [`OrderCreated`]
    Created(OrderCreated),
    /// See [`ShoppingCartUpdated`]
    ShoppingCartUpdated(ShoppingCartUpdated),
    /// See [`OrderPaid`]
    Paid(OrderPaid),
    /// See [`OrderSubmitted`]
    Submitted(OrderSubmitted),
    /// See [`DeliveryAddressChanged`]
    DeliveryAddressChanged(DeliveryAddressChanged),
    /// See [`OrderCanceled`]
    Canceled(OrderCanceled),
    /// See [`OrderCompleted`]
    Completed(OrderCompleted),
}

impl OrderEvent {
    /// Type name of `OrderCreated`.
    pub const CREATED: &'static str = "OrderCreated.v1";
    /// Type name of `ShoppingCartUpdated`.
    pub const SHOPPING_CART_UPDATED: &'static str = "ShoppingCartUpdated.v1";
    /// Type name of `OrderPaid`.
    pub const PAID: &'static str = "OrderPaid.v1";
    /// Type name of `OrderSubmitted`.
    pub const SUBMITTED: &'static str = "OrderSubmitted.v1";
    /// Type name of `DeliveryAddressChanged`.
    pub const DELIVERY_ADDRESS_CHANGED: &'static str = "DeliveryAddressChanged.v1";
    /// Type name of `OrderCanceled`.
    pub const CANCELED: &'static str = "OrderCanceled.v1";
    /// Type name of `OrderCompleted`.
    pub const COMPLETED: &'static str = "OrderCompleted.v1";

    /// Every order event type name.
    pub const ALL_TYPES: [&'static str; 7] = [
        Self::CREATED,
        Self::SHOPPING_CART_UPDATED,
        Self::PAID,
        Self::SUBMITTED,
        Self::DELIVERY_ADDRESS_CHANGED,
        Self::CANCELED,
        Self::COMPLETED,
    ];
}

impl Event for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Created(_) => Self::CREATED,
            Self::ShoppingCartUpdated(_) => Self::SHOPPING_CART_UPDATED,
            Self::Paid(_) => Self::PAID,
            Self::Submitted(_) => Self::SUBMITTED,
            Self::DeliveryAddressChanged(_) => Self::DELIVERY_ADDRESS_CHANGED,
            Self::Canceled(_) => Self::CANCELED,
            Self::Completed(_) => Self::COMPLETED,
        }
    }

    fn to_payload(&self) -> Result<Vec<u8>, EventError> {
        match self {
            Self::Created(e) => encode_payload(e),
            Self::ShoppingCartUpdated(e) => encode_payload(e),
            Self::Paid(e) => encode_payload(e),
            Self::Submitted(e) => encode_payload(e),
            Self::DeliveryAddressChanged(e) => encode_payload(e),
            Self::Canceled(e) => encode_payload(e),
            Self::Completed(e) => encode_payload(e),
        }
    }
}

/// Registry of every order event type.
///
/// # Errors
///
/// Returns `EventError::DuplicateEventType` if two variants share a name.
pub fn order_event_registry() -> Result<EventTypeRegistry<OrderEvent>, EventError> {
    EventTypeRegistry::new()
        .with(OrderEvent::CREATED, OrderEvent::Created)?
        .with(OrderEvent::SHOPPING_CART_UPDATED, OrderEvent::ShoppingCartUpdated)?
        .with(OrderEvent::PAID, OrderEvent::Paid)?
        .with(OrderEvent::SUBMITTED, OrderEvent::Submitted)?
        .with(OrderEvent::DELIVERY_ADDRESS_CHANGED, OrderEvent::DeliveryAddressChanged)?
        .with(OrderEvent::CANCELED, OrderEvent::Canceled)?
        .with(OrderEvent::COMPLETED, OrderEvent::Completed)
}

/// Serializer over [`order_event_registry`].
///
/// # Errors
///
/// Same as [`order_event_registry`].
pub fn order_serializer() -> Result<Serializer<OrderEvent>, EventError> {
    Ok(Serializer::new(Arc::new(order_event_registry()?)))
}

/// Business rule violations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrderError {
    /// `CreateOrder` on an existing order.
    #[error("Order {0} already exists")]
    AlreadyCreated(OrderId),

    /// Any other command on an order that was never created.
    #[error("Order has not been created")]
    NotCreated,

    /// The cart of a new order or a cart update is empty.
    #[error("Shopping cart is empty")]
    EmptyCart,

    /// A cart line has no units.
    #[error("Item {0} has zero quantity")]
    ZeroQuantity(String),

    /// A cart line has a negative unit price.
    #[error("Item {0} has a negative price")]
    NegativePrice(String),

    /// The cart total does not fit in the money representation.
    #[error("Cart total is too large")]
    TotalOverflow,

    /// The order was already paid.
    #[error("Order {0} is already paid")]
    AlreadyPaid(OrderId),

    /// The payment does not match the order total.
    #[error("Payment of {paid} does not match total {total}")]
    PaymentMismatch {
        /// Order total
        total: Money,
        /// Amount offered
        paid: Money,
    },

    /// Submitting an order that was not paid.
    #[error("Order {0} has not been paid")]
    NotPaid(OrderId),

    /// Completing an order that was not submitted.
    #[error("Order {0} has not been submitted")]
    NotSubmitted(OrderId),

    /// The command is not allowed in the current status.
    #[error("Cannot {action} order {order_id} while it is {status}")]
    InvalidStatus {
        /// Order identifier
        order_id: OrderId,
        /// Current status
        status: OrderStatus,
        /// What was attempted
        action: &'static str,
    },
}

/// Order aggregate.
#[derive(Clone, Debug)]
pub struct Order {
    id: OrderId,
    customer_id: Option<CustomerId>,
    shop_items: Vec<ShopItem>,
    total_price: Money,
    delivery_address: Option<DeliveryAddress>,
    status: Option<OrderStatus>,
    paid_at: Option<DateTime<Utc>>,
    cancel_reason: Option<String>,
    base: AggregateBase<OrderEvent>,
}

impl Order {
    /// The customer, once created.
    #[must_use]
    pub const fn customer_id(&self) -> Option<&CustomerId> {
        self.customer_id.as_ref()
    }

    /// Current cart.
    #[must_use]
    pub fn shop_items(&self) -> &[ShopItem] {
        &self.shop_items
    }

    /// `Σ price * quantity` of the current cart.
    #[must_use]
    pub const fn total_price(&self) -> Money {
        self.total_price
    }

    /// Current delivery address.
    #[must_use]
    pub const fn delivery_address(&self) -> Option<&DeliveryAddress> {
        self.delivery_address.as_ref()
    }

    /// Current status; `None` until created.
    #[must_use]
    pub const fn status(&self) -> Option<OrderStatus> {
        self.status
    }

    /// When the order was paid.
    #[must_use]
    pub const fn paid_at(&self) -> Option<DateTime<Utc>> {
        self.paid_at
    }

    /// Why the order was canceled.
    #[must_use]
    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }

    /// Open the order.
    ///
    /// # Errors
    ///
    /// [`OrderError::AlreadyCreated`] or an invalid cart.
    pub fn create(
        &mut self,
        customer_id: CustomerId,
        shop_items: Vec<ShopItem>,
        delivery_address: DeliveryAddress,
    ) -> Result<(), OrderError> {
        if self.status.is_some() {
            return Err(OrderError::AlreadyCreated(self.id.clone()));
        }
        let total_price = validate_cart(&shop_items)?;

        self.record(OrderEvent::Created(OrderCreated {
            order_id: self.id.clone(),
            customer_id,
            total_price,
            shop_items,
            delivery_address,
        }))
    }

    /// Replace the cart.
    ///
    /// # Errors
    ///
    /// Only pending orders accept cart changes.
    pub fn update_shopping_cart(&mut self, shop_items: Vec<ShopItem>) -> Result<(), OrderError> {
        self.ensure_status(&[OrderStatus::Pending], "update the cart of")?;
        let total_price = validate_cart(&shop_items)?;

        self.record(OrderEvent::ShoppingCartUpdated(ShoppingCartUpdated {
            total_price,
            shop_items,
        }))
    }

    /// Record the payment of the full total.
    ///
    /// # Errors
    ///
    /// [`OrderError::AlreadyPaid`], a closed order, or an amount different
    /// from the total.
    pub fn pay(&mut self, amount: Money, paid_at: DateTime<Utc>) -> Result<(), OrderError> {
        let status = self.current_status()?;
        if self.paid_at.is_some() {
            return Err(OrderError::AlreadyPaid(self.id.clone()));
        }
        if status != OrderStatus::Pending {
            return Err(self.invalid(status, "pay"));
        }
        if amount != self.total_price {
            return Err(OrderError::PaymentMismatch {
                total: self.total_price,
                paid: amount,
            });
        }

        self.record(OrderEvent::Paid(OrderPaid { amount, paid_at }))
    }

    /// Hand a paid order to fulfilment.
    ///
    /// # Errors
    ///
    /// [`OrderError::NotPaid`] for pending orders.
    pub fn submit(&mut self, submitted_at: DateTime<Utc>) -> Result<(), OrderError> {
        match self.current_status()? {
            OrderStatus::Pending => Err(OrderError::NotPaid(self.id.clone())),
            OrderStatus::Paid => self.record(OrderEvent::Submitted(OrderSubmitted { submitted_at })),
            status => Err(self.invalid(status, "submit")),
        }
    }

    /// Change where the order is shipped.
    ///
    /// # Errors
    ///
    /// Closed orders cannot change.
    pub fn change_delivery_address(&mut self, delivery_address: DeliveryAddress) -> Result<(), OrderError> {
        self.ensure_status(
            &[OrderStatus::Pending, OrderStatus::Paid, OrderStatus::Submitted],
            "change the delivery address of",
        )?;

        self.record(OrderEvent::DeliveryAddressChanged(DeliveryAddressChanged {
            delivery_address,
        }))
    }

    /// Cancel the order.
    ///
    /// # Errors
    ///
    /// Closed orders cannot be canceled.
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), OrderError> {
        self.ensure_status(
            &[OrderStatus::Pending, OrderStatus::Paid, OrderStatus::Submitted],
            "cancel",
        )?;

        self.record(OrderEvent::Canceled(OrderCanceled {
            reason: reason.into(),
        }))
    }

    /// Mark a submitted order as delivered.
    ///
    /// # Errors
    ///
    /// [`OrderError::NotSubmitted`] unless the order is submitted.
    pub fn complete(&mut self, completed_at: DateTime<Utc>) -> Result<(), OrderError> {
        match self.current_status()? {
            OrderStatus::Submitted => self.record(OrderEvent::Completed(OrderCompleted { completed_at })),
            OrderStatus::Pending | OrderStatus::Paid => Err(OrderError::NotSubmitted(self.id.clone())),
            status => Err(self.invalid(status, "complete")),
        }
    }

    const fn current_status(&self) -> Result<OrderStatus, OrderError> {
        match self.status {
            Some(status) => Ok(status),
            None => Err(OrderError::NotCreated),
        }
    }

    fn ensure_status(&self, allowed: &[OrderStatus], action: &'static str) -> Result<(), OrderError> {
        let status = self.current_status()?;
        if allowed.contains(&status) {
            Ok(())
        } else {
            Err(self.invalid(status, action))
        }
    }

    fn invalid(&self, status: OrderStatus, action: &'static str) -> OrderError {
        OrderError::InvalidStatus {
            order_id: self.id.clone(),
            status,
            action,
        }
    }
}

/// Check the cart and return its total.
fn validate_cart(shop_items: &[ShopItem]) -> Result<Money, OrderError> {
    if shop_items.is_empty() {
        return Err(OrderError::EmptyCart);
    }
    for item in shop_items {
        if item.quantity == 0 {
            return Err(OrderError::ZeroQuantity(item.product_id.clone()));
        }
        if item.price < Money::ZERO {
            return Err(OrderError::NegativePrice(item.product_id.clone()));
        }
    }
    total_price(shop_items).ok_or(OrderError::TotalOverflow)
}

impl Aggregate for Order {
    const AGGREGATE_TYPE: &'static str = "order";
    type Id = OrderId;
    type Event = OrderEvent;
    type Error = OrderError;

    fn new(id: OrderId) -> Self {
        Self {
            id,
            customer_id: None,
            shop_items: Vec::new(),
            total_price: Money::ZERO,
            delivery_address: None,
            status: None,
            paid_at: None,
            cancel_reason: None,
            base: AggregateBase::new(),
        }
    }

    fn id(&self) -> &OrderId {
        &self.id
    }

    fn base(&self) -> &AggregateBase<OrderEvent> {
        &self.base
    }

    fn base_mut(&mut self) -> &mut AggregateBase<OrderEvent> {
        &mut self.base
    }

    fn when(&mut self, event: &OrderEvent) -> Result<(), OrderError> {
        if let OrderEvent::Created(e) = event {
            if self.status.is_some() {
                return Err(OrderError::AlreadyCreated(self.id.clone()));
            }
            self.customer_id = Some(e.customer_id.clone());
            self.shop_items.clone_from(&e.shop_items);
            self.total_price = e.total_price;
            self.delivery_address = Some(e.delivery_address.clone());
            self.status = Some(OrderStatus::Pending);
            return Ok(());
        }

        self.current_status()?;
        match event {
            OrderEvent::Created(_) => {}
            OrderEvent::ShoppingCartUpdated(e) => {
                self.shop_items.clone_from(&e.shop_items);
                self.total_price = e.total_price;
            }
            OrderEvent::Paid(e) => {
                self.paid_at = Some(e.paid_at);
                self.status = Some(OrderStatus::Paid);
            }
            OrderEvent::Submitted(_) => self.status = Some(OrderStatus::Submitted),
            OrderEvent::DeliveryAddressChanged(e) => {
                self.delivery_address = Some(e.delivery_address.clone());
            }
            OrderEvent::Canceled(e) => {
                self.cancel_reason = Some(e.reason.clone());
                self.status = Some(OrderStatus::Canceled);
            }
            OrderEvent::Completed(_) => self.status = Some(OrderStatus::Completed),
        }
        Ok(())
    }
}
