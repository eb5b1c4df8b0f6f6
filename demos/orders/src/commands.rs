//! Order commands and their handler.
//!
//! Each command loads the order, runs the business method and stores the new
//! events with the loaded version as expectation. When another writer got
//! there first the handler reloads and runs the command again, up to
//! `max_conflict_retries` times; business rules are re-checked against the
//! fresh state on every attempt.

use crate::order::{Order, OrderError};
use crate::types::{CustomerId, DeliveryAddress, Money, OrderId, ShopItem};
use chrono::{DateTime, Utc};
use eventline_core::aggregate::Aggregate;
use eventline_core::aggregate_store::{AggregateStore, AggregateStoreError};
use eventline_core::environment::{Clock, SystemClock};
use eventline_core::event::CommandMetadata;
use std::sync::Arc;
use thiserror::Error;

/// Open an order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateOrder {
    /// Order identifier
    pub order_id: OrderId,
    /// Customer placing the order
    pub customer_id: CustomerId,
    /// Initial cart
    pub shop_items: Vec<ShopItem>,
    /// Delivery address
    pub delivery_address: DeliveryAddress,
}

/// Replace the cart of a pending order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateShoppingCart {
    /// Order identifier
    pub order_id: OrderId,
    /// New cart
    pub shop_items: Vec<ShopItem>,
}

/// Pay the order total.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PayOrder {
    /// Order identifier
    pub order_id: OrderId,
    /// Amount paid
    pub amount: Money,
}

/// Hand a paid order to fulfilment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmitOrder {
    /// Order identifier
    pub order_id: OrderId,
}

/// Change the delivery address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeDeliveryAddress {
    /// Order identifier
    pub order_id: OrderId,
    /// New address
    pub delivery_address: DeliveryAddress,
}

/// Cancel an order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CancelOrder {
    /// Order identifier
    pub order_id: OrderId,
    /// Why
    pub reason: String,
}

/// Mark a submitted order as delivered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompleteOrder {
    /// Order identifier
    pub order_id: OrderId,
}

/// Every order command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OrderCommand {
    /// See [`CreateOrder`]
    Create(CreateOrder),
    /// See [`UpdateShoppingCart`]
    UpdateShoppingCart(UpdateShoppingCart),
    /// See [`PayOrder`]
    Pay(PayOrder),
    /// See [`SubmitOrder`]
    Submit(SubmitOrder),
    /// See [`ChangeDeliveryAddress`]
    ChangeDeliveryAddress(ChangeDeliveryAddress),
    /// See [`CancelOrder`]
    Cancel(CancelOrder),
    /// See [`CompleteOrder`]
    Complete(CompleteOrder),
}

impl OrderCommand {
    /// The order the command targets.
    #[must_use]
    pub const fn order_id(&self) -> &OrderId {
        match self {
            Self::Create(c) => &c.order_id,
            Self::UpdateShoppingCart(c) => &c.order_id,
            Self::Pay(c) => &c.order_id,
            Self::Submit(c) => &c.order_id,
            Self::ChangeDeliveryAddress(c) => &c.order_id,
            Self::Cancel(c) => &c.order_id,
            Self::Complete(c) => &c.order_id,
        }
    }

    /// Command name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Create(_) => "create_order",
            Self::UpdateShoppingCart(_) => "update_shopping_cart",
            Self::Pay(_) => "pay_order",
            Self::Submit(_) => "submit_order",
            Self::ChangeDeliveryAddress(_) => "change_delivery_address",
            Self::Cancel(_) => "cancel_order",
            Self::Complete(_) => "complete_order",
        }
    }

    fn apply(&self, order: &mut Order, now: DateTime<Utc>) -> Result<(), OrderError> {
        match self {
            Self::Create(c) => order.create(
                c.customer_id.clone(),
                c.shop_items.clone(),
                c.delivery_address.clone(),
            ),
            Self::UpdateShoppingCart(c) => order.update_shopping_cart(c.shop_items.clone()),
            Self::Pay(c) => order.pay(c.amount, now),
            Self::Submit(_) => order.submit(now),
            Self::ChangeDeliveryAddress(c) => order.change_delivery_address(c.delivery_address.clone()),
            Self::Cancel(c) => order.cancel(c.reason.clone()),
            Self::Complete(_) => order.complete(now),
        }
    }
}

/// Errors returned by [`OrderCommandHandler`].
#[derive(Error, Debug)]
pub enum OrderCommandError {
    /// A business rule rejected the command.
    #[error(transparent)]
    Rejected(#[from] OrderError),

    /// The order does not exist.
    #[error("Order {0} not found")]
    NotFound(OrderId),

    /// Every attempt lost the race against another writer.
    #[error("Order {order_id} kept changing concurrently ({attempts} attempts)")]
    ConflictRetriesExhausted {
        /// Order identifier
        order_id: OrderId,
        /// Attempts made
        attempts: usize,
    },

    /// Loading or storing failed.
    #[error(transparent)]
    Store(#[from] AggregateStoreError),
}

/// Runs [`OrderCommand`]s against an [`AggregateStore`].
pub struct OrderCommandHandler {
    orders: AggregateStore<Order>,
    clock: Arc<dyn Clock>,
    max_conflict_retries: usize,
}

impl OrderCommandHandler {
    /// Create a handler retrying conflicts three times.
    #[must_use]
    pub fn new(orders: AggregateStore<Order>) -> Self {
        Self {
            orders,
            clock: Arc::new(SystemClock),
            max_conflict_retries: 3,
        }
    }

    /// Use `clock` for business timestamps (`paid_at`, ...).
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Reload-and-retry budget on concurrency conflicts.
    #[must_use]
    pub const fn with_max_conflict_retries(mut self, retries: usize) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    /// The underlying aggregate store.
    #[must_use]
    pub const fn orders(&self) -> &AggregateStore<Order> {
        &self.orders
    }

    /// Run `command` and return the order as stored.
    ///
    /// # Errors
    ///
    /// - [`OrderCommandError::Rejected`] if a business rule fails
    /// - [`OrderCommandError::NotFound`] for commands on missing orders
    /// - [`OrderCommandError::ConflictRetriesExhausted`] if every attempt conflicted
    /// - [`OrderCommandError::Store`] for storage failures
    #[tracing::instrument(skip_all, fields(command = command.name(), order_id = %command.order_id()))]
    pub async fn handle(
        &self,
        command: &OrderCommand,
        metadata: &CommandMetadata,
    ) -> Result<Order, OrderCommandError> {
        let order_id = command.order_id();
        let mut attempt = 0;

        loop {
            let mut order = match command {
                OrderCommand::Create(_) => self.orders.load_or_new(order_id).await?,
                _ => self.orders.load(order_id).await.map_err(|error| match error {
                    AggregateStoreError::NotFound(_) => OrderCommandError::NotFound(order_id.clone()),
                    other => OrderCommandError::Store(other),
                })?,
            };

            command.apply(&mut order, self.clock.now())?;

            match self.orders.store(&mut order, metadata).await {
                Ok(_) => {
                    tracing::info!(version = %order.version(), "Command handled");
                    return Ok(order);
                }
                Err(error) if error.is_concurrency_conflict() => {
                    if attempt >= self.max_conflict_retries {
                        return Err(OrderCommandError::ConflictRetriesExhausted {
                            order_id: order_id.clone(),
                            attempts: attempt + 1,
                        });
                    }
                    attempt += 1;
                    tracing::debug!(attempt, %error, "Concurrent write, reloading order");
                }
                Err(error) => return Err(error.into()),
            }
        }
    }
}

impl std::fmt::Debug for OrderCommandHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderCommandHandler")
            .field("max_conflict_retries", &self.max_conflict_retries)
            .finish_non_exhaustive()
    }
}
