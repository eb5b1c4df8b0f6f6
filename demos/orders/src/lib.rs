//! Order domain demo for Eventline.
//!
//! # What This Shows
//!
//! 1. **Aggregate**: [`Order`] validates commands and records events
//! 2. **Command handling**: [`OrderCommandHandler`] loads, decides, stores and
//!    reloads-and-retries on concurrency conflicts
//! 3. **Read model**: [`OrderReadModelProjection`] keeps one idempotent view
//!    per order
//! 4. **Integration events**: [`OrderIntegrationProjection`] republishes
//!    committed events on a bus
//!
//! ```text
//! command ─► OrderCommandHandler ─► AggregateStore ─► event log
//!                                                         │
//!                              SubscriptionAllWorker ◄────┘
//!                                 │             │
//!                    OrderReadModelProjection  OrderIntegrationProjection
//! ```

pub mod bus;
pub mod commands;
pub mod config;
pub mod order;
pub mod projections;
pub mod types;

pub use bus::TracingEventBus;
pub use commands::{
    CancelOrder, ChangeDeliveryAddress, CompleteOrder, CreateOrder, OrderCommand, OrderCommandError,
    OrderCommandHandler, PayOrder, SubmitOrder, UpdateShoppingCart,
};
pub use config::{Config, ConfigError};
pub use order::{ORDER_STREAM_PREFIX, Order, OrderError, OrderEvent, order_event_registry, order_serializer};
pub use projections::{
    INTEGRATION_TOPIC, OrderIntegrationProjection, OrderReadModelProjection, OrderView, order_view_key,
};
pub use types::{CustomerId, DeliveryAddress, Money, OrderId, OrderStatus, ShopItem, total_price};
