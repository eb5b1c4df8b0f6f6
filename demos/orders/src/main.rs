//! Orders demo.
//!
//! Connects to Postgres, starts the subscription worker feeding the order
//! read model, places one order through the command handler and then keeps
//! the worker running until Ctrl-C.
//!
//! ```bash
//! docker run -d -p 5432:5432 -e POSTGRES_PASSWORD=postgres -e POSTGRES_DB=eventline postgres:16
//! cargo run -p orders
//! ```

use anyhow::{Context, Result};
use eventline_core::aggregate_store::AggregateStore;
use eventline_core::event::CommandMetadata;
use eventline_core::projection::ProjectionsBuilder;
use eventline_postgres::PostgresEventStore;
use eventline_projections::{
    PostgresCheckpointRepository, PostgresProjectionStore, SubscriptionAllWorker, WorkerConfig, WorkerState,
};
use eventline_runtime::{MetricsServer, RetryPolicy, RetryingEventStore};
use orders::{
    Config, CreateOrder, CustomerId, DeliveryAddress, Money, OrderCommand, OrderCommandHandler, OrderId,
    OrderIntegrationProjection, OrderReadModelProjection, OrderStatus, PayOrder, ShopItem, SubmitOrder,
    TracingEventBus, order_serializer,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let mut metrics = MetricsServer::new(config.metrics_addr);
    metrics.start()?;

    // Write side
    let event_store = PostgresEventStore::connect(&config.database_url, config.database_max_connections)
        .await
        .context("connecting to the event store")?;
    event_store.migrate().await?;
    let event_store = Arc::new(RetryingEventStore::new(Arc::new(event_store), RetryPolicy::default()));

    let serializer = order_serializer()?;
    let orders = OrderCommandHandler::new(AggregateStore::new(event_store.clone(), serializer.clone()));

    // Read side
    let checkpoints = PostgresCheckpointRepository::new_with_separate_db(&config.projection_database_url)
        .await
        .context("connecting to the projection database")?;
    checkpoints.migrate().await?;
    let documents = Arc::new(PostgresProjectionStore::new(
        checkpoints.pool().clone(),
        "projection_data".to_string(),
    ));
    let order_views = OrderReadModelProjection::new(documents.clone(), serializer.clone());

    let projections = ProjectionsBuilder::new()
        .add_projection(OrderReadModelProjection::new(documents, serializer))
        .add_projection(OrderIntegrationProjection::new(Arc::new(TracingEventBus)))
        .build();

    let worker = SubscriptionAllWorker::new(
        event_store,
        Arc::new(checkpoints),
        projections,
        WorkerConfig::new(config.subscription_id.clone())
            .with_filter_prefixes(config.subscription_prefixes.clone()),
    );
    let mut handle = worker.start();
    let state = handle.wait_for(WorkerState::Live).await;
    tracing::info!(%state, "Subscription worker ready");

    // Place, pay and submit one order.
    let order_id = OrderId::new(uuid::Uuid::new_v4().to_string());
    let metadata = CommandMetadata::correlated(uuid::Uuid::new_v4().to_string()).with_user_id("demo");
    let shop_items = vec![
        ShopItem::new("prod-widget", "Super Widget", Money::from_cents(2500), 2),
        ShopItem::new("prod-gadget", "Mega Gadget", Money::from_cents(5000), 1),
    ];

    let order = orders
        .handle(
            &OrderCommand::Create(CreateOrder {
                order_id: order_id.clone(),
                customer_id: CustomerId::new("customer-alice"),
                shop_items,
                delivery_address: DeliveryAddress {
                    street: "1 Main St".to_string(),
                    city: "Springfield".to_string(),
                    postal_code: "12345".to_string(),
                    country: "US".to_string(),
                },
            }),
            &metadata,
        )
        .await?;
    tracing::info!(%order_id, total = %order.total_price(), "Order created");

    orders
        .handle(
            &OrderCommand::Pay(PayOrder {
                order_id: order_id.clone(),
                amount: order.total_price(),
            }),
            &metadata,
        )
        .await?;
    orders
        .handle(&OrderCommand::Submit(SubmitOrder { order_id: order_id.clone() }), &metadata)
        .await?;

    // The read model is eventually consistent.
    for _ in 0..50 {
        if let Some(view) = order_views.get_order(&order_id).await? {
            if view.status == OrderStatus::Submitted {
                tracing::info!(
                    %order_id,
                    status = %view.status,
                    total = %view.total_price,
                    position = view.last_global_position,
                    "Read model caught up"
                );
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    tracing::info!("Running; press Ctrl-C to stop");
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("Shutting down");
            handle.stop().await?;
        }
        () = wait_until_finished(&handle) => {
            handle.join().await?;
        }
    }
    Ok(())
}

async fn wait_until_finished(handle: &eventline_projections::WorkerHandle) {
    while !handle.is_finished() {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}
