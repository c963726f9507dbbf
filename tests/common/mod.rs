//! Shared helpers for pipeline integration tests.
//!
//! Wires real workers to an in-process bus and an in-memory database, so
//! tests drive the same code paths as `launch` without timers or signals.

use std::time::Duration;

use chrono::Utc;
use folio_bus::{InMemoryBus, Topic};
use rust_decimal::Decimal;
use sqlx::SqlitePool;
use tokio::sync::watch;
use uuid::Uuid;

use folio_analytics::alert::AlertSender;
use folio_analytics::consumer::{ConsumerConfig, TransactionConsumer};
use folio_analytics::event::{AssetKind, TransactionEvent, TransactionKind};
use folio_analytics::outbox::publisher::{OutboxPublisher, OutboxPublisherConfig};
use folio_analytics::reconciliation::{ReconciliationConfig, ReconciliationJob};

pub const GROUP: &str = "analytics-rating-aggregator";

pub async fn setup_db() -> SqlitePool {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    sqlx::migrate!().run(&pool).await.unwrap();
    pool
}

pub fn transactions_topic() -> Topic {
    Topic::new("portfolio.transactions").unwrap()
}

/// A valid share transaction with the total derived from price and quantity.
pub fn transaction_event(
    portfolio_id: Uuid,
    stock_card_id: Uuid,
    transaction_type: TransactionKind,
    quantity: i64,
    price_per_unit: Decimal,
) -> TransactionEvent {
    TransactionEvent {
        id: Uuid::new_v4(),
        portfolio_id,
        stock_card_id,
        asset_type: AssetKind::Share,
        transaction_type,
        quantity,
        price_per_unit,
        total_amount: price_per_unit * Decimal::from(quantity),
        transaction_time: Utc::now(),
        currency: "RUB".to_string(),
        metadata: None,
    }
}

/// Publisher wired for tests: no jitter, fixed claim identity.
pub fn outbox_publisher(
    pool: &SqlitePool,
    bus: &InMemoryBus,
    alerts: &AlertSender,
) -> (OutboxPublisher<InMemoryBus>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let config = OutboxPublisherConfig {
        max_jitter: Duration::ZERO,
        instance: "publisher-it".to_string(),
        ..OutboxPublisherConfig::default()
    };

    (
        OutboxPublisher::new(
            config,
            pool.clone(),
            bus.clone(),
            alerts.clone(),
            shutdown_rx,
        ),
        shutdown_tx,
    )
}

/// Closes the bus and runs a consumer until the drained stream reports
/// closed. Call after everything under test has been published.
pub async fn drain_bus_into_ratings(pool: &SqlitePool, bus: &InMemoryBus) {
    let topic = transactions_topic();
    let stream = bus.subscribe(&topic, GROUP).await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer = TransactionConsumer::new(
        ConsumerConfig {
            topic,
            group: GROUP.to_string(),
        },
        pool.clone(),
        stream,
        bus.clone(),
        shutdown_rx,
    );

    bus.close();
    consumer.run().await.unwrap();
    drop(shutdown_tx);
}

/// Runs one reconciliation pass over the current window.
pub async fn reconcile(pool: &SqlitePool) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let job = ReconciliationJob::new(ReconciliationConfig::default(), pool.clone(), shutdown_rx);

    job.run_once().await.unwrap();
    drop(shutdown_tx);
}
