use std::time::Duration;

use folio_bus::InMemoryBus;
use sqlx::SqlitePool;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tracing::{error, info, info_span};

pub mod alert;
pub mod config;
pub mod consumer;
pub mod error;
pub mod event;
pub mod outbox;
pub mod period;
pub mod rating;
pub mod reconciliation;

#[cfg(test)]
pub(crate) mod test_utils;

use crate::alert::AlertSender;
use crate::config::Ctx;
use crate::consumer::TransactionConsumer;
use crate::error::{OutboxError, ReconciliationError};
use crate::outbox::publisher::OutboxPublisher;
use crate::reconciliation::ReconciliationJob;

/// Runs the full pipeline until a shutdown signal or a fatal task failure.
///
/// All three workers share one shutdown channel and one event bus. The bus
/// is in-process; the publisher and consumer only touch it through the
/// `EventPublisher` and `EventStream` seams, which is where an external
/// broker client would plug in.
pub async fn launch(ctx: Ctx) -> anyhow::Result<()> {
    let launch_span = info_span!("launch");
    let _enter = launch_span.enter();

    let pool = ctx.get_sqlite_pool().await?;
    sqlx::migrate!().run(&pool).await?;

    let bus = InMemoryBus::new();
    let alerts = AlertSender::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let publisher_task = spawn_publisher_task(&ctx, &pool, &bus, &alerts, &shutdown_rx);
    let consumer_task = spawn_consumer_task(&ctx, &pool, &bus, &shutdown_rx);
    let reconciliation_task = spawn_reconciliation_task(&ctx, &pool, &shutdown_rx);

    await_shutdown(
        publisher_task,
        consumer_task,
        reconciliation_task,
        shutdown_tx,
    )
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn spawn_publisher_task(
    ctx: &Ctx,
    pool: &SqlitePool,
    bus: &InMemoryBus,
    alerts: &AlertSender,
    shutdown: &watch::Receiver<bool>,
) -> JoinHandle<Result<(), OutboxError>> {
    let publisher = OutboxPublisher::new(
        ctx.get_publisher_config(),
        pool.clone(),
        bus.clone(),
        alerts.clone(),
        shutdown.clone(),
    );

    tokio::spawn(publisher.run())
}

/// Supervises the consumer: a session that errors out is restarted after a
/// short delay and resubscribes at the group's last committed offset, so
/// the delivery that failed is seen again.
fn spawn_consumer_task(
    ctx: &Ctx,
    pool: &SqlitePool,
    bus: &InMemoryBus,
    shutdown: &watch::Receiver<bool>,
) -> JoinHandle<()> {
    const RERUN_DELAY_SECS: u64 = 5;

    let config = ctx.get_consumer_config();
    let pool = pool.clone();
    let bus = bus.clone();
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        loop {
            let stream = bus.subscribe(&config.topic, &config.group).await;
            let consumer = TransactionConsumer::new(
                config.clone(),
                pool.clone(),
                stream,
                bus.clone(),
                shutdown.clone(),
            );

            match consumer.run().await {
                Ok(()) => break,
                Err(e) => error!("Consumer session failed: {e}"),
            }

            if *shutdown.borrow() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(RERUN_DELAY_SECS)).await;
        }
    })
}

fn spawn_reconciliation_task(
    ctx: &Ctx,
    pool: &SqlitePool,
    shutdown: &watch::Receiver<bool>,
) -> JoinHandle<Result<(), ReconciliationError>> {
    let job = ReconciliationJob::new(
        ctx.get_reconciliation_config(),
        pool.clone(),
        shutdown.clone(),
    );

    tokio::spawn(job.run())
}

async fn await_shutdown(
    publisher_task: JoinHandle<Result<(), OutboxError>>,
    consumer_task: JoinHandle<()>,
    reconciliation_task: JoinHandle<Result<(), ReconciliationError>>,
    shutdown: watch::Sender<bool>,
) {
    const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

    let publisher_abort = publisher_task.abort_handle();
    let consumer_abort = consumer_task.abort_handle();
    let reconciliation_abort = reconciliation_task.abort_handle();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, shutting down gracefully...");
            let _ = shutdown.send(true);
            tokio::time::sleep(SHUTDOWN_GRACE).await;
            abort_task("publisher", &publisher_abort);
            abort_task("consumer", &consumer_abort);
            abort_task("reconciliation", &reconciliation_abort);
        }
        result = publisher_task => {
            log_worker_result("publisher", result);
            let _ = shutdown.send(true);
            abort_task("consumer", &consumer_abort);
            abort_task("reconciliation", &reconciliation_abort);
        }
        result = consumer_task => {
            log_supervisor_result("consumer", result);
            let _ = shutdown.send(true);
            abort_task("publisher", &publisher_abort);
            abort_task("reconciliation", &reconciliation_abort);
        }
        result = reconciliation_task => {
            log_worker_result("reconciliation", result);
            let _ = shutdown.send(true);
            abort_task("publisher", &publisher_abort);
            abort_task("consumer", &consumer_abort);
        }
    }
}

fn abort_task(name: &str, handle: &AbortHandle) {
    info!("Aborting {name} task");
    handle.abort();
}

fn log_worker_result<E: std::fmt::Display>(name: &str, result: Result<Result<(), E>, JoinError>) {
    match result {
        Ok(Ok(())) => info!("{name} task completed"),
        Ok(Err(e)) => error!("{name} task failed: {e}"),
        Err(e) => error!("{name} task panicked: {e}"),
    }
}

fn log_supervisor_result(name: &str, result: Result<(), JoinError>) {
    match result {
        Ok(()) => info!("{name} task completed"),
        Err(e) => error!("{name} task panicked: {e}"),
    }
}
