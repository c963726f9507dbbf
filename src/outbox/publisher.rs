use std::time::Duration;

use folio_bus::{EventPublisher, Receipt, Topic};
use rand::Rng;
use sqlx::SqlitePool;
use tokio::sync::watch;
use tokio::time::{Interval, interval};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::alert::AlertSender;
use crate::error::OutboxError;
use crate::outbox::{
    OutboxRecord, OutboxStatus, claim_pending_batch, mark_failed, mark_processed, release_claims,
};

#[derive(Debug, Clone)]
pub struct OutboxPublisherConfig {
    pub poll_interval: Duration,
    pub max_jitter: Duration,
    pub batch_size: i64,
    pub claim_lease: Duration,
    /// Claim identity of this publisher. Unique per process so parallel
    /// instances never drain each other's batches.
    pub instance: String,
}

impl Default for OutboxPublisherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            max_jitter: Duration::from_secs(5),
            batch_size: 100,
            claim_lease: Duration::from_secs(300),
            instance: format!("publisher-{}", Uuid::new_v4().simple()),
        }
    }
}

/// Background worker draining the outbox to the event bus.
///
/// Records are claimed in creation order and published one at a time. Each
/// record's outcome is committed before the next is attempted, so a crash
/// between records loses nothing and repeats at most one publish.
pub struct OutboxPublisher<P: EventPublisher> {
    config: OutboxPublisherConfig,
    pool: SqlitePool,
    interval: Interval,
    publisher: P,
    alerts: AlertSender,
    shutdown: watch::Receiver<bool>,
}

impl<P: EventPublisher> OutboxPublisher<P> {
    pub fn new(
        config: OutboxPublisherConfig,
        pool: SqlitePool,
        publisher: P,
        alerts: AlertSender,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let interval = interval(config.poll_interval);

        Self {
            config,
            pool,
            interval,
            publisher,
            alerts,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<(), OutboxError> {
        info!(
            instance = %self.config.instance,
            "Starting outbox publisher with interval: {:?}",
            self.config.poll_interval
        );

        loop {
            tokio::select! {
                _ = self.interval.tick() => {}
                result = self.shutdown.changed() => {
                    if result.is_err() || *self.shutdown.borrow() {
                        info!("Outbox publisher stopping");
                        return Ok(());
                    }
                    continue;
                }
            }

            self.add_jittered_delay().await;

            if let Err(e) = self.publish_pending_batch().await {
                error!("Publishing cycle failed: {e}");
            }
        }
    }

    /// One full claim-and-publish cycle. Exposed so embedding services and
    /// tests can drain the outbox without the timer.
    #[tracing::instrument(skip(self), level = tracing::Level::DEBUG)]
    pub async fn publish_pending_batch(&self) -> Result<(), OutboxError> {
        debug!("Starting publishing cycle for pending records");

        let records = claim_pending_batch(
            &self.pool,
            &self.config.instance,
            self.config.batch_size,
            self.config.claim_lease,
        )
        .await?;

        if records.is_empty() {
            debug!("No pending records to publish");
            return Ok(());
        }

        info!("Publishing {} pending records", records.len());

        for record in &records {
            if *self.shutdown.borrow() {
                info!("Shutdown requested mid-batch, releasing remaining claims");
                release_claims(&self.pool, &self.config.instance).await?;
                break;
            }

            if let Err(e) = self.publish_record(record).await {
                error!("Failed to settle outbox record {}: {e}", record.id);
            }
        }

        debug!("Completed publishing cycle");
        Ok(())
    }

    async fn publish_record(&self, record: &OutboxRecord) -> Result<(), OutboxError> {
        match self.try_publish(record).await {
            Ok(receipt) => {
                let mut sql_tx = self.pool.begin().await?;
                mark_processed(&mut sql_tx, record.id).await?;
                sql_tx.commit().await?;

                debug!(
                    record_id = record.id,
                    topic = %record.topic,
                    offset = receipt.offset,
                    "Published outbox record"
                );
                Ok(())
            }
            Err(reason) => {
                let mut sql_tx = self.pool.begin().await?;
                let (status, retry_count) = mark_failed(&mut sql_tx, record.id, &reason).await?;
                sql_tx.commit().await?;

                warn!(
                    record_id = record.id,
                    retry_count, "Publish attempt failed: {reason}"
                );

                if status == OutboxStatus::PermanentlyFailed {
                    self.alerts.publish_failed_permanently(
                        record.id,
                        &record.topic,
                        &reason,
                        retry_count,
                    );
                }
                Ok(())
            }
        }
    }

    async fn try_publish(&self, record: &OutboxRecord) -> Result<Receipt, String> {
        let topic = Topic::new(&record.topic).map_err(|e| e.to_string())?;

        self.publisher
            .publish(&topic, &record.payload, &[])
            .await
            .map_err(|e| e.to_string())
    }

    async fn add_jittered_delay(&self) {
        if self.config.max_jitter > Duration::ZERO {
            let max_jitter_u128 = self.config.max_jitter.as_millis().min(u128::from(u64::MAX));
            let max_jitter_millis = u64::try_from(max_jitter_u128).unwrap_or(u64::MAX);
            let jitter_millis = rand::thread_rng().gen_range(0..max_jitter_millis);
            let jitter = Duration::from_millis(jitter_millis);
            tokio::time::sleep(jitter).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::PipelineAlert;
    use crate::outbox::{count_pending, count_permanently_failed, enqueue};
    use crate::test_utils::{setup_test_db, transactions_topic};
    use folio_bus::mock::MockPublisher;
    use tokio::sync::broadcast::error::TryRecvError;

    async fn enqueue_one(pool: &SqlitePool, payload: &str) -> i64 {
        let mut sql_tx = pool.begin().await.unwrap();
        let id = enqueue(&mut sql_tx, &transactions_topic(), payload)
            .await
            .unwrap();
        sql_tx.commit().await.unwrap();
        id
    }

    fn test_publisher<P: EventPublisher>(
        pool: SqlitePool,
        publisher: P,
    ) -> (OutboxPublisher<P>, AlertSender, watch::Sender<bool>) {
        let alerts = AlertSender::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = OutboxPublisherConfig {
            max_jitter: Duration::ZERO,
            instance: "publisher-test".to_string(),
            ..OutboxPublisherConfig::default()
        };
        let worker = OutboxPublisher::new(config, pool, publisher, alerts.clone(), shutdown_rx);
        (worker, alerts, shutdown_tx)
    }

    #[tokio::test]
    async fn publishes_record_and_marks_it_processed() {
        let pool = setup_test_db().await;
        enqueue_one(&pool, r#"{"n":1}"#).await;

        let mock = MockPublisher::new();
        let (worker, _alerts, _shutdown) = test_publisher(pool.clone(), mock.clone());

        worker.publish_pending_batch().await.unwrap();

        assert_eq!(mock.publish_count(), 1);
        assert_eq!(count_pending(&pool).await.unwrap(), 0);
        assert_eq!(count_permanently_failed(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_publish_keeps_record_pending_with_error() {
        let pool = setup_test_db().await;
        enqueue_one(&pool, "{}").await;

        let mock = MockPublisher::with_failure("broker unavailable");
        let (worker, _alerts, _shutdown) = test_publisher(pool.clone(), mock);

        worker.publish_pending_batch().await.unwrap();

        assert_eq!(count_pending(&pool).await.unwrap(), 1);

        let records = claim_pending_batch(
            &pool,
            "publisher-test",
            10,
            Duration::from_secs(300),
        )
        .await
        .unwrap();
        assert_eq!(records[0].retry_count, 1);
        assert!(
            records[0]
                .last_error
                .as_deref()
                .unwrap()
                .contains("broker unavailable")
        );
    }

    #[tokio::test]
    async fn third_failed_attempt_parks_record_and_alerts() {
        let pool = setup_test_db().await;
        let id = enqueue_one(&pool, "{}").await;

        let mock = MockPublisher::with_failure("broker unavailable");
        let (worker, alerts, _shutdown) = test_publisher(pool.clone(), mock);
        let mut alert_rx = alerts.subscribe();

        worker.publish_pending_batch().await.unwrap();
        worker.publish_pending_batch().await.unwrap();
        assert_eq!(alert_rx.try_recv().unwrap_err(), TryRecvError::Empty);

        worker.publish_pending_batch().await.unwrap();

        let alert = alert_rx.try_recv().unwrap();
        let PipelineAlert::PublishFailedPermanently {
            record_id,
            retry_count,
            ..
        } = alert;
        assert_eq!(record_id, id);
        assert_eq!(retry_count, 3);

        assert_eq!(count_pending(&pool).await.unwrap(), 0);
        assert_eq!(count_permanently_failed(&pool).await.unwrap(), 1);

        // Parked records are out of every future batch.
        worker.publish_pending_batch().await.unwrap();
        assert_eq!(alert_rx.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[tokio::test]
    async fn one_failing_record_does_not_block_the_batch() {
        let pool = setup_test_db().await;
        enqueue_one(&pool, r#"{"n":1}"#).await;
        enqueue_one(&pool, r#"{"n":2}"#).await;

        let mock = MockPublisher::failing_times(1, "transient fault");
        let (worker, _alerts, _shutdown) = test_publisher(pool.clone(), mock.clone());

        worker.publish_pending_batch().await.unwrap();

        // First record failed once, second went through.
        assert_eq!(mock.publish_count(), 2);
        assert_eq!(count_pending(&pool).await.unwrap(), 1);

        worker.publish_pending_batch().await.unwrap();
        assert_eq!(count_pending(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn shutdown_mid_batch_releases_unpublished_claims() {
        let pool = setup_test_db().await;
        enqueue_one(&pool, r#"{"n":1}"#).await;
        enqueue_one(&pool, r#"{"n":2}"#).await;

        let mock = MockPublisher::new();
        let (worker, _alerts, shutdown) = test_publisher(pool.clone(), mock.clone());

        shutdown.send(true).unwrap();
        worker.publish_pending_batch().await.unwrap();

        assert_eq!(mock.publish_count(), 0);

        let records = claim_pending_batch(&pool, "other", 10, Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
    }
}
