//! Transaction event consumer, the ingestion half of the rating engine.
//!
//! Each delivery is applied to two aggregates, the platform-wide one and the
//! one scoped to the event's portfolio, before the offset is committed back
//! to the bus. The broker redelivers anything uncommitted, so every write
//! goes through the consumed ledger in the same transaction as the aggregate
//! upsert and a redelivered event becomes a no-op.

use chrono::{DateTime, Utc};
use folio_bus::{Delivery, EventPublisher, EventStream, Header, StreamError, Topic};
use sqlx::SqlitePool;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{ConsumerError, RatingError};
use crate::event::{EventDecodeError, TransactionEvent};
use crate::period::Period;
use crate::rating::lock::get_scope_lock;
use crate::rating::{AssetMeta, RatingAggregate, RatingScope, store};

/// Subscription identity of the consumer. The topic is also the base name
/// for the dead letter topic undecodable messages are parked on.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub topic: Topic,
    pub group: String,
}

/// Bridges the event stream to the rating store.
pub struct TransactionConsumer<S, P> {
    config: ConsumerConfig,
    pool: SqlitePool,
    stream: S,
    dead_letters: P,
    shutdown: watch::Receiver<bool>,
}

impl<S: EventStream, P: EventPublisher> TransactionConsumer<S, P> {
    pub fn new(
        config: ConsumerConfig,
        pool: SqlitePool,
        stream: S,
        dead_letters: P,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            pool,
            stream,
            dead_letters,
            shutdown,
        }
    }

    /// Consumes deliveries until the stream closes or shutdown is signalled.
    ///
    /// Errors propagate to the caller with the current offset uncommitted;
    /// a restarted consumer resumes from the last committed offset and sees
    /// the failed delivery again.
    pub async fn run(mut self) -> Result<(), ConsumerError> {
        info!(
            topic = %self.config.topic,
            group = %self.config.group,
            "Starting transaction consumer"
        );

        loop {
            let delivery = tokio::select! {
                result = self.shutdown.changed() => {
                    if result.is_err() || *self.shutdown.borrow() {
                        info!("Transaction consumer stopping");
                        return Ok(());
                    }
                    continue;
                }
                delivery = self.stream.recv() => match delivery {
                    Ok(delivery) => delivery,
                    Err(StreamError::Closed) => {
                        info!("Event stream closed, transaction consumer stopping");
                        return Ok(());
                    }
                },
            };

            self.process_delivery(delivery).await?;
        }
    }

    #[tracing::instrument(skip(self, delivery), fields(offset = delivery.offset), level = tracing::Level::DEBUG)]
    async fn process_delivery(&mut self, delivery: Delivery) -> Result<(), ConsumerError> {
        match TransactionEvent::decode(&delivery.payload) {
            Ok(event) => {
                self.apply_event(&event).await?;
                self.stream.commit(delivery.offset).await?;
            }
            Err(error) => self.reject_delivery(&delivery, &error).await?,
        }

        Ok(())
    }

    /// Applies one decoded event to both of its scopes. The analysis window
    /// is anchored to processing time, not the event's own timestamp, so
    /// every consumer instance lands increments in the same window.
    async fn apply_event(&self, event: &TransactionEvent) -> Result<(), ConsumerError> {
        let now = Utc::now();
        let period = Period::current_window(now);

        self.apply_to_scope(event, &period, RatingScope::Global, now)
            .await?;
        self.apply_to_scope(
            event,
            &period,
            RatingScope::Portfolio(event.portfolio_id),
            now,
        )
        .await?;

        Ok(())
    }

    async fn apply_to_scope(
        &self,
        event: &TransactionEvent,
        period: &Period,
        scope: RatingScope,
        now: DateTime<Utc>,
    ) -> Result<(), ConsumerError> {
        let lock = get_scope_lock(&event.stock_card_id, period, &scope).await;
        let _guard = lock.lock().await;

        let existing = store::find_by_key(&self.pool, event.stock_card_id, period, &scope).await?;

        let mut sql_tx = self.pool.begin().await?;

        if !record_consumption(&mut sql_tx, event, &scope).await? {
            debug!(
                event_id = %event.id,
                scope = %scope,
                "Skipping already consumed transaction"
            );
            return Ok(());
        }

        let aggregate = match existing {
            Some(mut aggregate) => {
                aggregate.apply_increment(event, now);
                aggregate
            }
            None => {
                let meta = AssetMeta::placeholder(event.stock_card_id, event.asset_type);
                RatingAggregate::from_batch(
                    event.stock_card_id,
                    meta,
                    *period,
                    scope,
                    std::slice::from_ref(event),
                    now,
                )
                .map_err(RatingError::from)?
            }
        };

        store::upsert(&mut sql_tx, &aggregate).await?;
        sql_tx.commit().await?;

        debug!(
            event_id = %event.id,
            asset_id = %event.stock_card_id,
            scope = %scope,
            "Applied transaction to rating aggregate"
        );

        Ok(())
    }

    /// Parks an undecodable message on the dead letter topic and commits its
    /// offset. A failed park leaves the offset uncommitted so the message is
    /// seen again rather than silently lost.
    async fn reject_delivery(
        &mut self,
        delivery: &Delivery,
        error: &EventDecodeError,
    ) -> Result<(), ConsumerError> {
        warn!(
            offset = delivery.offset,
            "Rejecting undecodable message: {error}"
        );

        let dead_letter_topic = self.config.topic.dead_letter();
        let headers = [
            Header::new("original-topic", delivery.topic.as_str()),
            Header::new("error-message", error.to_string()),
            Header::new("error-type", error.kind()),
            Header::new("timestamp", Utc::now().to_rfc3339()),
        ];

        self.dead_letters
            .publish(&dead_letter_topic, &delivery.payload, &headers)
            .await
            .map_err(|source| ConsumerError::DeadLetter {
                offset: delivery.offset,
                source,
            })?;

        self.stream.commit(delivery.offset).await?;

        Ok(())
    }
}

/// Inserts the (event, scope) pair into the consumed ledger. Returns false
/// when the pair was already there, in which case the caller must not apply
/// the increment again.
async fn record_consumption(
    sql_tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    event: &TransactionEvent,
    scope: &RatingScope,
) -> Result<bool, ConsumerError> {
    let portfolio_id = scope
        .portfolio_id()
        .map(|id| id.to_string())
        .unwrap_or_default();

    let result = sqlx::query(
        "INSERT OR IGNORE INTO consumed_transactions (event_id, context, portfolio_id) \
         VALUES (?1, ?2, ?3)",
    )
    .bind(event.id.to_string())
    .bind(scope.context().as_str())
    .bind(portfolio_id)
    .execute(&mut **sql_tx)
    .await?;

    Ok(result.rows_affected() > 0)
}
