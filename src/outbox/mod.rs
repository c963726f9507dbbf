//! Transactional outbox for portfolio transaction events.
//!
//! Producers append records in the same database transaction as their domain
//! write. A background publisher claims batches and pushes them to the bus,
//! so an event is either durably queued or the domain write never happened.

pub mod publisher;

use std::time::Duration;

use chrono::{DateTime, Utc};
use folio_bus::Topic;
use serde::Serialize;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use crate::error::OutboxError;

/// Publish attempts before a record is parked as permanently failed.
pub const MAX_PUBLISH_ATTEMPTS: i64 = 3;

/// Lifecycle of an outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Processed,
    PermanentlyFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown outbox status '{0}'")]
pub struct ParseOutboxStatusError(pub String);

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processed => "processed",
            Self::PermanentlyFailed => "permanently_failed",
        }
    }
}

impl std::str::FromStr for OutboxStatus {
    type Err = ParseOutboxStatusError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "processed" => Ok(Self::Processed),
            "permanently_failed" => Ok(Self::PermanentlyFailed),
            other => Err(ParseOutboxStatusError(other.to_string())),
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A queued event as read back from the database.
///
/// Records are only ever materialized from rows, so `id` and `created_at`
/// are always present.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    pub id: i64,
    pub topic: String,
    pub payload: String,
    pub status: OutboxStatus,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Appends a record inside the caller's transaction.
///
/// This is the producer contract: commit your domain write and the outbox
/// append together, or neither.
#[tracing::instrument(skip(sql_tx, payload), level = tracing::Level::DEBUG)]
pub async fn enqueue(
    sql_tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    topic: &Topic,
    payload: &str,
) -> Result<i64, OutboxError> {
    let result = sqlx::query(
        r#"
        INSERT INTO outbox_records (topic, payload)
        VALUES (?1, ?2)
        "#,
    )
    .bind(topic.as_str())
    .bind(payload)
    .execute(&mut **sql_tx)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Serializes `event` as JSON and appends it inside the caller's transaction.
pub async fn enqueue_event<T: Serialize>(
    sql_tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    topic: &Topic,
    event: &T,
) -> Result<i64, OutboxError> {
    let payload = serde_json::to_string(event)?;
    enqueue(sql_tx, topic, &payload).await
}

/// Claims up to `batch_size` publishable records for `instance`.
///
/// A record is publishable while it is `pending`, below the retry ceiling,
/// and either unclaimed or claimed by a lease that expired `lease` ago. The
/// claim-and-read is a single statement, so two racing instances never hold
/// the same record.
#[tracing::instrument(skip(pool), level = tracing::Level::DEBUG)]
pub async fn claim_pending_batch(
    pool: &SqlitePool,
    instance: &str,
    batch_size: i64,
    lease: Duration,
) -> Result<Vec<OutboxRecord>, OutboxError> {
    let lease_cutoff = format!("-{} seconds", lease.as_secs());

    let rows = sqlx::query(
        r#"
        UPDATE outbox_records
        SET claimed_by = ?1, claimed_at = CURRENT_TIMESTAMP
        WHERE id IN (
            SELECT id FROM outbox_records
            WHERE status = 'pending'
              AND retry_count < ?2
              AND (
                  claimed_by IS NULL
                  OR claimed_by = ?1
                  OR claimed_at < datetime('now', ?3)
              )
            ORDER BY created_at ASC, id ASC
            LIMIT ?4
        )
        RETURNING id, topic, payload, status, retry_count, last_error, created_at, processed_at
        "#,
    )
    .bind(instance)
    .bind(MAX_PUBLISH_ATTEMPTS)
    .bind(&lease_cutoff)
    .bind(batch_size)
    .fetch_all(pool)
    .await?;

    let mut records = rows
        .iter()
        .map(record_from_row)
        .collect::<Result<Vec<_>, _>>()?;

    // RETURNING does not guarantee an order.
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

    Ok(records)
}

/// Releases every claim held by `instance` on still-pending records.
///
/// Called on shutdown so a stopped publisher does not sit on its batch until
/// the lease expires.
pub async fn release_claims(pool: &SqlitePool, instance: &str) -> Result<u64, OutboxError> {
    let result = sqlx::query(
        r#"
        UPDATE outbox_records
        SET claimed_by = NULL, claimed_at = NULL
        WHERE claimed_by = ?1 AND status = 'pending'
        "#,
    )
    .bind(instance)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Marks a record as successfully published, within the caller's transaction.
#[tracing::instrument(skip(sql_tx), level = tracing::Level::DEBUG)]
pub async fn mark_processed(
    sql_tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    id: i64,
) -> Result<(), OutboxError> {
    sqlx::query(
        r#"
        UPDATE outbox_records
        SET status = 'processed',
            processed_at = CURRENT_TIMESTAMP,
            claimed_by = NULL,
            claimed_at = NULL
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .execute(&mut **sql_tx)
    .await?;

    Ok(())
}

/// Records a failed publish attempt and releases the claim.
///
/// The record stays `pending` until the attempt counter reaches
/// [`MAX_PUBLISH_ATTEMPTS`], at which point it is parked as
/// `permanently_failed`. Returns the resulting status and attempt count so
/// the caller can raise an alert on the transition.
#[tracing::instrument(skip(sql_tx, error_text), level = tracing::Level::DEBUG)]
pub async fn mark_failed(
    sql_tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    id: i64,
    error_text: &str,
) -> Result<(OutboxStatus, i64), OutboxError> {
    let row = sqlx::query(
        r#"
        UPDATE outbox_records
        SET retry_count = retry_count + 1,
            last_error = ?2,
            claimed_by = NULL,
            claimed_at = NULL,
            status = CASE
                WHEN retry_count + 1 >= ?3 THEN 'permanently_failed'
                ELSE status
            END
        WHERE id = ?1
        RETURNING status, retry_count
        "#,
    )
    .bind(id)
    .bind(error_text)
    .bind(MAX_PUBLISH_ATTEMPTS)
    .fetch_one(&mut **sql_tx)
    .await?;

    let status: String = row.try_get("status")?;
    let retry_count: i64 = row.try_get("retry_count")?;
    let status = status
        .parse()
        .map_err(|e: ParseOutboxStatusError| OutboxError::UnknownStatus { id, status: e.0 })?;

    Ok((status, retry_count))
}

/// Count of records still awaiting publication.
pub async fn count_pending(pool: &SqlitePool) -> Result<i64, OutboxError> {
    let row = sqlx::query("SELECT COUNT(*) AS count FROM outbox_records WHERE status = 'pending'")
        .fetch_one(pool)
        .await?;

    Ok(row.try_get("count")?)
}

/// Count of records parked after exhausting their publish attempts.
pub async fn count_permanently_failed(pool: &SqlitePool) -> Result<i64, OutboxError> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS count FROM outbox_records WHERE status = 'permanently_failed'",
    )
    .fetch_one(pool)
    .await?;

    Ok(row.try_get("count")?)
}

fn record_from_row(row: &SqliteRow) -> Result<OutboxRecord, OutboxError> {
    let id: i64 = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let status = status
        .parse()
        .map_err(|e: ParseOutboxStatusError| OutboxError::UnknownStatus { id, status: e.0 })?;

    let created_at: chrono::NaiveDateTime = row.try_get("created_at")?;
    let processed_at: Option<chrono::NaiveDateTime> = row.try_get("processed_at")?;

    Ok(OutboxRecord {
        id,
        topic: row.try_get("topic")?,
        payload: row.try_get("payload")?,
        status,
        retry_count: row.try_get("retry_count")?,
        last_error: row.try_get("last_error")?,
        created_at: created_at.and_utc(),
        processed_at: processed_at.map(|dt| dt.and_utc()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TransactionEvent;
    use crate::test_utils::{TransactionEventBuilder, setup_test_db, transactions_topic};

    const LEASE: Duration = Duration::from_secs(300);

    async fn enqueue_one(pool: &SqlitePool, payload: &str) -> i64 {
        let mut sql_tx = pool.begin().await.unwrap();
        let id = enqueue(&mut sql_tx, &transactions_topic(), payload)
            .await
            .unwrap();
        sql_tx.commit().await.unwrap();
        id
    }

    #[tokio::test]
    async fn enqueue_then_claim_returns_pending_record() {
        let pool = setup_test_db().await;
        let id = enqueue_one(&pool, r#"{"n":1}"#).await;

        let records = claim_pending_batch(&pool, "worker-a", 10, LEASE)
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, id);
        assert_eq!(records[0].topic, "portfolio.transactions");
        assert_eq!(records[0].payload, r#"{"n":1}"#);
        assert_eq!(records[0].status, OutboxStatus::Pending);
        assert_eq!(records[0].retry_count, 0);
        assert_eq!(records[0].processed_at, None);
    }

    #[tokio::test]
    async fn claimed_records_are_invisible_to_other_instances() {
        let pool = setup_test_db().await;
        enqueue_one(&pool, "{}").await;

        let first = claim_pending_batch(&pool, "worker-a", 10, LEASE)
            .await
            .unwrap();
        let second = claim_pending_batch(&pool, "worker-b", 10, LEASE)
            .await
            .unwrap();

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn expired_claims_are_taken_over() {
        let pool = setup_test_db().await;
        enqueue_one(&pool, "{}").await;

        claim_pending_batch(&pool, "worker-a", 10, LEASE)
            .await
            .unwrap();

        // Simulate a publisher that died mid-batch.
        sqlx::query("UPDATE outbox_records SET claimed_at = datetime('now', '-10 minutes')")
            .execute(&pool)
            .await
            .unwrap();

        let records = claim_pending_batch(&pool, "worker-b", 10, LEASE)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn instance_can_reclaim_its_own_records() {
        let pool = setup_test_db().await;
        enqueue_one(&pool, "{}").await;

        let first = claim_pending_batch(&pool, "worker-a", 10, LEASE)
            .await
            .unwrap();
        let again = claim_pending_batch(&pool, "worker-a", 10, LEASE)
            .await
            .unwrap();

        assert_eq!(first, again);
    }

    #[tokio::test]
    async fn mark_processed_retires_the_record() {
        let pool = setup_test_db().await;
        let id = enqueue_one(&pool, "{}").await;
        claim_pending_batch(&pool, "worker-a", 10, LEASE)
            .await
            .unwrap();

        let mut sql_tx = pool.begin().await.unwrap();
        mark_processed(&mut sql_tx, id).await.unwrap();
        sql_tx.commit().await.unwrap();

        assert_eq!(count_pending(&pool).await.unwrap(), 0);
        assert!(
            claim_pending_batch(&pool, "worker-a", 10, LEASE)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn failed_record_stays_pending_below_the_ceiling() {
        let pool = setup_test_db().await;
        let id = enqueue_one(&pool, "{}").await;
        claim_pending_batch(&pool, "worker-a", 10, LEASE)
            .await
            .unwrap();

        let mut sql_tx = pool.begin().await.unwrap();
        let (status, retries) = mark_failed(&mut sql_tx, id, "broker timeout").await.unwrap();
        sql_tx.commit().await.unwrap();

        assert_eq!(status, OutboxStatus::Pending);
        assert_eq!(retries, 1);

        let records = claim_pending_batch(&pool, "worker-b", 10, LEASE)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].last_error.as_deref(), Some("broker timeout"));
    }

    #[tokio::test]
    async fn third_failure_parks_the_record() {
        let pool = setup_test_db().await;
        let id = enqueue_one(&pool, "{}").await;

        for attempt in 1..=MAX_PUBLISH_ATTEMPTS {
            claim_pending_batch(&pool, "worker-a", 10, LEASE)
                .await
                .unwrap();

            let mut sql_tx = pool.begin().await.unwrap();
            let (status, retries) = mark_failed(&mut sql_tx, id, "still down").await.unwrap();
            sql_tx.commit().await.unwrap();

            assert_eq!(retries, attempt);
            if attempt < MAX_PUBLISH_ATTEMPTS {
                assert_eq!(status, OutboxStatus::Pending);
            } else {
                assert_eq!(status, OutboxStatus::PermanentlyFailed);
            }
        }

        assert!(
            claim_pending_batch(&pool, "worker-a", 10, LEASE)
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(count_pending(&pool).await.unwrap(), 0);
        assert_eq!(count_permanently_failed(&pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn oldest_records_are_claimed_first() {
        let pool = setup_test_db().await;
        let first = enqueue_one(&pool, r#"{"n":1}"#).await;
        let second = enqueue_one(&pool, r#"{"n":2}"#).await;
        enqueue_one(&pool, r#"{"n":3}"#).await;

        let records = claim_pending_batch(&pool, "worker-a", 2, LEASE)
            .await
            .unwrap();

        assert_eq!(
            records.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![first, second]
        );
    }

    #[tokio::test]
    async fn release_claims_frees_records_for_other_instances() {
        let pool = setup_test_db().await;
        enqueue_one(&pool, "{}").await;
        claim_pending_batch(&pool, "worker-a", 10, LEASE)
            .await
            .unwrap();

        let released = release_claims(&pool, "worker-a").await.unwrap();
        assert_eq!(released, 1);

        let records = claim_pending_batch(&pool, "worker-b", 10, LEASE)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn enqueue_rolls_back_with_the_caller_transaction() {
        let pool = setup_test_db().await;

        let mut sql_tx = pool.begin().await.unwrap();
        enqueue(&mut sql_tx, &transactions_topic(), "{}")
            .await
            .unwrap();
        drop(sql_tx);

        assert_eq!(count_pending(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn enqueue_event_serializes_the_wire_format() {
        let pool = setup_test_db().await;
        let event = TransactionEventBuilder::new().build();

        let mut sql_tx = pool.begin().await.unwrap();
        enqueue_event(&mut sql_tx, &transactions_topic(), &event)
            .await
            .unwrap();
        sql_tx.commit().await.unwrap();

        let records = claim_pending_batch(&pool, "worker-a", 1, LEASE)
            .await
            .unwrap();
        let decoded = TransactionEvent::decode(&records[0].payload).unwrap();
        assert_eq!(decoded, event);
    }
}
