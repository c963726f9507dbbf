//! Scope rebuild from raw transaction history.
//!
//! Recovery path for drifted or lost aggregates: throw the scope's rows
//! away mentally, refold every transaction in the window, and persist the
//! result. The incremental pipeline keeps running against the same rows.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::error::{RatingError, RebuildError};
use crate::event::TransactionEvent;
use crate::period::Period;
use crate::rating::{AssetMeta, RatingAggregate, RatingScope, calc, lock::get_scope_lock, store};

/// Supplies the raw transaction history a rebuild folds over.
///
/// Implementations may over-return: the rebuild itself drops events outside
/// the window and, for portfolio scopes, events of other portfolios.
#[async_trait]
pub trait TransactionSource: Send + Sync {
    async fn transactions(
        &self,
        period: &Period,
    ) -> Result<Vec<TransactionEvent>, Box<dyn std::error::Error + Send + Sync>>;
}

/// Rebuilds every aggregate of one scope from `source` and persists the
/// result, ranks included. Returns the number of aggregates written.
#[tracing::instrument(skip(pool, source), level = tracing::Level::INFO)]
pub async fn rebuild_scope(
    pool: &SqlitePool,
    source: &dyn TransactionSource,
    period: &Period,
    scope: &RatingScope,
) -> Result<usize, RebuildError> {
    let events = source
        .transactions(period)
        .await
        .map_err(|e| RebuildError::Source(e.to_string()))?;

    let mut by_asset: BTreeMap<Uuid, Vec<TransactionEvent>> = BTreeMap::new();
    for event in events {
        if !period.contains(event.transaction_time) {
            continue;
        }
        if let RatingScope::Portfolio(portfolio_id) = scope
            && event.portfolio_id != *portfolio_id
        {
            continue;
        }
        by_asset.entry(event.stock_card_id).or_default().push(event);
    }

    let now = Utc::now();
    let mut aggregates = Vec::with_capacity(by_asset.len());
    for (asset_id, events) in &by_asset {
        let meta = AssetMeta::placeholder(*asset_id, events[0].asset_type);
        let aggregate = RatingAggregate::from_batch(*asset_id, meta, *period, *scope, events, now)
            .map_err(RatingError::from)?;
        aggregates.push(aggregate);
    }

    calc::assign_ranks(&mut aggregates);

    for aggregate in &aggregates {
        let row_lock = get_scope_lock(&aggregate.asset_id, period, scope).await;
        let _guard = row_lock.lock().await;

        let mut sql_tx = pool.begin().await?;
        store::upsert(&mut sql_tx, aggregate).await?;
        sql_tx.commit().await?;
    }

    info!(
        scope = %scope,
        aggregates = aggregates.len(),
        "Rebuilt rating scope from transaction history"
    );

    Ok(aggregates.len())
}
