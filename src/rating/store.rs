//! SQLite persistence for rating aggregates.
//!
//! The aggregate key is (asset_id, period, scope). Writes go through
//! [`upsert`] as an update-then-insert pair, the partial unique indexes on
//! `asset_ratings` back the key at the schema level.

use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use uuid::Uuid;

use crate::error::RatingError;
use crate::event::AssetKind;
use crate::period::Period;
use crate::rating::{AnalysisContext, RatingAggregate, RatingScope};

/// Largest leaderboard page a read query will serve.
pub const MAX_TOP_ASSETS: i64 = 100;
/// Leaderboard page size when the caller does not specify one.
pub const DEFAULT_TOP_ASSETS: i64 = 10;

const COLUMNS: &str = "asset_id, asset_type, ticker, name, period_start, period_end, \
     context, portfolio_id, buy_count, sell_count, total_buy_amount, total_sell_amount, \
     total_buy_quantity, total_sell_quantity, count_rank, amount_rank, last_updated";

type SqliteQuery<'q> = sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

fn scope_predicate(scope: &RatingScope) -> &'static str {
    match scope {
        RatingScope::Global => "portfolio_id IS NULL",
        RatingScope::Portfolio(_) => "portfolio_id = ?",
    }
}

fn bind_scope<'q>(query: SqliteQuery<'q>, scope: &RatingScope) -> SqliteQuery<'q> {
    match scope {
        RatingScope::Global => query,
        RatingScope::Portfolio(id) => query.bind(id.to_string()),
    }
}

/// Loads one aggregate by its full key.
#[tracing::instrument(skip(pool), level = tracing::Level::DEBUG)]
pub async fn find_by_key(
    pool: &SqlitePool,
    asset_id: Uuid,
    period: &Period,
    scope: &RatingScope,
) -> Result<Option<RatingAggregate>, RatingError> {
    let sql = format!(
        "SELECT {COLUMNS} FROM asset_ratings \
         WHERE asset_id = ? AND context = ? AND period_start = ? AND period_end = ? \
         AND {}",
        scope_predicate(scope)
    );

    let query = sqlx::query(&sql)
        .bind(asset_id.to_string())
        .bind(scope.context().as_str())
        .bind(period.start())
        .bind(period.end());

    let row = bind_scope(query, scope).fetch_optional(pool).await?;

    let Some(row) = row else {
        return Ok(None);
    };

    Ok(Some(aggregate_from_row(&row)?))
}

/// Persists an aggregate, updating the existing row for its key or
/// inserting a fresh one.
#[tracing::instrument(skip_all, level = tracing::Level::DEBUG)]
pub async fn upsert(
    sql_tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    aggregate: &RatingAggregate,
) -> Result<(), RatingError> {
    let sql = format!(
        "UPDATE asset_ratings \
         SET asset_type = ?, ticker = ?, name = ?, buy_count = ?, sell_count = ?, \
             total_buy_amount = ?, total_sell_amount = ?, total_buy_quantity = ?, \
             total_sell_quantity = ?, count_rank = ?, amount_rank = ?, last_updated = ? \
         WHERE asset_id = ? AND context = ? AND period_start = ? AND period_end = ? \
         AND {}",
        scope_predicate(&aggregate.scope)
    );

    let query = sqlx::query(&sql)
        .bind(aggregate.asset_type.as_str())
        .bind(&aggregate.ticker)
        .bind(&aggregate.name)
        .bind(aggregate.buy_count)
        .bind(aggregate.sell_count)
        .bind(aggregate.total_buy_amount.to_string())
        .bind(aggregate.total_sell_amount.to_string())
        .bind(aggregate.total_buy_quantity)
        .bind(aggregate.total_sell_quantity)
        .bind(aggregate.count_rank)
        .bind(aggregate.amount_rank)
        .bind(aggregate.last_updated)
        .bind(aggregate.asset_id.to_string())
        .bind(aggregate.scope.context().as_str())
        .bind(aggregate.period.start())
        .bind(aggregate.period.end());

    let result = bind_scope(query, &aggregate.scope)
        .execute(&mut **sql_tx)
        .await?;

    if result.rows_affected() > 0 {
        return Ok(());
    }

    sqlx::query(
        "INSERT INTO asset_ratings ( \
             asset_id, asset_type, ticker, name, period_start, period_end, \
             context, portfolio_id, buy_count, sell_count, total_buy_amount, \
             total_sell_amount, total_buy_quantity, total_sell_quantity, \
             count_rank, amount_rank, last_updated \
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(aggregate.asset_id.to_string())
    .bind(aggregate.asset_type.as_str())
    .bind(&aggregate.ticker)
    .bind(&aggregate.name)
    .bind(aggregate.period.start())
    .bind(aggregate.period.end())
    .bind(aggregate.scope.context().as_str())
    .bind(aggregate.scope.portfolio_id().map(|id| id.to_string()))
    .bind(aggregate.buy_count)
    .bind(aggregate.sell_count)
    .bind(aggregate.total_buy_amount.to_string())
    .bind(aggregate.total_sell_amount.to_string())
    .bind(aggregate.total_buy_quantity)
    .bind(aggregate.total_sell_quantity)
    .bind(aggregate.count_rank)
    .bind(aggregate.amount_rank)
    .bind(aggregate.last_updated)
    .execute(&mut **sql_tx)
    .await?;

    Ok(())
}

/// Writes only the rank columns of an aggregate's row.
///
/// Reconciliation persists through this so a concurrent streaming increment
/// on the same row is never overwritten by stale counters.
#[tracing::instrument(skip_all, level = tracing::Level::DEBUG)]
pub async fn update_ranks(
    sql_tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    aggregate: &RatingAggregate,
) -> Result<(), RatingError> {
    let sql = format!(
        "UPDATE asset_ratings \
         SET count_rank = ?, amount_rank = ?, last_updated = ? \
         WHERE asset_id = ? AND context = ? AND period_start = ? AND period_end = ? \
         AND {}",
        scope_predicate(&aggregate.scope)
    );

    let query = sqlx::query(&sql)
        .bind(aggregate.count_rank)
        .bind(aggregate.amount_rank)
        .bind(aggregate.last_updated)
        .bind(aggregate.asset_id.to_string())
        .bind(aggregate.scope.context().as_str())
        .bind(aggregate.period.start())
        .bind(aggregate.period.end());

    bind_scope(query, &aggregate.scope)
        .execute(&mut **sql_tx)
        .await?;

    Ok(())
}

/// Loads every aggregate of one scope, most traded first.
#[tracing::instrument(skip(pool), level = tracing::Level::DEBUG)]
pub async fn load_scope(
    pool: &SqlitePool,
    period: &Period,
    scope: &RatingScope,
) -> Result<Vec<RatingAggregate>, RatingError> {
    let sql = format!(
        "SELECT {COLUMNS} FROM asset_ratings \
         WHERE context = ? AND period_start = ? AND period_end = ? AND {} \
         ORDER BY (buy_count + sell_count) DESC, asset_id ASC",
        scope_predicate(scope)
    );

    let query = sqlx::query(&sql)
        .bind(scope.context().as_str())
        .bind(period.start())
        .bind(period.end());

    let rows = bind_scope(query, scope).fetch_all(pool).await?;

    rows.iter().map(aggregate_from_row).collect()
}

/// Portfolios that have at least one aggregate in the window.
pub async fn distinct_portfolios(
    pool: &SqlitePool,
    period: &Period,
) -> Result<Vec<Uuid>, RatingError> {
    let rows = sqlx::query(
        "SELECT DISTINCT portfolio_id FROM asset_ratings \
         WHERE context = ? AND period_start = ? AND period_end = ? \
           AND portfolio_id IS NOT NULL \
         ORDER BY portfolio_id ASC",
    )
    .bind(AnalysisContext::Portfolio.as_str())
    .bind(period.start())
    .bind(period.end())
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let id: String = row.try_get("portfolio_id")?;
            Ok(id.parse()?)
        })
        .collect()
}

/// Leaderboard page ordered by count rank.
pub async fn top_by_count(
    pool: &SqlitePool,
    period: &Period,
    scope: &RatingScope,
    limit: Option<i64>,
) -> Result<Vec<RatingAggregate>, RatingError> {
    top_by_rank_column(pool, period, scope, limit, "count_rank").await
}

/// Leaderboard page ordered by amount rank.
pub async fn top_by_amount(
    pool: &SqlitePool,
    period: &Period,
    scope: &RatingScope,
    limit: Option<i64>,
) -> Result<Vec<RatingAggregate>, RatingError> {
    top_by_rank_column(pool, period, scope, limit, "amount_rank").await
}

async fn top_by_rank_column(
    pool: &SqlitePool,
    period: &Period,
    scope: &RatingScope,
    limit: Option<i64>,
    rank_column: &str,
) -> Result<Vec<RatingAggregate>, RatingError> {
    let limit = limit.unwrap_or(DEFAULT_TOP_ASSETS).clamp(1, MAX_TOP_ASSETS);

    let sql = format!(
        "SELECT {COLUMNS} FROM asset_ratings \
         WHERE context = ? AND period_start = ? AND period_end = ? AND {} \
         ORDER BY {rank_column} ASC \
         LIMIT ?",
        scope_predicate(scope)
    );

    let query = sqlx::query(&sql)
        .bind(scope.context().as_str())
        .bind(period.start())
        .bind(period.end());

    let rows = bind_scope(query, scope).bind(limit).fetch_all(pool).await?;

    rows.iter().map(aggregate_from_row).collect()
}

fn aggregate_from_row(row: &SqliteRow) -> Result<RatingAggregate, RatingError> {
    let asset_id: String = row.try_get("asset_id")?;
    let asset_type: String = row.try_get("asset_type")?;
    let context: String = row.try_get("context")?;
    let portfolio_id: Option<String> = row.try_get("portfolio_id")?;
    let total_buy_amount: String = row.try_get("total_buy_amount")?;
    let total_sell_amount: String = row.try_get("total_sell_amount")?;

    let context: AnalysisContext = context.parse()?;
    let portfolio_id = portfolio_id.map(|id| id.parse::<Uuid>()).transpose()?;
    let scope = RatingScope::from_parts(context, portfolio_id)?;
    let period = Period::new(row.try_get("period_start")?, row.try_get("period_end")?)?;

    let aggregate = RatingAggregate {
        asset_id: asset_id.parse()?,
        asset_type: asset_type.parse::<AssetKind>()?,
        ticker: row.try_get("ticker")?,
        name: row.try_get("name")?,
        period,
        scope,
        buy_count: row.try_get("buy_count")?,
        sell_count: row.try_get("sell_count")?,
        total_buy_amount: total_buy_amount.parse()?,
        total_sell_amount: total_sell_amount.parse()?,
        total_buy_quantity: row.try_get("total_buy_quantity")?,
        total_sell_quantity: row.try_get("total_sell_quantity")?,
        count_rank: row.try_get("count_rank")?,
        amount_rank: row.try_get("amount_rank")?,
        last_updated: row.try_get("last_updated")?,
    };
    aggregate.ensure_invariants()?;

    Ok(aggregate)
}
