//! Periodic rank reconciliation, the slow path of the rating engine.
//!
//! The consumer only bumps counters and leaves ranks stale. This job
//! periodically reloads every scope of the current window, recomputes both
//! orderings and writes the ranks back. Only the rank columns are written,
//! so increments landing mid-run are never overwritten; they are picked up
//! by the next run.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use sqlx::SqlitePool;
use tokio::sync::watch;
use tokio::time::{Interval, interval};
use tracing::{debug, error, info};

use crate::error::ReconciliationError;
use crate::period::Period;
use crate::rating::calc::assign_ranks;
use crate::rating::lock::get_scope_lock;
use crate::rating::{RatingScope, store};

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    pub run_interval: Duration,
    pub max_jitter: Duration,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            run_interval: Duration::from_secs(900),
            max_jitter: Duration::from_secs(60),
        }
    }
}

/// What one reconciliation run covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconciliationSummary {
    pub scopes: usize,
    pub aggregates: usize,
    pub elapsed: Duration,
}

/// Background job re-ranking all rating scopes of the current window.
pub struct ReconciliationJob {
    config: ReconciliationConfig,
    pool: SqlitePool,
    interval: Interval,
    shutdown: watch::Receiver<bool>,
}

impl ReconciliationJob {
    pub fn new(
        config: ReconciliationConfig,
        pool: SqlitePool,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let interval = interval(config.run_interval);
        Self {
            config,
            pool,
            interval,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<(), ReconciliationError> {
        info!(
            "Starting rank reconciliation job with interval: {:?}",
            self.config.run_interval
        );

        loop {
            tokio::select! {
                _ = self.interval.tick() => {}
                result = self.shutdown.changed() => {
                    if result.is_err() || *self.shutdown.borrow() {
                        info!("Rank reconciliation job stopping");
                        return Ok(());
                    }
                    continue;
                }
            }

            self.add_jittered_delay().await;

            if let Err(e) = self.run_once().await {
                error!("Reconciliation run failed: {e}");
            }
        }
    }

    /// One full reconciliation pass over the current window. Exposed so
    /// tests and operational tooling can force a re-rank without the timer.
    ///
    /// The global scope is ranked first, then every portfolio scope that has
    /// aggregates in the window. Shutdown is honored between scopes, so a
    /// stopping process finishes the scope it is on and leaves the rest for
    /// the next run.
    #[tracing::instrument(skip(self), level = tracing::Level::DEBUG)]
    pub async fn run_once(&self) -> Result<ReconciliationSummary, ReconciliationError> {
        let started = Instant::now();
        let now = Utc::now();
        let period = Period::current_window(now);

        let mut scopes = 1_usize;
        let mut aggregates = self
            .reconcile_scope(&period, &RatingScope::Global, now)
            .await?;

        for portfolio_id in store::distinct_portfolios(&self.pool, &period).await? {
            if *self.shutdown.borrow() {
                info!("Shutdown requested, stopping reconciliation between scopes");
                break;
            }

            aggregates += self
                .reconcile_scope(&period, &RatingScope::Portfolio(portfolio_id), now)
                .await?;
            scopes += 1;
        }

        let summary = ReconciliationSummary {
            scopes,
            aggregates,
            elapsed: started.elapsed(),
        };

        info!(
            scopes = summary.scopes,
            aggregates = summary.aggregates,
            elapsed = ?summary.elapsed,
            "Reconciled rating ranks"
        );

        Ok(summary)
    }

    /// Re-ranks one scope. Ranks are computed from a snapshot of the scope
    /// taken at entry; counters changed after the snapshot keep their new
    /// values and simply carry a rank from the pre-change ordering.
    async fn reconcile_scope(
        &self,
        period: &Period,
        scope: &RatingScope,
        now: DateTime<Utc>,
    ) -> Result<usize, ReconciliationError> {
        let mut aggregates = store::load_scope(&self.pool, period, scope).await?;
        if aggregates.is_empty() {
            debug!(scope = %scope, "No aggregates in scope, nothing to rank");
            return Ok(0);
        }

        assign_ranks(&mut aggregates);

        for aggregate in &mut aggregates {
            aggregate.last_updated = now;

            let lock = get_scope_lock(&aggregate.asset_id, period, scope).await;
            let _guard = lock.lock().await;

            let mut sql_tx = self.pool.begin().await?;
            store::update_ranks(&mut sql_tx, aggregate).await?;
            sql_tx.commit().await?;
        }

        debug!(
            scope = %scope,
            aggregates = aggregates.len(),
            "Ranked scope"
        );

        Ok(aggregates.len())
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
