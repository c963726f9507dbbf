//! Pure aggregate math. No IO here, everything is deterministic and
//! directly unit-testable.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::RatingValidationError;
use crate::event::{TransactionEvent, TransactionKind};
use crate::period::Period;
use crate::rating::{AssetMeta, RatingAggregate, RatingScope};

impl RatingAggregate {
    /// Folds a batch of one asset's transactions into a fresh aggregate.
    ///
    /// The caller is responsible for grouping: every event in `events` must
    /// belong to the same asset and already match the window and scope.
    /// Ranks stay at the placeholder until the scope is re-ranked.
    pub fn from_batch(
        asset_id: Uuid,
        meta: AssetMeta,
        period: Period,
        scope: RatingScope,
        events: &[TransactionEvent],
        now: DateTime<Utc>,
    ) -> Result<Self, RatingValidationError> {
        let mut aggregate = Self::new(asset_id, meta, period, scope, now)?;

        for event in events {
            match event.transaction_type {
                TransactionKind::Buy => {
                    aggregate.buy_count += 1;
                    aggregate.total_buy_amount += event.total_amount;
                    aggregate.total_buy_quantity += event.quantity;
                }
                TransactionKind::Sell => {
                    aggregate.sell_count += 1;
                    aggregate.total_sell_amount += event.total_amount;
                    aggregate.total_sell_quantity += event.quantity;
                }
            }
        }

        Ok(aggregate)
    }

    /// Folds one streamed transaction into an existing aggregate.
    ///
    /// Exactly one direction is touched: its count gains one and its amount
    /// gains the event's total. Quantities accumulate when an aggregate is
    /// built from history, not on the streaming path.
    pub fn apply_increment(&mut self, event: &TransactionEvent, now: DateTime<Utc>) {
        match event.transaction_type {
            TransactionKind::Buy => {
                self.buy_count += 1;
                self.total_buy_amount += event.total_amount;
            }
            TransactionKind::Sell => {
                self.sell_count += 1;
                self.total_sell_amount += event.total_amount;
            }
        }
        self.last_updated = now;
    }
}

/// Assigns both rankings across one scope.
///
/// Count ranks order by combined transaction count descending, amount ranks
/// by combined turnover descending. Ties break on ascending asset id, so
/// each ranking is a permutation of `1..=n` and repeated runs over the same
/// data produce identical ranks.
pub fn assign_ranks(aggregates: &mut [RatingAggregate]) {
    let mut by_count: Vec<usize> = (0..aggregates.len()).collect();
    by_count.sort_by(|&a, &b| {
        let lhs = &aggregates[a];
        let rhs = &aggregates[b];
        rhs.transaction_count()
            .cmp(&lhs.transaction_count())
            .then_with(|| lhs.asset_id.cmp(&rhs.asset_id))
    });

    let mut rank: i64 = 1;
    for idx in by_count {
        aggregates[idx].count_rank = rank;
        rank += 1;
    }

    let mut by_amount: Vec<usize> = (0..aggregates.len()).collect();
    by_amount.sort_by(|&a, &b| {
        let lhs = &aggregates[a];
        let rhs = &aggregates[b];
        rhs.transaction_amount()
            .cmp(&lhs.transaction_amount())
            .then_with(|| lhs.asset_id.cmp(&rhs.asset_id))
    });

    let mut rank: i64 = 1;
    for idx in by_amount {
        aggregates[idx].amount_rank = rank;
        rank += 1;
    }
}
