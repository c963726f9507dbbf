//! Shared test fixtures: database setup and builders for transaction
//! events and rating aggregates.

use chrono::{DateTime, TimeZone, Utc};
use folio_bus::Topic;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::event::{AssetKind, TransactionEvent, TransactionKind};

/// Centralized test database setup to eliminate duplication across test
/// files. Creates an in-memory SQLite database with all migrations applied.
pub(crate) async fn setup_test_db() -> SqlitePool {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    sqlx::migrate!().run(&pool).await.unwrap();
    pool
}

/// The topic production wiring publishes transaction events on.
pub(crate) fn transactions_topic() -> Topic {
    Topic::new("portfolio.transactions").unwrap()
}

/// A deterministic instant inside the test window, away from any midnight
/// boundary.
pub(crate) fn test_clock() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap()
}

/// Builder for transaction event test instances with sensible defaults.
/// `total_amount` is derived from price and quantity unless set explicitly.
pub(crate) struct TransactionEventBuilder {
    event: TransactionEvent,
    total_amount: Option<Decimal>,
}

impl Default for TransactionEventBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionEventBuilder {
    pub(crate) fn new() -> Self {
        Self {
            event: TransactionEvent {
                id: Uuid::new_v4(),
                portfolio_id: Uuid::new_v4(),
                stock_card_id: Uuid::new_v4(),
                asset_type: AssetKind::Share,
                transaction_type: TransactionKind::Buy,
                quantity: 10,
                price_per_unit: dec!(100),
                total_amount: Decimal::ZERO,
                transaction_time: test_clock(),
                currency: "RUB".to_string(),
                metadata: None,
            },
            total_amount: None,
        }
    }

    #[must_use]
    pub(crate) fn with_id(mut self, id: Uuid) -> Self {
        self.event.id = id;
        self
    }

    #[must_use]
    pub(crate) fn with_portfolio(mut self, portfolio_id: Uuid) -> Self {
        self.event.portfolio_id = portfolio_id;
        self
    }

    #[must_use]
    pub(crate) fn with_asset(mut self, stock_card_id: Uuid) -> Self {
        self.event.stock_card_id = stock_card_id;
        self
    }

    #[must_use]
    pub(crate) fn with_asset_type(mut self, asset_type: AssetKind) -> Self {
        self.event.asset_type = asset_type;
        self
    }

    #[must_use]
    pub(crate) fn with_transaction_type(mut self, transaction_type: TransactionKind) -> Self {
        self.event.transaction_type = transaction_type;
        self
    }

    #[must_use]
    pub(crate) fn with_quantity(mut self, quantity: i64) -> Self {
        self.event.quantity = quantity;
        self
    }

    #[must_use]
    pub(crate) fn with_price(mut self, price: Decimal) -> Self {
        self.event.price_per_unit = price;
        self
    }

    #[must_use]
    pub(crate) fn with_total_amount(mut self, total: Decimal) -> Self {
        self.total_amount = Some(total);
        self
    }

    #[must_use]
    pub(crate) fn with_time(mut self, at: DateTime<Utc>) -> Self {
        self.event.transaction_time = at;
        self
    }

    pub(crate) fn build(mut self) -> TransactionEvent {
        self.event.total_amount = self
            .total_amount
            .unwrap_or_else(|| self.event.price_per_unit * Decimal::from(self.event.quantity));
        self.event
    }
}
