//! Rating aggregates: per-asset transaction popularity over a time window.
//!
//! One aggregate row exists per (asset, window, scope). The consumer keeps
//! rows fresh incrementally, the reconciliation job re-ranks whole scopes.

pub mod calc;
pub(crate) mod lock;
pub mod rebuild;
pub mod store;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::RatingValidationError;
use crate::event::AssetKind;
use crate::period::Period;

pub const MAX_TICKER_LEN: usize = 20;
pub const MAX_NAME_LEN: usize = 255;

/// Whether an aggregate counts activity platform-wide or within one
/// portfolio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisContext {
    Global,
    Portfolio,
}

impl AnalysisContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Portfolio => "portfolio",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown analysis context '{0}'")]
pub struct ParseAnalysisContextError(pub String);

impl std::str::FromStr for AnalysisContext {
    type Err = ParseAnalysisContextError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "global" => Ok(Self::Global),
            "portfolio" => Ok(Self::Portfolio),
            other => Err(ParseAnalysisContextError(other.to_string())),
        }
    }
}

impl std::fmt::Display for AnalysisContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The ranking scope an aggregate belongs to.
///
/// A portfolio id travels with the scope itself, so a global aggregate
/// cannot carry one and a portfolio aggregate cannot lack one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RatingScope {
    Global,
    Portfolio(Uuid),
}

impl RatingScope {
    /// Reassemble a scope from its stored column pair, rejecting
    /// combinations the schema cannot represent in one variant.
    pub fn from_parts(
        context: AnalysisContext,
        portfolio_id: Option<Uuid>,
    ) -> Result<Self, RatingValidationError> {
        match (context, portfolio_id) {
            (AnalysisContext::Global, None) => Ok(Self::Global),
            (AnalysisContext::Global, Some(_)) => Err(RatingValidationError::PortfolioForbidden),
            (AnalysisContext::Portfolio, Some(id)) => Ok(Self::Portfolio(id)),
            (AnalysisContext::Portfolio, None) => Err(RatingValidationError::PortfolioRequired),
        }
    }

    pub fn context(&self) -> AnalysisContext {
        match self {
            Self::Global => AnalysisContext::Global,
            Self::Portfolio(_) => AnalysisContext::Portfolio,
        }
    }

    pub fn portfolio_id(&self) -> Option<Uuid> {
        match self {
            Self::Global => None,
            Self::Portfolio(id) => Some(*id),
        }
    }
}

impl std::fmt::Display for RatingScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::Portfolio(id) => write!(f, "portfolio:{id}"),
        }
    }
}

/// Descriptive fields of the instrument an aggregate tracks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetMeta {
    pub asset_type: AssetKind,
    pub ticker: String,
    pub name: String,
}

impl AssetMeta {
    pub fn new(
        asset_type: AssetKind,
        ticker: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self, RatingValidationError> {
        let meta = Self {
            asset_type,
            ticker: ticker.into(),
            name: name.into(),
        };
        meta.validate()?;
        Ok(meta)
    }

    /// Placeholder identity used when an aggregate is seeded from a bus
    /// event, which carries no instrument catalog data. A later rebuild from
    /// an enriched source replaces it.
    pub fn placeholder(asset_id: Uuid, asset_type: AssetKind) -> Self {
        let hex = asset_id.simple().to_string();
        Self {
            asset_type,
            ticker: format!("STOCK_{}", &hex[..8]),
            name: format!("Asset {asset_id}"),
        }
    }

    fn validate(&self) -> Result<(), RatingValidationError> {
        if self.ticker.is_empty() {
            return Err(RatingValidationError::EmptyTicker);
        }
        if self.ticker.len() > MAX_TICKER_LEN {
            return Err(RatingValidationError::TickerTooLong {
                len: self.ticker.len(),
                max: MAX_TICKER_LEN,
            });
        }
        if self.name.is_empty() {
            return Err(RatingValidationError::EmptyName);
        }
        if self.name.len() > MAX_NAME_LEN {
            return Err(RatingValidationError::NameTooLong {
                len: self.name.len(),
                max: MAX_NAME_LEN,
            });
        }
        Ok(())
    }
}

/// Transaction popularity of one asset within one window and scope.
#[derive(Debug, Clone, PartialEq)]
pub struct RatingAggregate {
    pub asset_id: Uuid,
    pub asset_type: AssetKind,
    pub ticker: String,
    pub name: String,
    pub period: Period,
    pub scope: RatingScope,
    pub buy_count: i64,
    pub sell_count: i64,
    pub total_buy_amount: Decimal,
    pub total_sell_amount: Decimal,
    pub total_buy_quantity: i64,
    pub total_sell_quantity: i64,
    pub count_rank: i64,
    pub amount_rank: i64,
    pub last_updated: DateTime<Utc>,
}

impl RatingAggregate {
    /// An empty aggregate with placeholder rank 1. Real ranks arrive with
    /// the next reconciliation run over the scope.
    pub fn new(
        asset_id: Uuid,
        meta: AssetMeta,
        period: Period,
        scope: RatingScope,
        now: DateTime<Utc>,
    ) -> Result<Self, RatingValidationError> {
        meta.validate()?;

        Ok(Self {
            asset_id,
            asset_type: meta.asset_type,
            ticker: meta.ticker,
            name: meta.name,
            period,
            scope,
            buy_count: 0,
            sell_count: 0,
            total_buy_amount: Decimal::ZERO,
            total_sell_amount: Decimal::ZERO,
            total_buy_quantity: 0,
            total_sell_quantity: 0,
            count_rank: 1,
            amount_rank: 1,
            last_updated: now,
        })
    }

    /// Combined buy and sell count, the key of the count ranking.
    pub fn transaction_count(&self) -> i64 {
        self.buy_count + self.sell_count
    }

    /// Combined buy and sell turnover, the key of the amount ranking.
    pub fn transaction_amount(&self) -> Decimal {
        self.total_buy_amount + self.total_sell_amount
    }

    /// Checks the numeric invariants every stored row must satisfy.
    pub fn ensure_invariants(&self) -> Result<(), RatingValidationError> {
        for (field, value) in [
            ("buy_count", self.buy_count),
            ("sell_count", self.sell_count),
            ("total_buy_quantity", self.total_buy_quantity),
            ("total_sell_quantity", self.total_sell_quantity),
        ] {
            if value < 0 {
                return Err(RatingValidationError::NegativeCounter { field, value });
            }
        }

        for (field, value) in [
            ("count_rank", self.count_rank),
            ("amount_rank", self.amount_rank),
        ] {
            if value <= 0 {
                return Err(RatingValidationError::NonPositiveRank { field, value });
            }
        }

        Ok(())
    }
}
