//! Domain-specific error types, one enum per pipeline concern.
//! Keeps database failures, validation failures, and bus failures apart.

use crate::event::ParseAssetKindError;
use crate::period::InvalidPeriodError;

/// Failures while writing to or draining the transactional outbox.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Failed to serialize event payload: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Outbox row {id} carries unknown status '{status}'")]
    UnknownStatus { id: i64, status: String },
}

/// Failures in the rating aggregate store and calculation paths.
#[derive(Debug, thiserror::Error)]
pub enum RatingError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Validation(#[from] RatingValidationError),
    #[error(transparent)]
    Period(#[from] InvalidPeriodError),
    #[error("Stored asset id is not a UUID: {0}")]
    AssetId(#[from] uuid::Error),
    #[error("Stored amount is not a decimal: {0}")]
    Amount(#[from] rust_decimal::Error),
    #[error(transparent)]
    AssetKind(#[from] ParseAssetKindError),
    #[error(transparent)]
    Context(#[from] crate::rating::ParseAnalysisContextError),
}

/// Violations of the aggregate's structural invariants.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RatingValidationError {
    #[error("Portfolio-scoped rating requires a portfolio id")]
    PortfolioRequired,
    #[error("Global rating must not carry a portfolio id")]
    PortfolioForbidden,
    #[error("Ticker must not be empty")]
    EmptyTicker,
    #[error("Ticker exceeds {max} characters: {len}")]
    TickerTooLong { len: usize, max: usize },
    #[error("Asset name must not be empty")]
    EmptyName,
    #[error("Asset name exceeds {max} characters: {len}")]
    NameTooLong { len: usize, max: usize },
    #[error("{field} must not be negative, got {value}")]
    NegativeCounter { field: &'static str, value: i64 },
    #[error("{field} must be positive, got {value}")]
    NonPositiveRank { field: &'static str, value: i64 },
}

/// Failures in the transaction consumer loop.
///
/// Any error returned from the loop makes the supervisor resubscribe at the
/// last committed offset, so the failed delivery is seen again.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Rating(#[from] RatingError),
    #[error("Event stream error: {0}")]
    Stream(#[from] folio_bus::StreamError),
    #[error("Failed to dead-letter message at offset {offset}: {source}")]
    DeadLetter {
        offset: u64,
        #[source]
        source: folio_bus::PublishError,
    },
}

/// Failures during a reconciliation run.
#[derive(Debug, thiserror::Error)]
pub enum ReconciliationError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Rating(#[from] RatingError),
}

/// Failures while rebuilding a scope from raw transaction history.
#[derive(Debug, thiserror::Error)]
pub enum RebuildError {
    #[error("Transaction source error: {0}")]
    Source(String),
    #[error(transparent)]
    Rating(#[from] RatingError),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Failures while loading or applying service configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid transactions topic: {0}")]
    Topic(#[from] folio_bus::InvalidTopicError),
}
