use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const MAX_CURRENCY_LEN: usize = 10;

/// Asset class of the instrument a transaction touched.
///
/// Encoded as an integer on the wire and as a lowercase string in the
/// database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AssetKind {
    Share,
    Bond,
    Crypto,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown asset kind code {0}, expected 1 (share), 2 (bond) or 3 (crypto)")]
pub struct InvalidAssetKindError(pub u8);

impl TryFrom<u8> for AssetKind {
    type Error = InvalidAssetKindError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Self::Share),
            2 => Ok(Self::Bond),
            3 => Ok(Self::Crypto),
            other => Err(InvalidAssetKindError(other)),
        }
    }
}

impl From<AssetKind> for u8 {
    fn from(kind: AssetKind) -> Self {
        match kind {
            AssetKind::Share => 1,
            AssetKind::Bond => 2,
            AssetKind::Crypto => 3,
        }
    }
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Share => "share",
            Self::Bond => "bond",
            Self::Crypto => "crypto",
        }
    }
}

impl std::str::FromStr for AssetKind {
    type Err = ParseAssetKindError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "share" => Ok(Self::Share),
            "bond" => Ok(Self::Bond),
            "crypto" => Ok(Self::Crypto),
            other => Err(ParseAssetKindError(other.to_string())),
        }
    }
}

impl std::fmt::Display for AssetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown asset kind '{0}'")]
pub struct ParseAssetKindError(pub String);

/// Direction of a portfolio transaction, integer-coded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum TransactionKind {
    Buy,
    Sell,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown transaction kind code {0}, expected 1 (buy) or 2 (sell)")]
pub struct InvalidTransactionKindError(pub u8);

impl TryFrom<u8> for TransactionKind {
    type Error = InvalidTransactionKindError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Self::Buy),
            2 => Ok(Self::Sell),
            other => Err(InvalidTransactionKindError(other)),
        }
    }
}

impl From<TransactionKind> for u8 {
    fn from(kind: TransactionKind) -> Self {
        match kind {
            TransactionKind::Buy => 1,
            TransactionKind::Sell => 2,
        }
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// One completed portfolio transaction as carried on the bus.
///
/// This is the payload written into the outbox by transaction producers and
/// decoded by the rating consumer. Field names follow the platform-wide JSON
/// convention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEvent {
    pub id: Uuid,
    pub portfolio_id: Uuid,
    pub stock_card_id: Uuid,
    pub asset_type: AssetKind,
    pub transaction_type: TransactionKind,
    pub quantity: i64,
    pub price_per_unit: Decimal,
    pub total_amount: Decimal,
    pub transaction_time: DateTime<Utc>,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
}

/// Why an inbound payload could not be turned into a usable event.
///
/// The variant name doubles as the `error-type` header on dead-lettered
/// messages.
#[derive(Debug, thiserror::Error)]
pub enum EventDecodeError {
    #[error("Malformed transaction payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Invalid(#[from] InvalidEventError),
}

impl EventDecodeError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Json(_) => "deserialization",
            Self::Invalid(_) => "validation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidEventError {
    #[error("Transaction {id} has non-positive quantity {quantity}")]
    NonPositiveQuantity { id: Uuid, quantity: i64 },
    #[error("Transaction {id} has non-positive price per unit {price}")]
    NonPositivePrice { id: Uuid, price: Decimal },
    #[error("Transaction {id} has negative total amount {amount}")]
    NegativeAmount { id: Uuid, amount: Decimal },
    #[error("Transaction {id} has an empty currency code")]
    EmptyCurrency { id: Uuid },
    #[error("Transaction {id} currency code exceeds {MAX_CURRENCY_LEN} characters")]
    CurrencyTooLong { id: Uuid },
}

impl TransactionEvent {
    /// Parse and validate a JSON payload from the bus.
    pub fn decode(payload: &str) -> Result<Self, EventDecodeError> {
        let event: Self = serde_json::from_str(payload)?;
        event.validate()?;
        Ok(event)
    }

    pub fn validate(&self) -> Result<(), InvalidEventError> {
        if self.quantity <= 0 {
            return Err(InvalidEventError::NonPositiveQuantity {
                id: self.id,
                quantity: self.quantity,
            });
        }
        if self.price_per_unit <= Decimal::ZERO {
            return Err(InvalidEventError::NonPositivePrice {
                id: self.id,
                price: self.price_per_unit,
            });
        }
        if self.total_amount < Decimal::ZERO {
            return Err(InvalidEventError::NegativeAmount {
                id: self.id,
                amount: self.total_amount,
            });
        }
        if self.currency.is_empty() {
            return Err(InvalidEventError::EmptyCurrency { id: self.id });
        }
        if self.currency.len() > MAX_CURRENCY_LEN {
            return Err(InvalidEventError::CurrencyTooLong { id: self.id });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_json() -> String {
        r#"{
            "id": "6f9a2f64-1c3e-4b7a-9d2e-5a8c1b3d4e5f",
            "portfolioId": "11111111-2222-3333-4444-555555555555",
            "stockCardId": "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee",
            "assetType": 1,
            "transactionType": 2,
            "quantity": 3,
            "pricePerUnit": "120.50",
            "totalAmount": "361.50",
            "transactionTime": "2026-03-15T10:30:00Z",
            "currency": "RUB"
        }"#
        .to_string()
    }

    #[test]
    fn decodes_camel_case_payload() {
        let event = TransactionEvent::decode(&sample_json()).unwrap();

        assert_eq!(event.asset_type, AssetKind::Share);
        assert_eq!(event.transaction_type, TransactionKind::Sell);
        assert_eq!(event.quantity, 3);
        assert_eq!(event.price_per_unit, dec!(120.50));
        assert_eq!(event.total_amount, dec!(361.50));
        assert_eq!(event.currency, "RUB");
        assert_eq!(event.metadata, None);
    }

    #[test]
    fn round_trips_through_json() {
        let event = TransactionEvent::decode(&sample_json()).unwrap();
        let encoded = serde_json::to_string(&event).unwrap();

        assert!(encoded.contains("\"portfolioId\""));
        assert!(encoded.contains("\"transactionType\":2"));
        assert!(!encoded.contains("metadata"));

        let decoded = TransactionEvent::decode(&encoded).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn rejects_unknown_enum_codes() {
        let payload = sample_json().replace("\"assetType\": 1", "\"assetType\": 9");
        let err = TransactionEvent::decode(&payload).unwrap_err();

        assert_eq!(err.kind(), "deserialization");
    }

    #[test]
    fn rejects_non_positive_quantity() {
        let payload = sample_json().replace("\"quantity\": 3", "\"quantity\": 0");
        let err = TransactionEvent::decode(&payload).unwrap_err();

        assert_eq!(err.kind(), "validation");
        assert!(matches!(
            err,
            EventDecodeError::Invalid(InvalidEventError::NonPositiveQuantity { quantity: 0, .. })
        ));
    }

    #[test]
    fn rejects_overlong_currency() {
        let payload = sample_json().replace("\"RUB\"", "\"MUCHTOOLONGCODE\"");
        let err = TransactionEvent::decode(&payload).unwrap_err();

        assert!(matches!(
            err,
            EventDecodeError::Invalid(InvalidEventError::CurrencyTooLong { .. })
        ));
    }

    #[test]
    fn asset_kind_string_forms_round_trip() {
        for kind in [AssetKind::Share, AssetKind::Bond, AssetKind::Crypto] {
            assert_eq!(kind.as_str().parse::<AssetKind>().unwrap(), kind);
        }
        assert!("equity".parse::<AssetKind>().is_err());
    }
}
