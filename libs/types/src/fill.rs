//! Brokerage execution records
//!
//! A `Fill` is immutable once accepted. The engine orders fills of one
//! position key by `(timestamp, sequence)`.

use crate::errors::FillError;
use crate::ids::{FillId, OwnerId, PositionKey, Symbol};
use crate::numeric::{Price, Quantity};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Execution side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    /// Buy execution (opens or extends a long, reduces a short)
    BUY,
    /// Sell execution (opens or extends a short, reduces a long)
    SELL,
}

impl Side {
    /// Get the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            Side::BUY => Side::SELL,
            Side::SELL => Side::BUY,
        }
    }

    /// Parse a broker side label.
    ///
    /// Accepts `BUY`/`B` and `SELL`/`S`/`SHORT`, case-insensitive.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_uppercase().as_str() {
            "BUY" | "B" => Some(Side::BUY),
            "SELL" | "S" | "SHORT" => Some(Side::SELL),
            _ => None,
        }
    }
}

/// Ordering key of a fill within its position key
pub type FillOrder = (i64, u64);

/// Immutable execution record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fill {
    pub id: FillId,
    pub owner_id: OwnerId,
    pub symbol: Symbol,
    pub side: Side,
    pub price: Price,
    pub quantity: Quantity,
    pub commission: Decimal,
    pub timestamp: i64, // Unix nanos
    pub sequence: u64,
}

impl Fill {
    /// Build a validated fill from raw decimals
    #[allow(clippy::too_many_arguments)]
    pub fn try_new(
        id: FillId,
        owner_id: OwnerId,
        symbol: Symbol,
        side: Side,
        price: Decimal,
        quantity: Decimal,
        commission: Decimal,
        timestamp: i64,
        sequence: u64,
    ) -> Result<Self, FillError> {
        let price = Price::try_from(price)?;
        let quantity = Quantity::try_from(quantity)?;
        let fill = Self {
            id,
            owner_id,
            symbol,
            side,
            price,
            quantity,
            commission,
            timestamp,
            sequence,
        };
        fill.validate()?;
        Ok(fill)
    }

    /// Check the preconditions the numeric newtypes cannot express alone.
    pub fn validate(&self) -> Result<(), FillError> {
        if self.id.as_str().trim().is_empty() {
            return Err(FillError::MissingField { field: "id" });
        }
        if self.owner_id.as_str().trim().is_empty() {
            return Err(FillError::MissingField { field: "owner_id" });
        }
        if self.quantity.is_zero() {
            return Err(FillError::InvalidQuantity(self.quantity.to_string()));
        }
        if self.commission < Decimal::ZERO {
            return Err(FillError::InvalidCommission(self.commission.to_string()));
        }
        if self.notional().is_none() {
            return Err(FillError::Overflow(format!(
                "notional of {} x {}",
                self.price, self.quantity
            )));
        }
        Ok(())
    }

    /// `price * quantity`, `None` when it does not fit in a `Decimal`
    pub fn notional(&self) -> Option<Decimal> {
        self.price.as_decimal().checked_mul(self.quantity.as_decimal())
    }

    pub fn order_key(&self) -> FillOrder {
        (self.timestamp, self.sequence)
    }

    pub fn position_key(&self) -> PositionKey {
        PositionKey::new(self.owner_id.clone(), self.symbol.clone())
    }

    pub fn executed_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(quantity: &str, commission: &str) -> Result<Fill, FillError> {
        Fill::try_new(
            FillId::new("f-1"),
            OwnerId::new("alice"),
            Symbol::new("AAPL"),
            Side::BUY,
            Decimal::from(10),
            quantity.parse().unwrap(),
            commission.parse().unwrap(),
            1_000,
            0,
        )
    }

    #[test]
    fn test_valid_fill() {
        let fill = build("100", "1.5").unwrap();
        assert_eq!(fill.quantity, Quantity::from_u64(100));
        assert_eq!(fill.order_key(), (1_000, 0));
    }

    #[test]
    fn test_rejects_zero_and_negative_quantity() {
        assert!(matches!(build("0", "0"), Err(FillError::InvalidQuantity(_))));
        assert!(matches!(build("-5", "0"), Err(FillError::InvalidQuantity(_))));
    }

    #[test]
    fn test_rejects_unrepresentable_notional() {
        let err = Fill::try_new(
            FillId::new("f-1"),
            OwnerId::new("alice"),
            Symbol::new("AAPL"),
            Side::BUY,
            "40000000000000000000000000000".parse().unwrap(),
            Decimal::from(2),
            Decimal::ZERO,
            1_000,
            0,
        )
        .unwrap_err();
        assert!(matches!(err, FillError::Overflow(_)));
        assert_eq!(build("100", "0").unwrap().notional(), Some(Decimal::from(1_000)));
    }

    #[test]
    fn test_rejects_negative_commission() {
        assert!(matches!(build("1", "-0.01"), Err(FillError::InvalidCommission(_))));
    }

    #[test]
    fn test_rejects_blank_id() {
        let err = Fill::try_new(
            FillId::new(" "),
            OwnerId::new("alice"),
            Symbol::new("AAPL"),
            Side::SELL,
            Decimal::ONE,
            Decimal::ONE,
            Decimal::ZERO,
            0,
            0,
        )
        .unwrap_err();
        assert_eq!(err, FillError::MissingField { field: "id" });
    }

    #[test]
    fn test_side_labels() {
        assert_eq!(Side::from_label("b"), Some(Side::BUY));
        assert_eq!(Side::from_label(" Buy "), Some(Side::BUY));
        assert_eq!(Side::from_label("SHORT"), Some(Side::SELL));
        assert_eq!(Side::from_label("s"), Some(Side::SELL));
        assert_eq!(Side::from_label("cover"), None);
        assert_eq!(Side::BUY.opposite(), Side::SELL);
    }

    #[test]
    fn test_executed_at() {
        let fill = build("1", "0").unwrap();
        assert_eq!(fill.executed_at().timestamp_nanos_opt(), Some(1_000));
    }
}
