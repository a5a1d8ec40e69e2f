//! Fixed-point decimal types for prices and quantities
//!
//! Uses rust_decimal for deterministic arithmetic (no floating-point errors).
//! `Price` is strictly positive; `Quantity` is non-negative so that it can
//! also describe a fully consumed lot or a closed trade's remainder.

use crate::errors::FillError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Add;
use std::str::FromStr;

/// Execution price, always > 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Price(Decimal);

impl Price {
    /// Try to create a price, returning None unless `value > 0`
    pub fn try_new(value: Decimal) -> Option<Self> {
        if value > Decimal::ZERO {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Create a price from a whole number
    ///
    /// # Panics
    /// Panics if `value` is zero
    pub fn from_u64(value: u64) -> Self {
        assert!(value > 0, "Price must be positive");
        Self(Decimal::from(value))
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// Quantity-weighted average of two price/quantity pairs.
    ///
    /// Falls back to `next` when the previous quantity is zero. `None` when
    /// the notionals do not fit in a `Decimal`.
    pub fn weighted_average(
        prev: Price,
        prev_qty: Quantity,
        next: Price,
        next_qty: Quantity,
    ) -> Option<Price> {
        if prev_qty.is_zero() {
            return Some(next);
        }
        let total = prev_qty.0.checked_add(next_qty.0)?;
        let notional = prev.0.checked_mul(prev_qty.0)?.checked_add(next.0.checked_mul(next_qty.0)?)?;
        // Both inputs are positive, so the mean is too
        notional.checked_div(total).and_then(Price::try_new)
    }
}

impl TryFrom<Decimal> for Price {
    type Error = FillError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::try_new(value).ok_or_else(|| FillError::InvalidPrice(value.to_string()))
    }
}

impl From<Price> for Decimal {
    fn from(price: Price) -> Self {
        price.0
    }
}

impl FromStr for Price {
    type Err = FillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = Decimal::from_str(s.trim())
            .map_err(|_| FillError::InvalidPrice(s.to_string()))?;
        Self::try_from(value)
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lot or fill size, always >= 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Quantity(Decimal);

impl Quantity {
    pub fn zero() -> Self {
        Self(Decimal::ZERO)
    }

    /// Try to create a quantity, returning None for negative values
    pub fn try_new(value: Decimal) -> Option<Self> {
        if value >= Decimal::ZERO {
            Some(Self(value))
        } else {
            None
        }
    }

    pub fn from_u64(value: u64) -> Self {
        Self(Decimal::from(value))
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Add, returning None on overflow
    pub fn checked_add(self, other: Quantity) -> Option<Quantity> {
        self.0.checked_add(other.0).map(Quantity)
    }

    /// Subtract, returning None if the result would be negative
    pub fn checked_sub(self, other: Quantity) -> Option<Quantity> {
        Self::try_new(self.0 - other.0)
    }

    /// Subtract, clamping at zero
    pub fn saturating_sub(self, other: Quantity) -> Quantity {
        self.checked_sub(other).unwrap_or_else(Quantity::zero)
    }
}

impl Add for Quantity {
    type Output = Quantity;

    fn add(self, rhs: Quantity) -> Quantity {
        Quantity(self.0 + rhs.0)
    }
}

impl std::iter::Sum for Quantity {
    fn sum<I: Iterator<Item = Quantity>>(iter: I) -> Self {
        iter.fold(Quantity::zero(), |acc, q| acc + q)
    }
}

impl TryFrom<Decimal> for Quantity {
    type Error = FillError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::try_new(value).ok_or_else(|| FillError::InvalidQuantity(value.to_string()))
    }
}

impl From<Quantity> for Decimal {
    fn from(quantity: Quantity) -> Self {
        quantity.0
    }
}

impl FromStr for Quantity {
    type Err = FillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = Decimal::from_str(s.trim())
            .map_err(|_| FillError::InvalidQuantity(s.to_string()))?;
        Self::try_from(value)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
