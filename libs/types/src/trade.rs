//! Derived round-trip trade records
//!
//! A `Trade` aggregates the fills of one continuous directional position,
//! from the fill that opens it until the fill that brings it back to zero.

use crate::errors::{FillError, LedgerError};
use crate::fill::{Fill, Side};
use crate::ids::{FillId, OwnerId, Symbol, TradeId};
use crate::numeric::{Price, Quantity};
use crate::position::PositionSide;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Trade status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    /// Position still has open lots
    OPEN,
    /// Remaining quantity reached zero (terminal)
    CLOSED,
}

/// Round-trip trade record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub owner_id: OwnerId,
    pub symbol: Symbol,
    pub status: TradeStatus,
    /// Side of the initiating fill (BUY = long, SELL = short)
    pub side: Side,
    pub open_date: i64,          // Unix nanos
    pub close_date: Option<i64>, // Unix nanos, None while OPEN
    pub open_price: Price,
    pub close_price: Option<Price>,
    /// Total quantity entered
    pub quantity: Quantity,
    pub remaining_quantity: Quantity,
    /// Realized P&L of the closed portion, commission not deducted
    pub pnl: Decimal,
    pub commission: Decimal,
    pub fills: Vec<FillId>,
}

impl Trade {
    /// Open a trade from the entry portion of `fill`.
    ///
    /// `quantity` and `commission` may be smaller than the fill's own
    /// values when the fill flips an existing position.
    pub fn open(fill: &Fill, quantity: Quantity, commission: Decimal) -> Self {
        Self {
            id: TradeId::derive(&fill.owner_id, &fill.symbol, &fill.id),
            owner_id: fill.owner_id.clone(),
            symbol: fill.symbol.clone(),
            status: TradeStatus::OPEN,
            side: fill.side,
            open_date: fill.timestamp,
            close_date: None,
            open_price: fill.price,
            close_price: None,
            quantity,
            remaining_quantity: quantity,
            pnl: Decimal::ZERO,
            commission,
            fills: vec![fill.id.clone()],
        }
    }

    /// Add an entry in the trade's own direction.
    ///
    /// Leaves the trade untouched when any new total does not fit.
    pub fn extend(
        &mut self,
        fill_id: &FillId,
        price: Price,
        quantity: Quantity,
        commission: Decimal,
    ) -> Result<(), FillError> {
        let overflow = || FillError::Overflow(format!("extending trade {} by fill {}", self.id, fill_id));
        let open_price =
            Price::weighted_average(self.open_price, self.quantity, price, quantity).ok_or_else(overflow)?;
        let total = self.quantity.checked_add(quantity).ok_or_else(overflow)?;
        let remaining = self.remaining_quantity.checked_add(quantity).ok_or_else(overflow)?;
        let fees = self.commission.checked_add(commission).ok_or_else(overflow)?;
        self.pnl.checked_sub(fees).ok_or_else(overflow)?;

        self.open_price = open_price;
        self.quantity = total;
        self.remaining_quantity = remaining;
        self.commission = fees;
        self.attach_fill(fill_id);
        Ok(())
    }

    /// Record an exit of `quantity` at `price` realizing `realized`.
    ///
    /// The caller never closes more than `remaining_quantity`; any excess is
    /// clamped. Leaves the trade untouched when any new total does not fit.
    pub fn record_close(
        &mut self,
        fill_id: &FillId,
        price: Price,
        quantity: Quantity,
        realized: Decimal,
        commission: Decimal,
        timestamp: i64,
    ) -> Result<(), FillError> {
        let overflow = || FillError::Overflow(format!("closing trade {} with fill {}", self.id, fill_id));
        let close_price = match self.close_price {
            Some(prev) => {
                Price::weighted_average(prev, self.closed_quantity(), price, quantity).ok_or_else(overflow)?
            }
            None => price,
        };
        let pnl = self.pnl.checked_add(realized).ok_or_else(overflow)?;
        let fees = self.commission.checked_add(commission).ok_or_else(overflow)?;
        pnl.checked_sub(fees).ok_or_else(overflow)?;

        self.close_price = Some(close_price);
        self.remaining_quantity = self.remaining_quantity.saturating_sub(quantity);
        self.pnl = pnl;
        self.commission = fees;
        self.attach_fill(fill_id);

        if self.remaining_quantity.is_zero() {
            self.status = TradeStatus::CLOSED;
            self.close_date = Some(timestamp);
        }
        Ok(())
    }

    fn attach_fill(&mut self, fill_id: &FillId) {
        if self.fills.last() != Some(fill_id) {
            self.fills.push(fill_id.clone());
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::OPEN
    }

    pub fn position_side(&self) -> PositionSide {
        PositionSide::from_side(self.side)
    }

    pub fn closed_quantity(&self) -> Quantity {
        self.quantity.saturating_sub(self.remaining_quantity)
    }

    /// Realized P&L net of attributed commission
    pub fn net_pnl(&self) -> Decimal {
        self.pnl.saturating_sub(self.commission)
    }

    /// Verify the quantity and status bookkeeping
    pub fn check_invariants(&self) -> Result<(), LedgerError> {
        let violation = |reason: String| LedgerError::InvariantViolation {
            key: format!("{}/{} trade {}", self.owner_id, self.symbol, self.id),
            reason,
        };

        if self.remaining_quantity > self.quantity {
            return Err(violation(format!(
                "remaining {} exceeds entered {}",
                self.remaining_quantity, self.quantity
            )));
        }
        let closed = self.remaining_quantity.is_zero();
        if closed != (self.status == TradeStatus::CLOSED) {
            return Err(violation(format!(
                "status {:?} with remaining {}",
                self.status, self.remaining_quantity
            )));
        }
        if closed != self.close_date.is_some() {
            return Err(violation("close date out of step with status".to_string()));
        }
        if self.closed_quantity().is_zero() && (self.close_price.is_some() || !self.pnl.is_zero()) {
            return Err(violation("exit recorded without closed quantity".to_string()));
        }
        Ok(())
    }
}

/// What a fill did to its trade(s)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationKind {
    Opened,
    Extended,
    PartiallyClosed,
    Closed,
    ClosedAndFlipped,
}

/// Result of applying one fill
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    /// Trade the fill opened, extended or reduced
    pub trade_id: TradeId,
    pub kind: MutationKind,
    /// Trade opened by the excess quantity of a flip
    pub flipped_into: Option<TradeId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(id: &str, side: Side, price: u64, qty: u64, ts: i64) -> Fill {
        Fill::try_new(
            FillId::new(id),
            OwnerId::new("alice"),
            Symbol::new("AAPL"),
            side,
            Decimal::from(price),
            Decimal::from(qty),
            Decimal::ONE,
            ts,
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_open_trade() {
        let f = fill("f-1", Side::BUY, 10, 100, 1);
        let trade = Trade::open(&f, f.quantity, f.commission);

        assert_eq!(trade.status, TradeStatus::OPEN);
        assert_eq!(trade.position_side(), PositionSide::LONG);
        assert_eq!(trade.remaining_quantity, Quantity::from_u64(100));
        assert_eq!(trade.pnl, Decimal::ZERO);
        assert_eq!(trade.fills, vec![FillId::new("f-1")]);
        trade.check_invariants().unwrap();
    }

    #[test]
    fn test_extend_reweights_open_price() {
        let f = fill("f-1", Side::BUY, 10, 100, 1);
        let mut trade = Trade::open(&f, f.quantity, f.commission);
        trade.extend(&FillId::new("f-2"), Price::from_u64(14), Quantity::from_u64(100), Decimal::ONE)
            .unwrap();

        assert_eq!(trade.open_price, Price::from_u64(12));
        assert_eq!(trade.quantity, Quantity::from_u64(200));
        assert_eq!(trade.commission, Decimal::from(2));
        trade.check_invariants().unwrap();
    }

    #[test]
    fn test_partial_then_full_close() {
        let f = fill("f-1", Side::BUY, 10, 100, 1);
        let mut trade = Trade::open(&f, f.quantity, Decimal::ZERO);

        trade.record_close(
            &FillId::new("f-2"),
            Price::from_u64(12),
            Quantity::from_u64(40),
            Decimal::from(80),
            Decimal::ZERO,
            2,
        )
        .unwrap();
        assert!(trade.is_open());
        assert_eq!(trade.closed_quantity(), Quantity::from_u64(40));
        assert_eq!(trade.close_price, Some(Price::from_u64(12)));
        trade.check_invariants().unwrap();

        trade.record_close(
            &FillId::new("f-3"),
            Price::from_u64(17),
            Quantity::from_u64(60),
            Decimal::from(420),
            Decimal::ZERO,
            3,
        )
        .unwrap();
        assert_eq!(trade.status, TradeStatus::CLOSED);
        assert_eq!(trade.close_date, Some(3));
        // (12*40 + 17*60) / 100 = 15
        assert_eq!(trade.close_price, Some(Price::from_u64(15)));
        assert_eq!(trade.pnl, Decimal::from(500));
        trade.check_invariants().unwrap();
    }

    #[test]
    fn test_net_pnl_deducts_commission() {
        let f = fill("f-1", Side::SELL, 12, 100, 1);
        let mut trade = Trade::open(&f, f.quantity, Decimal::from(3));
        trade.record_close(
            &FillId::new("f-2"),
            Price::from_u64(10),
            Quantity::from_u64(100),
            Decimal::from(200),
            Decimal::from(2),
            2,
        )
        .unwrap();
        assert_eq!(trade.net_pnl(), Decimal::from(195));
    }

    #[test]
    fn test_overflowing_updates_leave_trade_untouched() {
        let huge = Decimal::from_i128_with_scale(40_000_000_000_000_000_000_000_000_000, 0);
        let first = Fill::try_new(
            FillId::new("f-1"),
            OwnerId::new("alice"),
            Symbol::new("AAPL"),
            Side::BUY,
            huge,
            Decimal::ONE,
            Decimal::ZERO,
            1,
            0,
        )
        .unwrap();
        let mut trade = Trade::open(&first, first.quantity, Decimal::ZERO);
        let before = trade.clone();

        let err = trade
            .extend(&FillId::new("f-2"), first.price, Quantity::from_u64(1), Decimal::ZERO)
            .unwrap_err();
        assert!(matches!(err, FillError::Overflow(_)));
        assert_eq!(trade, before);

        let mut closing = Trade::open(&fill("f-3", Side::BUY, 1, 2, 1), Quantity::from_u64(2), Decimal::ZERO);
        closing
            .record_close(&FillId::new("f-4"), first.price, Quantity::from_u64(1), huge, Decimal::ZERO, 2)
            .unwrap();
        let before = closing.clone();
        let err = closing
            .record_close(&FillId::new("f-5"), first.price, Quantity::from_u64(1), huge, Decimal::ZERO, 3)
            .unwrap_err();
        assert!(matches!(err, FillError::Overflow(_)));
        assert_eq!(closing, before);
    }

    #[test]
    fn test_invariant_detects_bad_status() {
        let f = fill("f-1", Side::BUY, 10, 1, 1);
        let mut trade = Trade::open(&f, f.quantity, Decimal::ZERO);
        trade.status = TradeStatus::CLOSED;
        assert!(trade.check_invariants().is_err());
    }

    #[test]
    fn test_trade_json_shape() {
        let f = fill("f-1", Side::BUY, 10, 5, 1);
        let trade = Trade::open(&f, f.quantity, f.commission);
        let json = serde_json::to_value(&trade).unwrap();
        assert_eq!(json["status"], "OPEN");
        assert_eq!(json["side"], "BUY");
        assert_eq!(json["open_price"], "10");
    }
}
