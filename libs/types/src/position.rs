//! Position ledger types
//!
//! A position is either flat or open in one direction with a FIFO queue of
//! entry lots. `net_quantity` is always derived from the lots, never stored.

use crate::errors::{FillError, LedgerError};
use crate::fill::Side;
use crate::ids::{FillId, OwnerId, PositionKey, Symbol, TradeId};
use crate::numeric::{Price, Quantity};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Consumed head slots are reclaimed once they pass this count and make up
/// at least half of the backing vector.
const COMPACT_THRESHOLD: usize = 32;

/// Position side enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    /// Long position - profit when price increases
    LONG,
    /// Short position - profit when price decreases
    SHORT,
}

impl PositionSide {
    /// Direction a fill on `side` opens or extends
    pub fn from_side(side: Side) -> Self {
        match side {
            Side::BUY => PositionSide::LONG,
            Side::SELL => PositionSide::SHORT,
        }
    }

    /// Fill side that opens this direction
    pub fn opening_side(&self) -> Side {
        match self {
            PositionSide::LONG => Side::BUY,
            PositionSide::SHORT => Side::SELL,
        }
    }

    pub fn sign(&self) -> Decimal {
        match self {
            PositionSide::LONG => Decimal::ONE,
            PositionSide::SHORT => Decimal::NEGATIVE_ONE,
        }
    }

    /// Realized P&L for closing `quantity` entered at `entry` and exited at `exit`.
    ///
    /// `None` when the result does not fit in a `Decimal`.
    pub fn realized_pnl(&self, entry: Decimal, exit: Decimal, quantity: Quantity) -> Option<Decimal> {
        let per_unit = match self {
            // LONG: (exit - entry) × qty
            PositionSide::LONG => exit.checked_sub(entry)?,
            // SHORT: (entry - exit) × qty
            PositionSide::SHORT => entry.checked_sub(exit)?,
        };
        per_unit.checked_mul(quantity.as_decimal())
    }
}

/// One unconsumed entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lot {
    pub price: Price,
    pub remaining_quantity: Quantity,
    pub fill_id: FillId,
}

/// Part of a lot taken by a closing fill
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedLot {
    /// The lot as it was before this consumption
    pub lot: Lot,
    pub consumed_quantity: Quantity,
}

/// FIFO lot queue backed by a vector and a head index
///
/// Consumption advances `head` instead of shifting the vector; the dead
/// prefix is dropped lazily in `compact`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Lot>", into = "Vec<Lot>")]
pub struct LotQueue {
    lots: Vec<Lot>,
    head: usize,
}

impl LotQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, lot: Lot) {
        self.lots.push(lot);
    }

    /// Oldest unconsumed lot
    pub fn front(&self) -> Option<&Lot> {
        self.lots.get(self.head)
    }

    pub fn as_slice(&self) -> &[Lot] {
        &self.lots[self.head..]
    }

    pub fn len(&self) -> usize {
        self.lots.len() - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_quantity(&self) -> Quantity {
        self.as_slice().iter().map(|l| l.remaining_quantity).sum()
    }

    /// Quantity-weighted average entry price of the open lots.
    ///
    /// `Ok(None)` for an empty queue.
    pub fn average_price(&self) -> Result<Option<Decimal>, FillError> {
        let overflow = || FillError::Overflow("average entry price of open lots".to_string());
        let mut total = Decimal::ZERO;
        let mut notional = Decimal::ZERO;
        for lot in self.as_slice() {
            let quantity = lot.remaining_quantity.as_decimal();
            total = total.checked_add(quantity).ok_or_else(overflow)?;
            notional = lot
                .price
                .as_decimal()
                .checked_mul(quantity)
                .and_then(|n| notional.checked_add(n))
                .ok_or_else(overflow)?;
        }
        if total.is_zero() {
            return Ok(None);
        }
        notional.checked_div(total).map(Some).ok_or_else(overflow)
    }

    /// What `consume` would take, without consuming it
    pub fn preview(&self, quantity: Quantity) -> Vec<ConsumedLot> {
        let mut remaining = quantity;
        let mut taken = Vec::new();
        for lot in self.as_slice() {
            if remaining.is_zero() {
                break;
            }
            let take = remaining.min(lot.remaining_quantity);
            taken.push(ConsumedLot {
                lot: lot.clone(),
                consumed_quantity: take,
            });
            remaining = remaining.saturating_sub(take);
        }
        taken
    }

    /// Consume up to `quantity` from the head, oldest first.
    ///
    /// Returns fewer than `quantity` when the queue runs dry.
    pub fn consume(&mut self, quantity: Quantity) -> Vec<ConsumedLot> {
        let mut remaining = quantity;
        let mut consumed = Vec::new();

        while !remaining.is_zero() {
            let Some(front) = self.lots.get_mut(self.head) else {
                break;
            };
            let take = remaining.min(front.remaining_quantity);
            consumed.push(ConsumedLot {
                lot: front.clone(),
                consumed_quantity: take,
            });
            remaining = remaining.saturating_sub(take);
            front.remaining_quantity = front.remaining_quantity.saturating_sub(take);
            if front.remaining_quantity.is_zero() {
                self.head += 1;
            }
        }

        self.compact();
        consumed
    }

    fn compact(&mut self) {
        if self.head == self.lots.len() {
            self.lots.clear();
            self.head = 0;
        } else if self.head >= COMPACT_THRESHOLD && self.head * 2 >= self.lots.len() {
            self.lots.drain(..self.head);
            self.head = 0;
        }
    }
}

impl PartialEq for LotQueue {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for LotQueue {}

impl From<Vec<Lot>> for LotQueue {
    fn from(lots: Vec<Lot>) -> Self {
        Self { lots, head: 0 }
    }
}

impl From<LotQueue> for Vec<Lot> {
    fn from(mut queue: LotQueue) -> Self {
        queue.lots.drain(..queue.head);
        queue.lots
    }
}

/// Position state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionState {
    Flat,
    Open {
        side: PositionSide,
        trade_id: TradeId,
        lots: LotQueue,
    },
}

/// Working state for one `(owner, symbol)` key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub owner_id: OwnerId,
    pub symbol: Symbol,
    state: PositionState,
}

impl Position {
    /// Create a flat position
    pub fn flat(owner_id: OwnerId, symbol: Symbol) -> Self {
        Self {
            owner_id,
            symbol,
            state: PositionState::Flat,
        }
    }

    pub fn key(&self) -> PositionKey {
        PositionKey::new(self.owner_id.clone(), self.symbol.clone())
    }

    pub fn state(&self) -> &PositionState {
        &self.state
    }

    pub fn is_flat(&self) -> bool {
        matches!(self.state, PositionState::Flat)
    }

    pub fn side(&self) -> Option<PositionSide> {
        match &self.state {
            PositionState::Flat => None,
            PositionState::Open { side, .. } => Some(*side),
        }
    }

    pub fn active_trade_id(&self) -> Option<TradeId> {
        match &self.state {
            PositionState::Flat => None,
            PositionState::Open { trade_id, .. } => Some(*trade_id),
        }
    }

    pub fn lots(&self) -> &[Lot] {
        match &self.state {
            PositionState::Flat => &[],
            PositionState::Open { lots, .. } => lots.as_slice(),
        }
    }

    /// Unsigned size of the open position
    pub fn open_quantity(&self) -> Quantity {
        match &self.state {
            PositionState::Flat => Quantity::zero(),
            PositionState::Open { lots, .. } => lots.total_quantity(),
        }
    }

    /// Signed size: positive long, negative short, zero when flat
    pub fn net_quantity(&self) -> Decimal {
        match &self.state {
            PositionState::Flat => Decimal::ZERO,
            PositionState::Open { side, lots, .. } => {
                side.sign() * lots.total_quantity().as_decimal()
            }
        }
    }

    /// Average entry price of the open lots, `Ok(None)` when flat
    pub fn average_cost(&self) -> Result<Option<Decimal>, FillError> {
        match &self.state {
            PositionState::Flat => Ok(None),
            PositionState::Open { lots, .. } => lots.average_price(),
        }
    }

    /// The lots `consume_lots(quantity)` would take, oldest first
    pub fn preview_consume(&self, quantity: Quantity) -> Vec<ConsumedLot> {
        match &self.state {
            PositionState::Flat => Vec::new(),
            PositionState::Open { lots, .. } => lots.preview(quantity),
        }
    }

    /// Append an entry lot.
    ///
    /// A flat position becomes open in `side` with `trade_id` as its active
    /// trade. An open position only accepts lots in its own direction.
    pub fn push_lot(
        &mut self,
        side: PositionSide,
        trade_id: TradeId,
        price: Price,
        quantity: Quantity,
        fill_id: FillId,
    ) -> Result<(), LedgerError> {
        if quantity.is_zero() {
            return Err(LedgerError::EmptyLot {
                fill_id: fill_id.to_string(),
            });
        }
        let lot = Lot {
            price,
            remaining_quantity: quantity,
            fill_id,
        };

        match &mut self.state {
            PositionState::Flat => {
                let mut lots = LotQueue::new();
                lots.push(lot);
                self.state = PositionState::Open {
                    side,
                    trade_id,
                    lots,
                };
            }
            PositionState::Open {
                side: open_side,
                lots,
                ..
            } => {
                if *open_side != side {
                    return Err(LedgerError::DirectionMismatch {
                        open: format!("{:?}", open_side),
                        pushed: format!("{:?}", side),
                    });
                }
                lots.push(lot);
            }
        }
        Ok(())
    }

    /// Consume up to `quantity` from the open lots, oldest first.
    ///
    /// The position goes flat when its last lot is consumed. The returned
    /// lots cover less than `quantity` exactly when the fill crosses zero.
    pub fn consume_lots(&mut self, quantity: Quantity) -> Vec<ConsumedLot> {
        let (consumed, exhausted) = match &mut self.state {
            PositionState::Flat => return Vec::new(),
            PositionState::Open { lots, .. } => {
                let consumed = lots.consume(quantity);
                (consumed, lots.is_empty())
            }
        };
        if exhausted {
            self.state = PositionState::Flat;
        }
        consumed
    }

    /// Verify the lot bookkeeping
    pub fn check_invariants(&self) -> Result<(), LedgerError> {
        let violation = |reason: String| LedgerError::InvariantViolation {
            key: self.key().to_string(),
            reason,
        };

        match &self.state {
            PositionState::Flat => Ok(()),
            PositionState::Open { lots, .. } => {
                if lots.is_empty() {
                    return Err(violation("open position has no lots".to_string()));
                }
                if let Some(lot) = lots.as_slice().iter().find(|l| l.remaining_quantity.is_zero()) {
                    return Err(violation(format!("lot {} is fully consumed", lot.fill_id)));
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn position() -> Position {
        Position::flat(OwnerId::new("alice"), Symbol::new("AAPL"))
    }

    fn trade_id() -> TradeId {
        TradeId::derive(&OwnerId::new("alice"), &Symbol::new("AAPL"), &FillId::new("f-1"))
    }

    fn push(pos: &mut Position, side: PositionSide, price: u64, qty: u64, id: &str) {
        pos.push_lot(
            side,
            trade_id(),
            Price::from_u64(price),
            Quantity::from_u64(qty),
            FillId::new(id),
        )
        .unwrap();
    }

    #[test]
    fn test_push_lot_opens_position() {
        let mut pos = position();
        assert!(pos.is_flat());
        push(&mut pos, PositionSide::SHORT, 12, 100, "f-1");

        assert_eq!(pos.side(), Some(PositionSide::SHORT));
        assert_eq!(pos.net_quantity(), Decimal::from(-100));
        assert_eq!(pos.active_trade_id(), Some(trade_id()));
        pos.check_invariants().unwrap();
    }

    #[test]
    fn test_push_lot_rejects_opposite_direction() {
        let mut pos = position();
        push(&mut pos, PositionSide::LONG, 10, 5, "f-1");
        let err = pos
            .push_lot(
                PositionSide::SHORT,
                trade_id(),
                Price::from_u64(10),
                Quantity::from_u64(1),
                FillId::new("f-2"),
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::DirectionMismatch { .. }));
        assert_eq!(pos.net_quantity(), Decimal::from(5));
    }

    #[test]
    fn test_push_lot_rejects_zero_quantity() {
        let mut pos = position();
        let err = pos
            .push_lot(
                PositionSide::LONG,
                trade_id(),
                Price::from_u64(10),
                Quantity::zero(),
                FillId::new("f-1"),
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::EmptyLot { .. }));
        assert!(pos.is_flat());
    }

    #[test]
    fn test_consume_is_fifo_with_partial_head() {
        let mut pos = position();
        push(&mut pos, PositionSide::LONG, 10, 30, "f-1");
        push(&mut pos, PositionSide::LONG, 11, 50, "f-2");

        let consumed = pos.consume_lots(Quantity::from_u64(40));
        assert_eq!(consumed.len(), 2);
        assert_eq!(consumed[0].lot.fill_id, FillId::new("f-1"));
        assert_eq!(consumed[0].consumed_quantity, Quantity::from_u64(30));
        assert_eq!(consumed[1].lot.fill_id, FillId::new("f-2"));
        assert_eq!(consumed[1].consumed_quantity, Quantity::from_u64(10));

        // Partially consumed lot stays at the head
        assert_eq!(pos.lots().len(), 1);
        assert_eq!(pos.lots()[0].fill_id, FillId::new("f-2"));
        assert_eq!(pos.lots()[0].remaining_quantity, Quantity::from_u64(40));
        assert_eq!(pos.net_quantity(), Decimal::from(40));
        pos.check_invariants().unwrap();
    }

    #[test]
    fn test_consume_shortfall_goes_flat() {
        let mut pos = position();
        push(&mut pos, PositionSide::LONG, 10, 100, "f-1");

        let consumed = pos.consume_lots(Quantity::from_u64(150));
        let total: Quantity = consumed.iter().map(|c| c.consumed_quantity).sum();
        assert_eq!(total, Quantity::from_u64(100));
        assert!(pos.is_flat());
        assert_eq!(pos.net_quantity(), Decimal::ZERO);
    }

    #[test]
    fn test_consume_on_flat_is_empty() {
        let mut pos = position();
        assert!(pos.consume_lots(Quantity::from_u64(1)).is_empty());
    }

    #[test]
    fn test_average_cost() {
        let mut pos = position();
        push(&mut pos, PositionSide::LONG, 10, 100, "f-1");
        push(&mut pos, PositionSide::LONG, 14, 100, "f-2");
        assert_eq!(pos.average_cost().unwrap(), Some(Decimal::from(12)));
        assert_eq!(position().average_cost().unwrap(), None);
    }

    #[test]
    fn test_average_cost_overflow_is_an_error() {
        let mut pos = position();
        let huge = Decimal::from_i128_with_scale(40_000_000_000_000_000_000_000_000_000, 0);
        for id in ["f-1", "f-2"] {
            pos.push_lot(
                PositionSide::LONG,
                trade_id(),
                Price::try_new(huge).unwrap(),
                Quantity::from_u64(1),
                FillId::new(id),
            )
            .unwrap();
        }
        assert!(matches!(pos.average_cost(), Err(FillError::Overflow(_))));
    }

    #[test]
    fn test_preview_leaves_lots_in_place() {
        let mut pos = position();
        push(&mut pos, PositionSide::LONG, 10, 100, "f-1");
        push(&mut pos, PositionSide::LONG, 11, 100, "f-2");

        let preview = pos.preview_consume(Quantity::from_u64(150));
        assert_eq!(pos.net_quantity(), Decimal::from(200));
        assert_eq!(preview, pos.clone().consume_lots(Quantity::from_u64(150)));
        assert_eq!(preview[1].consumed_quantity, Quantity::from_u64(50));
    }

    #[test]
    fn test_realized_pnl_sign() {
        let qty = Quantity::from_u64(100);
        assert_eq!(
            PositionSide::LONG.realized_pnl(Decimal::from(10), Decimal::from(12), qty),
            Some(Decimal::from(200))
        );
        assert_eq!(
            PositionSide::SHORT.realized_pnl(Decimal::from(12), Decimal::from(10), qty),
            Some(Decimal::from(200))
        );
        assert_eq!(PositionSide::LONG.realized_pnl(Decimal::ZERO, Decimal::MAX, qty), None);
    }

    #[test]
    fn test_lot_queue_compaction_keeps_order() {
        let mut queue = LotQueue::new();
        for i in 0..100u64 {
            queue.push(Lot {
                price: Price::from_u64(i + 1),
                remaining_quantity: Quantity::from_u64(1),
                fill_id: FillId::new(format!("f-{}", i)),
            });
        }
        queue.consume(Quantity::from_u64(70));
        assert_eq!(queue.len(), 30);
        assert_eq!(queue.front().unwrap().fill_id, FillId::new("f-70"));

        let as_vec: Vec<Lot> = queue.clone().into();
        assert_eq!(as_vec.len(), 30);
        assert_eq!(LotQueue::from(as_vec), queue);
    }

    #[test]
    fn test_position_serde_skips_consumed_lots() {
        let mut pos = position();
        push(&mut pos, PositionSide::LONG, 10, 1, "f-1");
        push(&mut pos, PositionSide::LONG, 11, 1, "f-2");
        pos.consume_lots(Quantity::from_u64(1));

        let json = serde_json::to_string(&pos).unwrap();
        assert!(!json.contains("\"f-1\""));
        let back: Position = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pos);
    }

    proptest! {
        #[test]
        fn prop_invariants_hold_under_random_ops(
            ops in prop::collection::vec((any::<bool>(), 1u64..50), 1..60)
        ) {
            let mut pos = position();
            let mut expected: i64 = 0;
            for (i, (push_op, qty)) in ops.into_iter().enumerate() {
                if push_op {
                    let side = pos.side().unwrap_or(PositionSide::LONG);
                    push(&mut pos, side, 10, qty, &format!("f-{}", i));
                    expected += if side == PositionSide::LONG { qty as i64 } else { -(qty as i64) };
                } else {
                    let consumed = pos.consume_lots(Quantity::from_u64(qty));
                    let taken: Quantity = consumed.iter().map(|c| c.consumed_quantity).sum();
                    let taken = taken.as_decimal();
                    expected -= expected.signum() * i64::try_from(taken.mantissa()).unwrap();
                }
                prop_assert!(pos.check_invariants().is_ok());
                prop_assert_eq!(pos.net_quantity(), Decimal::from(expected));
            }
        }
    }
}
