//! Per-key working state
//!
//! Everything derived for one `(owner, symbol)` stream lives here: the
//! position, the trades it produced, the accepted fills in replay order and
//! the outcome recorded for each fill id.

use crate::events::AuditEvent;
use std::collections::{HashMap, VecDeque};
use trade_types::errors::LedgerError;
use trade_types::fill::{Fill, FillOrder};
use trade_types::ids::{FillId, PositionKey, TradeId};
use trade_types::position::Position;
use trade_types::trade::{ApplyOutcome, Trade};

#[derive(Debug, Clone)]
pub struct SymbolLedger {
    key: PositionKey,
    pub(crate) position: Position,
    /// Creation order
    trades: Vec<Trade>,
    trade_index: HashMap<TradeId, usize>,
    /// Accepted fills in `(timestamp, sequence)` order
    fills: Vec<Fill>,
    fill_index: HashMap<FillId, usize>,
    applied: HashMap<FillId, ApplyOutcome>,
    watermark: Option<FillOrder>,
    /// Events not yet accepted by the audit sink
    pub(crate) pending_audit: VecDeque<AuditEvent>,
}

impl SymbolLedger {
    pub fn new(key: PositionKey) -> Self {
        Self {
            position: Position::flat(key.owner_id.clone(), key.symbol.clone()),
            key,
            trades: Vec::new(),
            trade_index: HashMap::new(),
            fills: Vec::new(),
            fill_index: HashMap::new(),
            applied: HashMap::new(),
            watermark: None,
            pending_audit: VecDeque::new(),
        }
    }

    pub fn key(&self) -> &PositionKey {
        &self.key
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn trade(&self, id: TradeId) -> Option<&Trade> {
        self.trade_index.get(&id).map(|&i| &self.trades[i])
    }

    pub(crate) fn trade_mut(&mut self, id: TradeId) -> Option<&mut Trade> {
        let index = *self.trade_index.get(&id)?;
        self.trades.get_mut(index)
    }

    pub(crate) fn insert_trade(&mut self, trade: Trade) {
        self.trade_index.insert(trade.id, self.trades.len());
        self.trades.push(trade);
    }

    /// The single OPEN trade, if the position is not flat
    pub fn open_trade(&self) -> Option<&Trade> {
        self.position.active_trade_id().and_then(|id| self.trade(id))
    }

    pub fn fills(&self) -> &[Fill] {
        &self.fills
    }

    pub fn fill(&self, id: &FillId) -> Option<&Fill> {
        self.fill_index.get(id).map(|&i| &self.fills[i])
    }

    /// Record an accepted fill and its outcome, advancing the watermark
    pub(crate) fn record_fill(&mut self, fill: Fill, outcome: ApplyOutcome) {
        self.watermark = Some(fill.order_key());
        self.fill_index.insert(fill.id.clone(), self.fills.len());
        self.applied.insert(fill.id.clone(), outcome);
        self.fills.push(fill);
    }

    pub fn outcome(&self, id: &FillId) -> Option<&ApplyOutcome> {
        self.applied.get(id)
    }

    /// Order key of the newest accepted fill
    pub fn watermark(&self) -> Option<FillOrder> {
        self.watermark
    }

    pub fn pending_audit(&self) -> usize {
        self.pending_audit.len()
    }

    /// Swap in state rebuilt by a full replay, keeping undelivered audit events.
    pub(crate) fn replace_derived(&mut self, rebuilt: SymbolLedger) {
        let pending = std::mem::take(&mut self.pending_audit);
        *self = rebuilt;
        self.pending_audit = pending;
    }

    /// Cross-check position, trades and fill bookkeeping.
    pub fn check_invariants(&self) -> Result<(), LedgerError> {
        let violation = |reason: String| LedgerError::InvariantViolation {
            key: self.key.to_string(),
            reason,
        };

        self.position.check_invariants()?;
        for trade in &self.trades {
            trade.check_invariants()?;
        }

        let open: Vec<&Trade> = self.trades.iter().filter(|t| t.is_open()).collect();
        if open.len() > 1 {
            return Err(violation(format!("{} open trades", open.len())));
        }
        match (open.first(), self.position.active_trade_id()) {
            (None, None) => {}
            (Some(trade), Some(active)) if trade.id == active => {
                if trade.remaining_quantity != self.position.open_quantity() {
                    return Err(violation(format!(
                        "open trade remaining {} but position holds {}",
                        trade.remaining_quantity,
                        self.position.open_quantity()
                    )));
                }
            }
            (trade, active) => {
                return Err(violation(format!(
                    "open trade {:?} does not match active trade {:?}",
                    trade.map(|t| t.id),
                    active
                )));
            }
        }

        if self.applied.len() != self.fills.len() || self.fill_index.len() != self.fills.len() {
            return Err(violation(format!(
                "{} outcomes and {} indexed ids for {} fills",
                self.applied.len(),
                self.fill_index.len(),
                self.fills.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ReconciliationEngine;
    use rust_decimal::Decimal;
    use trade_types::prelude::*;

    fn fill(id: &str, side: Side, ts: i64) -> Fill {
        Fill::try_new(
            FillId::new(id),
            OwnerId::new("alice"),
            Symbol::new("AAPL"),
            side,
            Decimal::from(10),
            Decimal::from(5),
            Decimal::ZERO,
            ts,
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_fill_lookup_by_id() {
        let engine = ReconciliationEngine::default();
        let mut ledger = SymbolLedger::new(PositionKey::new(OwnerId::new("alice"), Symbol::new("AAPL")));
        for n in 0..200 {
            let side = if n % 2 == 0 { Side::BUY } else { Side::SELL };
            engine.apply(&mut ledger, fill(&format!("f-{}", n), side, n)).unwrap();
        }

        assert_eq!(ledger.fill(&FillId::new("f-137")).map(|f| f.timestamp), Some(137));
        assert_eq!(ledger.fill(&FillId::new("f-0")), ledger.fills().first());
        assert!(ledger.fill(&FillId::new("f-200")).is_none());
        assert_eq!(ledger.watermark(), Some((199, 0)));
        ledger.check_invariants().unwrap();
    }

    #[test]
    fn test_index_survives_rebuild() {
        let engine = ReconciliationEngine::default();
        let key = PositionKey::new(OwnerId::new("alice"), Symbol::new("AAPL"));
        let mut ledger = SymbolLedger::new(key.clone());
        engine.apply(&mut ledger, fill("f-1", Side::BUY, 1)).unwrap();
        engine.apply(&mut ledger, fill("f-2", Side::BUY, 2)).unwrap();

        let rebuilt = engine.replay(key, ledger.fills().to_vec()).unwrap();
        ledger.replace_derived(rebuilt);
        assert_eq!(ledger.fill(&FillId::new("f-2")).map(|f| f.timestamp), Some(2));
    }
}
