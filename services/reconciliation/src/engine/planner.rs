//! Fill classification
//!
//! Planning reads the ledger without mutating it. Everything that can reject
//! a fill happens here, before the fill is journaled, including the
//! arithmetic: the trades a fill produces are computed in full so that
//! commit only has to store them.

use crate::config::MatchingPolicy;
use crate::error::ReconcileError;
use crate::ledger::SymbolLedger;
use rust_decimal::Decimal;
use trade_types::errors::{FillError, LedgerError};
use trade_types::fill::Fill;
use trade_types::ids::TradeId;
use trade_types::numeric::Quantity;
use trade_types::position::{ConsumedLot, PositionSide};
use trade_types::trade::{ApplyOutcome, MutationKind, Trade};
use tracing::warn;

/// Result of planning one fill
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    /// Fill id already applied for this key; nothing to do
    Duplicate(ApplyOutcome),
    Apply(FillPlan),
}

/// Validated mutation for one fill, ready to journal and commit
#[derive(Debug, Clone, PartialEq)]
pub struct FillPlan {
    pub outcome: ApplyOutcome,
    pub(crate) action: PlannedAction,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PlannedAction {
    Open {
        trade: Trade,
    },
    Extend {
        before: Trade,
        after: Trade,
    },
    Close {
        before: Trade,
        after: Trade,
        close_quantity: Quantity,
        /// Trade opened by the excess quantity, in the fill's direction
        flipped: Option<Trade>,
    },
}

pub(crate) fn plan(
    policy: MatchingPolicy,
    ledger: &SymbolLedger,
    fill: &Fill,
) -> Result<Plan, ReconcileError> {
    fill.validate()?;

    if fill.position_key() != *ledger.key() {
        return Err(LedgerError::InvariantViolation {
            key: ledger.key().to_string(),
            reason: format!("fill {} belongs to {}", fill.id, fill.position_key()),
        }
        .into());
    }

    // Duplicates are answered before ordering: a replayed old fill is a no-op
    if let Some(prior) = ledger.outcome(&fill.id) {
        if let Some(existing) = ledger.fill(&fill.id) {
            if existing != fill {
                warn!(
                    key = %ledger.key(),
                    fill_id = %fill.id,
                    "Duplicate fill id with different content, keeping the original"
                );
            }
        }
        return Ok(Plan::Duplicate(prior.clone()));
    }

    if let Some(last) = ledger.watermark() {
        if fill.order_key() < last {
            return Err(ReconcileError::OutOfOrderFill {
                fill_id: fill.id.clone(),
                last,
                received: fill.order_key(),
            });
        }
    }

    let direction = PositionSide::from_side(fill.side);
    let position = ledger.position();

    let (outcome, action) = match (position.side(), position.active_trade_id()) {
        (Some(side), Some(trade_id)) if side == direction => {
            let before = active_trade(ledger, trade_id)?;
            let mut after = before.clone();
            after.extend(&fill.id, fill.price, fill.quantity, fill.commission)?;
            (
                ApplyOutcome {
                    trade_id,
                    kind: MutationKind::Extended,
                    flipped_into: None,
                },
                PlannedAction::Extend { before, after },
            )
        }
        (Some(_), Some(trade_id)) => {
            let before = active_trade(ledger, trade_id)?;
            let open_quantity = position.open_quantity();
            let close_quantity = fill.quantity.min(open_quantity);
            let flip_quantity = fill.quantity.saturating_sub(close_quantity);

            let realized = realize(policy, ledger, before.position_side(), fill, close_quantity)?;
            let close_commission = if flip_quantity.is_zero() {
                fill.commission
            } else {
                fill.commission
                    .checked_mul(close_quantity.as_decimal())
                    .and_then(|c| c.checked_div(fill.quantity.as_decimal()))
                    .ok_or_else(|| FillError::Overflow(format!("commission split of fill {}", fill.id)))?
            };

            let mut after = before.clone();
            after.record_close(
                &fill.id,
                fill.price,
                close_quantity,
                realized,
                close_commission,
                fill.timestamp,
            )?;

            let flipped = if flip_quantity.is_zero() {
                None
            } else {
                Some(Trade::open(fill, flip_quantity, fill.commission - close_commission))
            };

            let kind = if flipped.is_some() {
                MutationKind::ClosedAndFlipped
            } else if close_quantity == open_quantity {
                MutationKind::Closed
            } else {
                MutationKind::PartiallyClosed
            };

            (
                ApplyOutcome {
                    trade_id,
                    kind,
                    flipped_into: flipped.as_ref().map(|t| t.id),
                },
                PlannedAction::Close {
                    before,
                    after,
                    close_quantity,
                    flipped,
                },
            )
        }
        (None, None) => {
            let trade = Trade::open(fill, fill.quantity, fill.commission);
            (
                ApplyOutcome {
                    trade_id: trade.id,
                    kind: MutationKind::Opened,
                    flipped_into: None,
                },
                PlannedAction::Open { trade },
            )
        }
        (side, active) => {
            return Err(LedgerError::InvariantViolation {
                key: ledger.key().to_string(),
                reason: format!("position side {:?} with active trade {:?}", side, active),
            }
            .into());
        }
    };

    Ok(Plan::Apply(FillPlan { outcome, action }))
}

/// P&L realized by closing `quantity` of the held side at the fill's price.
fn realize(
    policy: MatchingPolicy,
    ledger: &SymbolLedger,
    held: PositionSide,
    fill: &Fill,
    quantity: Quantity,
) -> Result<Decimal, FillError> {
    let exit = fill.price.as_decimal();
    let overflow = || FillError::Overflow(format!("realized P&L of fill {}", fill.id));
    let average_cost = match policy {
        MatchingPolicy::AverageCost => ledger.position().average_cost()?,
        MatchingPolicy::Fifo => None,
    };
    match average_cost {
        Some(cost) => held.realized_pnl(cost, exit, quantity).ok_or_else(overflow),
        None => ledger
            .position()
            .preview_consume(quantity)
            .iter()
            .try_fold(Decimal::ZERO, |total, ConsumedLot { lot, consumed_quantity }| {
                held.realized_pnl(lot.price.as_decimal(), exit, *consumed_quantity)
                    .and_then(|pnl| total.checked_add(pnl))
            })
            .ok_or_else(overflow),
    }
}

fn active_trade(ledger: &SymbolLedger, trade_id: TradeId) -> Result<Trade, ReconcileError> {
    ledger.trade(trade_id).cloned().ok_or_else(|| {
        LedgerError::InvariantViolation {
            key: ledger.key().to_string(),
            reason: format!("active trade {} is not in the ledger", trade_id),
        }
        .into()
    })
}
