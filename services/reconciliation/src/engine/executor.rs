//! Plan execution
//!
//! Stores the trades a `FillPlan` already computed and moves the lots to
//! match. No arithmetic that can fail happens here.

use super::planner::{FillPlan, PlannedAction};
use super::{Applied, TradeMutation};
use crate::error::ReconcileError;
use crate::events::AuditAction;
use crate::ledger::SymbolLedger;
use trade_types::errors::LedgerError;
use trade_types::fill::Fill;
use trade_types::position::PositionSide;
use trade_types::trade::Trade;
use tracing::debug;

pub(crate) fn commit(ledger: &mut SymbolLedger, fill: Fill, plan: FillPlan) -> Result<Applied, ReconcileError> {
    let direction = PositionSide::from_side(fill.side);

    let mutations = match plan.action {
        PlannedAction::Open { trade } => {
            ledger
                .position
                .push_lot(direction, trade.id, fill.price, fill.quantity, fill.id.clone())?;
            ledger.insert_trade(trade.clone());
            vec![TradeMutation {
                action: AuditAction::TradeOpened,
                before: None,
                after: trade,
            }]
        }

        PlannedAction::Extend { before, after } => {
            ledger
                .position
                .push_lot(direction, after.id, fill.price, fill.quantity, fill.id.clone())?;
            replace_trade(ledger, after.clone())?;
            vec![TradeMutation {
                action: AuditAction::TradeExtended,
                before: Some(before),
                after,
            }]
        }

        PlannedAction::Close {
            before,
            after,
            close_quantity,
            flipped,
        } => {
            ledger.trade(after.id).ok_or_else(|| missing_trade(ledger, &after))?;
            ledger.position.consume_lots(close_quantity);
            replace_trade(ledger, after.clone())?;

            let action = if after.is_open() {
                AuditAction::TradePartiallyClosed
            } else {
                AuditAction::TradeClosed
            };
            let mut mutations = vec![TradeMutation {
                action,
                before: Some(before),
                after,
            }];

            if let Some(flipped) = flipped {
                ledger.position.push_lot(
                    direction,
                    flipped.id,
                    fill.price,
                    flipped.quantity,
                    fill.id.clone(),
                )?;
                ledger.insert_trade(flipped.clone());
                mutations.push(TradeMutation {
                    action: AuditAction::TradeOpened,
                    before: None,
                    after: flipped,
                });
            }
            mutations
        }
    };

    debug!(
        key = %ledger.key(),
        fill_id = %fill.id,
        kind = ?plan.outcome.kind,
        trade_id = %plan.outcome.trade_id,
        net_quantity = %ledger.position.net_quantity(),
        "Fill applied"
    );

    ledger.record_fill(fill, plan.outcome.clone());

    Ok(Applied {
        outcome: plan.outcome,
        mutations,
        duplicate: false,
    })
}

fn missing_trade(ledger: &SymbolLedger, trade: &Trade) -> ReconcileError {
    LedgerError::InvariantViolation {
        key: ledger.key().to_string(),
        reason: format!("active trade {} is not in the ledger", trade.id),
    }
    .into()
}

fn replace_trade(ledger: &mut SymbolLedger, updated: Trade) -> Result<(), ReconcileError> {
    match ledger.trade_mut(updated.id) {
        Some(slot) => {
            *slot = updated;
            Ok(())
        }
        None => Err(missing_trade(ledger, &updated)),
    }
}
