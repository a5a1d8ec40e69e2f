//! Audit events emitted for every trade mutation

use serde::{Deserialize, Serialize};
use trade_types::ids::{FillId, OwnerId, Symbol, TradeId};
use trade_types::trade::Trade;

/// Kind of trade mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    TradeOpened,
    TradeExtended,
    TradePartiallyClosed,
    TradeClosed,
    /// Trade changed by a full recompute (purge, amend or explicit rebuild)
    TradeRecomputed,
    /// Trade no longer derivable from the fill log
    TradeRemoved,
}

impl AuditAction {
    pub fn label(&self) -> &'static str {
        match self {
            AuditAction::TradeOpened => "TRADE_OPENED",
            AuditAction::TradeExtended => "TRADE_EXTENDED",
            AuditAction::TradePartiallyClosed => "TRADE_PARTIALLY_CLOSED",
            AuditAction::TradeClosed => "TRADE_CLOSED",
            AuditAction::TradeRecomputed => "TRADE_RECOMPUTED",
            AuditAction::TradeRemoved => "TRADE_REMOVED",
        }
    }
}

/// Before/after record of one trade mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub owner_id: OwnerId,
    pub symbol: Symbol,
    pub trade_id: TradeId,
    pub action: AuditAction,
    pub before: Option<Trade>,
    pub after: Option<Trade>,
    /// Fill that caused the mutation; None for an explicit recompute
    pub triggering_fill_id: Option<FillId>,
}
