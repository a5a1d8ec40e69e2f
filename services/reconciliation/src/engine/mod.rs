//! Reconciliation engine
//!
//! Turns fills into trade mutations for one `(owner, symbol)` ledger.
//! Applying a fill is split in two so the caller can journal in between:
//! `plan` validates, classifies and computes the resulting trades without
//! touching state, `commit` stores them and cannot fail on valid input.

mod executor;
mod planner;

pub use planner::{FillPlan, Plan};

use crate::config::MatchingPolicy;
use crate::error::ReconcileError;
use crate::events::{AuditAction, AuditEvent};
use crate::ledger::SymbolLedger;
use trade_types::fill::Fill;
use trade_types::ids::{FillId, PositionKey};
use trade_types::trade::{ApplyOutcome, Trade};

/// One trade change caused by a fill
#[derive(Debug, Clone, PartialEq)]
pub struct TradeMutation {
    pub action: AuditAction,
    pub before: Option<Trade>,
    pub after: Trade,
}

impl TradeMutation {
    pub fn into_event(self, triggering_fill_id: Option<FillId>) -> AuditEvent {
        AuditEvent {
            owner_id: self.after.owner_id.clone(),
            symbol: self.after.symbol.clone(),
            trade_id: self.after.id,
            action: self.action,
            before: self.before,
            after: Some(self.after),
            triggering_fill_id,
        }
    }
}

/// Result of `apply`/`commit`
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub outcome: ApplyOutcome,
    /// Empty for a duplicate
    pub mutations: Vec<TradeMutation>,
    pub duplicate: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconciliationEngine {
    policy: MatchingPolicy,
}

impl ReconciliationEngine {
    pub fn new(policy: MatchingPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> MatchingPolicy {
        self.policy
    }

    /// Validate `fill` against `ledger` and decide what it will do.
    pub fn plan(&self, ledger: &SymbolLedger, fill: &Fill) -> Result<Plan, ReconcileError> {
        planner::plan(self.policy, ledger, fill)
    }

    /// Execute a plan produced by `plan` for the same ledger state.
    pub fn commit(
        &self,
        ledger: &mut SymbolLedger,
        fill: Fill,
        plan: FillPlan,
    ) -> Result<Applied, ReconcileError> {
        executor::commit(ledger, fill, plan)
    }

    /// Plan and commit in one step, without persistence.
    pub fn apply(&self, ledger: &mut SymbolLedger, fill: Fill) -> Result<Applied, ReconcileError> {
        match self.plan(ledger, &fill)? {
            Plan::Duplicate(outcome) => Ok(Applied {
                outcome,
                mutations: Vec::new(),
                duplicate: true,
            }),
            Plan::Apply(plan) => self.commit(ledger, fill, plan),
        }
    }

    /// Rebuild a ledger for `key` from its fills.
    ///
    /// Fills are ordered by `(timestamp, sequence)` with ties kept in the
    /// given order, so replaying the accepted fill log of a ledger
    /// reproduces it exactly.
    pub fn replay(
        &self,
        key: PositionKey,
        fills: impl IntoIterator<Item = Fill>,
    ) -> Result<SymbolLedger, ReconcileError> {
        let mut ordered: Vec<Fill> = fills.into_iter().collect();
        ordered.sort_by_key(|f| f.order_key());

        let mut ledger = SymbolLedger::new(key);
        for fill in ordered {
            self.apply(&mut ledger, fill)?;
        }
        ledger.check_invariants()?;
        Ok(ledger)
    }
}
