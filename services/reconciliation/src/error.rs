//! Reconciliation error taxonomy

use persistence::store::StoreError;
use thiserror::Error;
use trade_types::errors::{FillError, LedgerError};
use trade_types::fill::FillOrder;
use trade_types::ids::{FillId, PositionKey};
use trade_types::trade::ApplyOutcome;

/// Error returned by ledger operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReconcileError {
    #[error("Invalid fill: {0}")]
    InvalidFill(#[from] FillError),

    #[error("Out-of-order fill {fill_id}: last applied {last:?}, received {received:?}")]
    OutOfOrderFill {
        fill_id: FillId,
        last: FillOrder,
        received: FillOrder,
    },

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("No position for {key}")]
    NotFound { key: PositionKey },

    #[error("Fill {fill_id} not found for {key}")]
    FillNotFound { key: PositionKey, fill_id: FillId },

    #[error("Audit queue backlog: {pending} events pending")]
    AuditBacklog { pending: usize },

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl ReconcileError {
    /// Whether the same call may succeed if repeated unchanged.
    ///
    /// Input errors are final; storage and audit back-pressure are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReconcileError::PersistenceFailure(_) | ReconcileError::AuditBacklog { .. }
        )
    }
}

/// Boot-time journal replay failure
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Replay of {key} failed: {source}")]
    Replay {
        key: PositionKey,
        source: ReconcileError,
    },

    #[error("Outcome divergence for fill {fill_id} on {key}: journaled {expected:?}, replayed {actual:?}")]
    Divergence {
        key: PositionKey,
        fill_id: FillId,
        expected: ApplyOutcome,
        actual: Option<ApplyOutcome>,
    },
}
