//! Error types shared by the ledger and the reconciliation engine
//!
//! Comprehensive error taxonomy using thiserror

use thiserror::Error;

/// Fill validation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FillError {
    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("Invalid commission: {0}")]
    InvalidCommission(String),

    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("Invalid side: {0}")]
    InvalidSide(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Arithmetic overflow: {0}")]
    Overflow(String),

    #[error("Missing field: {field}")]
    MissingField { field: &'static str },

    #[error("Fill {fill_id} belongs to owner {fill_owner}, not {expected}")]
    OwnerMismatch {
        fill_id: String,
        fill_owner: String,
        expected: String,
    },
}

/// Position ledger errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("Ledger invariant violated for {key}: {reason}")]
    InvariantViolation { key: String, reason: String },

    #[error("Lot quantity must be positive (fill {fill_id})")]
    EmptyLot { fill_id: String },

    #[error("Cannot push a {pushed} lot onto an open {open} position")]
    DirectionMismatch { open: String, pushed: String },
}
