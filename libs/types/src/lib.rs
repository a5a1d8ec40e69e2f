//! Types library for fill reconciliation
//!
//! Core type definitions shared by the journal, the position ledger and the
//! reconciliation engine. All arithmetic is decimal so that replaying a fill
//! history reproduces identical trades.
//!
//! # Modules
//! - `ids`: Identifiers (FillId, OwnerId, Symbol, TradeId, PositionKey)
//! - `numeric`: Fixed-point decimal types (Price, Quantity)
//! - `fill`: Execution records
//! - `trade`: Derived round-trip trades and apply outcomes
//! - `position`: Position state machine and FIFO lot queue
//! - `errors`: Error taxonomy

pub mod errors;
pub mod fill;
pub mod ids;
pub mod numeric;
pub mod position;
pub mod trade;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::errors::*;
    pub use crate::fill::*;
    pub use crate::ids::*;
    pub use crate::numeric::*;
    pub use crate::position::*;
    pub use crate::trade::*;
}
