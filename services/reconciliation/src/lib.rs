//! Fill Reconciliation Service
//!
//! Turns a stream of trade executions (fills) into round-trip trades with
//! realized P&L, tracking the open position of every `(owner, symbol)` key.
//!
//! **Key Invariants:**
//! - At most one OPEN trade per key
//! - A fill id is applied at most once per key
//! - Incremental application and full replay produce identical trades
//! - A fill is never applied in memory before its journal record is written
//!
//! # Architecture
//!
//! ```text
//!   candidates ──▶ ingest ──▶ ReconciliationService
//!                                  │  per-key lock (DashMap)
//!                           ┌──────┴───────┐
//!                           │  engine      │ plan ─▶ FillStore ─▶ commit
//!                           └──────┬───────┘
//!                                  │
//!                             AuditSink
//! ```

pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod ingest;
pub mod ledger;
pub mod recovery;
pub mod service;

pub use audit::{run_audit_logger, AuditError, AuditSink, ChannelAuditSink};
pub use config::{EngineConfig, MatchingPolicy};
pub use engine::{Applied, ReconciliationEngine, TradeMutation};
pub use error::{ReconcileError, RecoveryError};
pub use events::{AuditAction, AuditEvent};
pub use ingest::{AppliedLine, BatchReport, FillCandidate, LineError};
pub use ledger::{PositionLedger, SymbolLedger};
pub use recovery::{open_store, RecoveryReport};
pub use service::ReconciliationService;

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
