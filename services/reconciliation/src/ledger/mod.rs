//! Position ledger
//!
//! Keyed store of per-`(owner, symbol)` state. Each key sits behind its own
//! async mutex, so all work for one key is serialized while distinct keys
//! proceed in parallel. Map guards are never held across an await.

mod symbol;

pub use symbol::SymbolLedger;

use crate::error::ReconcileError;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use trade_types::ids::PositionKey;

pub type LedgerHandle = Arc<Mutex<SymbolLedger>>;

#[derive(Default)]
pub struct PositionLedger {
    entries: DashMap<PositionKey, LedgerHandle>,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for `key`, creating a flat entry if none exists.
    pub fn load_or_init(&self, key: &PositionKey) -> LedgerHandle {
        if let Some(existing) = self.entries.get(key) {
            return Arc::clone(existing.value());
        }
        self.entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(SymbolLedger::new(key.clone()))))
            .value()
            .clone()
    }

    /// Handle for an existing `key`.
    pub fn load(&self, key: &PositionKey) -> Result<LedgerHandle, ReconcileError> {
        self.entries
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ReconcileError::NotFound { key: key.clone() })
    }

    pub(crate) fn insert(&self, ledger: SymbolLedger) {
        self.entries
            .insert(ledger.key().clone(), Arc::new(Mutex::new(ledger)));
    }

    /// All keys, sorted
    pub fn keys(&self) -> Vec<PositionKey> {
        let mut keys: Vec<PositionKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
