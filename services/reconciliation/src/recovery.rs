//! Boot-time recovery from the fill store
//!
//! Recovery process:
//! 1. Load every readable record (torn or corrupt frames are skipped)
//! 2. Rebuild each key's fill log, applying purges and amendments in order
//! 3. Replay each key deterministically
//! 4. For keys never edited, check every replayed outcome against the
//!    outcome journaled when the fill was first applied
//! 5. Abort on divergence

use crate::audit::AuditSink;
use crate::config::EngineConfig;
use crate::error::RecoveryError;
use crate::service::ReconciliationService;
use persistence::records::JournalRecord;
use persistence::store::{FillStore, JournalFillStore, MemoryFillStore, StoreError};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use trade_types::fill::Fill;
use trade_types::ids::{FillId, PositionKey};
use trade_types::trade::ApplyOutcome;
use tracing::{error, info};

/// Summary of one recovery run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    /// Position keys rebuilt
    pub keys: usize,
    /// Records read from the store
    pub records: usize,
    /// Fills replayed after purges and amendments
    pub fills_replayed: usize,
    pub trades: usize,
    /// Store entries dropped as corrupt or undecodable
    pub skipped_records: usize,
    /// Journaled outcomes confirmed by replay
    pub verified_outcomes: usize,
    pub elapsed_ms: u64,
}

#[derive(Default)]
struct KeyLog {
    fills: Vec<Fill>,
    outcomes: Vec<(FillId, ApplyOutcome)>,
    /// Purged or amended since first applied
    edited: bool,
}

impl KeyLog {
    fn apply(&mut self, record: JournalRecord) {
        match record {
            JournalRecord::FillApplied { fill, outcome } => {
                self.outcomes.push((fill.id.clone(), outcome));
                self.fills.push(fill);
            }
            JournalRecord::FillPurged { fill_id, .. } => {
                self.fills.retain(|f| f.id != fill_id);
                self.edited = true;
            }
            JournalRecord::FillAmended { fill } => {
                if let Some(existing) = self.fills.iter_mut().find(|f| f.id == fill.id) {
                    *existing = fill;
                }
                self.edited = true;
            }
        }
    }
}

/// Journal-backed store when `config` names a directory, in-memory otherwise.
pub fn open_store(config: &EngineConfig) -> Result<Arc<dyn FillStore>, StoreError> {
    Ok(match config.journal_config() {
        Some(journal) => Arc::new(JournalFillStore::open(journal)?),
        None => Arc::new(MemoryFillStore::new()),
    })
}

impl ReconciliationService {
    /// Rebuild a service from everything `store` holds.
    pub fn recover(
        config: EngineConfig,
        store: Arc<dyn FillStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<(Self, RecoveryReport), RecoveryError> {
        let started = Instant::now();
        let loaded = store.load()?;
        let service = Self::new(config, store, audit);

        let mut report = RecoveryReport {
            records: loaded.records.len(),
            skipped_records: loaded.skipped,
            ..Default::default()
        };

        let mut logs: BTreeMap<PositionKey, KeyLog> = BTreeMap::new();
        for record in loaded.records {
            logs.entry(record.position_key()).or_default().apply(record);
        }

        for (key, log) in logs {
            report.fills_replayed += log.fills.len();
            let ledger = service
                .engine
                .replay(key.clone(), log.fills)
                .map_err(|source| {
                    error!(key = %key, error = %source, "Replay failed during recovery");
                    RecoveryError::Replay {
                        key: key.clone(),
                        source,
                    }
                })?;

            if !log.edited {
                for (fill_id, expected) in log.outcomes {
                    let actual = ledger.outcome(&fill_id);
                    if actual != Some(&expected) {
                        error!(
                            key = %key,
                            fill_id = %fill_id,
                            expected = ?expected,
                            actual = ?actual,
                            "Recovered outcome diverges from journal"
                        );
                        return Err(RecoveryError::Divergence {
                            key,
                            fill_id,
                            expected,
                            actual: actual.cloned(),
                        });
                    }
                    report.verified_outcomes += 1;
                }
            }

            report.keys += 1;
            report.trades += ledger.trades().len();
            service.ledger.insert(ledger);
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            keys = report.keys,
            records = report.records,
            fills = report.fills_replayed,
            trades = report.trades,
            skipped = report.skipped_records,
            elapsed_ms = report.elapsed_ms,
            "Recovery complete"
        );
        Ok((service, report))
    }
}
