//! Reconciliation service
//!
//! Owns the keyed ledger, the fill store and the audit sink. Every fill goes
//! through the same sequence under its key's lock:
//!
//! 1. Flush audit events left over from an earlier back-pressure failure
//! 2. Plan (validation, idempotency, ordering)
//! 3. Append the `FillApplied` record to the store
//! 4. Commit the plan to the in-memory ledger
//! 5. Hand the resulting audit events to the sink
//!
//! A store failure at step 3 leaves the ledger untouched. An audit failure
//! at step 5 leaves the fill applied with its events pending; they are
//! retried before the next operation on the same key.

use crate::audit::AuditSink;
use crate::config::EngineConfig;
use crate::engine::{Plan, ReconciliationEngine};
use crate::error::ReconcileError;
use crate::events::{AuditAction, AuditEvent};
use crate::ingest::{AppliedLine, BatchReport, FillCandidate, LineError};
use crate::ledger::{PositionLedger, SymbolLedger};
use chrono::Utc;
use persistence::records::JournalRecord;
use persistence::store::FillStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use trade_types::errors::FillError;
use trade_types::fill::Fill;
use trade_types::ids::{FillId, OwnerId, PositionKey, Symbol};
use trade_types::position::Position;
use trade_types::trade::{ApplyOutcome, Trade};
use tracing::{debug, error, info, warn};

pub struct ReconciliationService {
    pub(crate) config: EngineConfig,
    pub(crate) engine: ReconciliationEngine,
    pub(crate) ledger: PositionLedger,
    pub(crate) store: Arc<dyn FillStore>,
    pub(crate) audit: Arc<dyn AuditSink>,
}

impl ReconciliationService {
    /// Create a service with an empty ledger.
    ///
    /// Use `recover` instead when `store` may already hold records.
    pub fn new(config: EngineConfig, store: Arc<dyn FillStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            engine: ReconciliationEngine::new(config.matching_policy),
            config,
            ledger: PositionLedger::new(),
            store,
            audit,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &PositionLedger {
        &self.ledger
    }

    // ── Ingestion ───────────────────────────────────────────────────

    /// Apply one fill for `owner`.
    ///
    /// Re-submitting an applied fill id returns the original outcome.
    pub async fn ingest_fill(&self, owner: &OwnerId, fill: Fill) -> Result<ApplyOutcome, ReconcileError> {
        check_owner(owner, &fill)?;
        fill.validate()?;

        let handle = self.ledger.load_or_init(&fill.position_key());
        let mut ledger = handle.lock().await;
        self.apply_locked(&mut ledger, fill).await
    }

    /// Validate a loosely typed candidate, then ingest it.
    pub async fn ingest_candidate(
        &self,
        owner: &OwnerId,
        candidate: &FillCandidate,
    ) -> Result<ApplyOutcome, ReconcileError> {
        let fill = candidate.to_fill(owner, 0, self.config.max_symbol_len)?;
        self.ingest_fill(owner, fill).await
    }

    /// Ingest a batch of candidates.
    ///
    /// Invalid lines are reported and never abort the batch. Valid fills
    /// are grouped by symbol, ordered by `(timestamp, sequence)` and applied
    /// group by group, with up to `batch_parallelism` groups in flight.
    /// Raising `cancel` stops each group before its next fill.
    pub async fn ingest_batch(
        self: &Arc<Self>,
        owner: &OwnerId,
        candidates: &[FillCandidate],
        cancel: Option<watch::Receiver<bool>>,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        let mut groups: BTreeMap<Symbol, Vec<(usize, Fill)>> = BTreeMap::new();

        for (index, candidate) in candidates.iter().enumerate() {
            let line = index + 1;
            match candidate.to_fill(owner, line as u64, self.config.max_symbol_len) {
                Ok(fill) => groups.entry(fill.symbol.clone()).or_default().push((line, fill)),
                Err(e) => report.errors.push(LineError {
                    line,
                    fill_id: candidate.id.as_deref().map(FillId::from),
                    reason: ReconcileError::from(e).to_string(),
                }),
            }
        }

        let permits = Arc::new(Semaphore::new(self.config.batch_parallelism.max(1)));
        let mut tasks = Vec::with_capacity(groups.len());

        for (symbol, mut group) in groups {
            group.sort_by_key(|(_, fill)| fill.order_key());
            let lines: Vec<usize> = group.iter().map(|(line, _)| *line).collect();
            let service = Arc::clone(self);
            let permits = Arc::clone(&permits);
            let cancel = cancel.clone();

            let handle = tokio::spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                service.apply_group(group, cancel).await
            });
            tasks.push((symbol, lines, handle));
        }

        for (symbol, lines, handle) in tasks {
            match handle.await {
                Ok(group) => {
                    report.applied.extend(group.applied);
                    report.errors.extend(group.errors);
                    report.skipped.extend(group.skipped);
                    report.cancelled |= group.cancelled;
                }
                Err(e) => {
                    error!(owner = %owner, symbol = %symbol, error = %e, "Batch group task failed");
                    report.errors.extend(lines.into_iter().map(|line| LineError {
                        line,
                        fill_id: None,
                        reason: format!("group task failed: {}", e),
                    }));
                }
            }
        }

        report.sort();
        info!(
            owner = %owner,
            lines = candidates.len(),
            applied = report.applied.len(),
            errors = report.errors.len(),
            skipped = report.skipped.len(),
            cancelled = report.cancelled,
            "Batch ingested"
        );
        report
    }

    /// Apply one symbol's fills in order under a single lock acquisition.
    async fn apply_group(
        &self,
        group: Vec<(usize, Fill)>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        let Some((_, first)) = group.first() else {
            return report;
        };
        let handle = self.ledger.load_or_init(&first.position_key());
        let mut ledger = handle.lock().await;

        let mut fills = group.into_iter();
        while let Some((line, fill)) = fills.next() {
            if is_cancelled(&cancel) {
                report.cancelled = true;
                report.skipped.push(line);
                report.skipped.extend(fills.by_ref().map(|(line, _)| line));
                break;
            }

            let fill_id = fill.id.clone();
            match self.apply_locked(&mut ledger, fill).await {
                Ok(outcome) => report.applied.push(AppliedLine {
                    line,
                    fill_id,
                    outcome,
                }),
                Err(e) => report.errors.push(LineError {
                    line,
                    fill_id: Some(fill_id),
                    reason: e.to_string(),
                }),
            }
        }
        report
    }

    async fn apply_locked(
        &self,
        ledger: &mut SymbolLedger,
        fill: Fill,
    ) -> Result<ApplyOutcome, ReconcileError> {
        self.drain_audit(ledger).await?;

        let plan = match self.engine.plan(ledger, &fill) {
            Ok(Plan::Apply(plan)) => plan,
            Ok(Plan::Duplicate(outcome)) => {
                debug!(key = %ledger.key(), fill_id = %fill.id, "Duplicate fill ignored");
                return Ok(outcome);
            }
            Err(e @ ReconcileError::OutOfOrderFill { .. }) => {
                warn!(key = %ledger.key(), error = %e, "Out-of-order fill rejected");
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        self.persist(JournalRecord::FillApplied {
            fill: fill.clone(),
            outcome: plan.outcome.clone(),
        })
        .await?;

        let fill_id = fill.id.clone();
        let applied = self.engine.commit(ledger, fill, plan)?;

        for mutation in &applied.mutations {
            let trade = &mutation.after;
            match mutation.action {
                AuditAction::TradeOpened => info!(
                    key = %ledger.key(),
                    trade_id = %trade.id,
                    side = ?trade.side,
                    quantity = %trade.quantity,
                    price = %trade.open_price,
                    "Trade opened"
                ),
                AuditAction::TradeClosed => info!(
                    key = %ledger.key(),
                    trade_id = %trade.id,
                    pnl = %trade.pnl,
                    net_pnl = %trade.net_pnl(),
                    "Trade closed"
                ),
                _ => {}
            }
        }

        ledger.pending_audit.extend(
            applied
                .mutations
                .into_iter()
                .map(|m| m.into_event(Some(fill_id.clone()))),
        );
        self.drain_audit(ledger).await?;
        Ok(applied.outcome)
    }

    /// Append `record` on the blocking pool. The caller still holds the
    /// key's lock, so records of one key reach the store in order.
    async fn persist(&self, record: JournalRecord) -> Result<u64, ReconcileError> {
        let store = Arc::clone(&self.store);
        let key = record.position_key();
        let kind = record.kind();

        let result = match tokio::task::spawn_blocking(move || store.append(&record)).await {
            Ok(appended) => appended.map_err(|e| e.to_string()),
            Err(e) => Err(format!("append task failed: {}", e)),
        };
        result.map_err(|reason| {
            error!(key = %key, kind, error = %reason, "Fill store append failed");
            ReconcileError::PersistenceFailure(reason)
        })
    }

    async fn drain_audit(&self, ledger: &mut SymbolLedger) -> Result<(), ReconcileError> {
        while let Some(event) = ledger.pending_audit.front() {
            if let Err(e) = self.audit.enqueue(event).await {
                let pending = ledger.pending_audit.len();
                warn!(key = %ledger.key(), pending, error = %e, "Audit events pending");
                return Err(ReconcileError::AuditBacklog { pending });
            }
            ledger.pending_audit.pop_front();
        }
        Ok(())
    }

    // ── Queries ─────────────────────────────────────────────────────

    /// Position snapshot; flat when the key has never seen a fill.
    pub async fn get_position(&self, owner: &OwnerId, symbol: &Symbol) -> Position {
        match self.ledger.load(&key(owner, symbol)) {
            Ok(handle) => handle.lock().await.position().clone(),
            Err(_) => Position::flat(owner.clone(), symbol.clone()),
        }
    }

    /// Position snapshot for a key that must exist.
    pub async fn load_position(&self, owner: &OwnerId, symbol: &Symbol) -> Result<Position, ReconcileError> {
        let handle = self.ledger.load(&key(owner, symbol))?;
        let ledger = handle.lock().await;
        Ok(ledger.position().clone())
    }

    /// Trades for the key in creation order.
    pub async fn trades(&self, owner: &OwnerId, symbol: &Symbol) -> Vec<Trade> {
        match self.ledger.load(&key(owner, symbol)) {
            Ok(handle) => handle.lock().await.trades().to_vec(),
            Err(_) => Vec::new(),
        }
    }

    pub async fn open_trade(&self, owner: &OwnerId, symbol: &Symbol) -> Option<Trade> {
        let handle = self.ledger.load(&key(owner, symbol)).ok()?;
        let ledger = handle.lock().await;
        ledger.open_trade().cloned()
    }

    /// Accepted fills for the key in replay order.
    pub async fn fills(&self, owner: &OwnerId, symbol: &Symbol) -> Vec<Fill> {
        match self.ledger.load(&key(owner, symbol)) {
            Ok(handle) => handle.lock().await.fills().to_vec(),
            Err(_) => Vec::new(),
        }
    }

    // ── Recompute and administrative edits ──────────────────────────

    /// Drop the key's derived trades and replay its fills.
    ///
    /// Incremental application and replay agree, so on a healthy ledger
    /// this changes nothing and emits no audit events.
    pub async fn recompute_from_scratch(
        &self,
        owner: &OwnerId,
        symbol: &Symbol,
    ) -> Result<Vec<Trade>, ReconcileError> {
        let key = key(owner, symbol);
        let handle = self.ledger.load(&key)?;
        let mut ledger = handle.lock().await;
        self.drain_audit(&mut ledger).await?;

        let rebuilt = self.engine.replay(key, ledger.fills().to_vec())?;
        self.install_rebuilt(&mut ledger, rebuilt, None).await
    }

    /// Remove a fill from the key's log and recompute its trades.
    pub async fn purge_fill(
        &self,
        owner: &OwnerId,
        symbol: &Symbol,
        fill_id: &FillId,
    ) -> Result<Vec<Trade>, ReconcileError> {
        let key = key(owner, symbol);
        let handle = self.ledger.load(&key)?;
        let mut ledger = handle.lock().await;
        self.drain_audit(&mut ledger).await?;

        if ledger.fill(fill_id).is_none() {
            return Err(ReconcileError::FillNotFound {
                key,
                fill_id: fill_id.clone(),
            });
        }
        let remaining: Vec<Fill> = ledger
            .fills()
            .iter()
            .filter(|f| &f.id != fill_id)
            .cloned()
            .collect();
        let rebuilt = self.engine.replay(key, remaining)?;

        self.persist(JournalRecord::FillPurged {
            owner_id: owner.clone(),
            symbol: symbol.clone(),
            fill_id: fill_id.clone(),
            timestamp: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        })
        .await?;
        info!(key = %ledger.key(), fill_id = %fill_id, "Fill purged");

        self.install_rebuilt(&mut ledger, rebuilt, Some(fill_id.clone())).await
    }

    /// Replace an applied fill's contents (same id) and recompute.
    pub async fn amend_fill(&self, owner: &OwnerId, fill: Fill) -> Result<Vec<Trade>, ReconcileError> {
        check_owner(owner, &fill)?;
        fill.validate()?;

        let key = fill.position_key();
        let handle = self.ledger.load(&key)?;
        let mut ledger = handle.lock().await;
        self.drain_audit(&mut ledger).await?;

        if ledger.fill(&fill.id).is_none() {
            return Err(ReconcileError::FillNotFound {
                key,
                fill_id: fill.id.clone(),
            });
        }
        let amended: Vec<Fill> = ledger
            .fills()
            .iter()
            .map(|f| if f.id == fill.id { fill.clone() } else { f.clone() })
            .collect();
        let rebuilt = self.engine.replay(key, amended)?;

        self.persist(JournalRecord::FillAmended { fill: fill.clone() }).await?;
        info!(key = %ledger.key(), fill_id = %fill.id, "Fill amended");

        self.install_rebuilt(&mut ledger, rebuilt, Some(fill.id)).await
    }

    /// Swap in a replayed ledger and audit every trade that changed.
    async fn install_rebuilt(
        &self,
        ledger: &mut SymbolLedger,
        rebuilt: SymbolLedger,
        trigger: Option<FillId>,
    ) -> Result<Vec<Trade>, ReconcileError> {
        let mut events = Vec::new();

        for trade in rebuilt.trades() {
            let before = ledger.trade(trade.id);
            if before != Some(trade) {
                events.push(AuditEvent {
                    owner_id: trade.owner_id.clone(),
                    symbol: trade.symbol.clone(),
                    trade_id: trade.id,
                    action: AuditAction::TradeRecomputed,
                    before: before.cloned(),
                    after: Some(trade.clone()),
                    triggering_fill_id: trigger.clone(),
                });
            }
        }
        for trade in ledger.trades() {
            if rebuilt.trade(trade.id).is_none() {
                events.push(AuditEvent {
                    owner_id: trade.owner_id.clone(),
                    symbol: trade.symbol.clone(),
                    trade_id: trade.id,
                    action: AuditAction::TradeRemoved,
                    before: Some(trade.clone()),
                    after: None,
                    triggering_fill_id: trigger.clone(),
                });
            }
        }

        if !events.is_empty() {
            info!(key = %ledger.key(), changed = events.len(), "Trades recomputed");
        }
        ledger.replace_derived(rebuilt);
        ledger.pending_audit.extend(events);
        self.drain_audit(ledger).await?;
        Ok(ledger.trades().to_vec())
    }
}

fn key(owner: &OwnerId, symbol: &Symbol) -> PositionKey {
    PositionKey::new(owner.clone(), symbol.clone())
}

fn check_owner(owner: &OwnerId, fill: &Fill) -> Result<(), FillError> {
    if &fill.owner_id != owner {
        return Err(FillError::OwnerMismatch {
            fill_id: fill.id.to_string(),
            fill_owner: fill.owner_id.to_string(),
            expected: owner.to_string(),
        });
    }
    Ok(())
}

fn is_cancelled(cancel: &Option<watch::Receiver<bool>>) -> bool {
    cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::ChannelAuditSink;
    use persistence::store::MemoryFillStore;
    use rust_decimal::Decimal;
    use std::time::Duration;
    use trade_types::prelude::*;

    fn service() -> (ReconciliationService, tokio::sync::mpsc::Receiver<AuditEvent>) {
        let (sink, rx) = ChannelAuditSink::new(64, Duration::from_millis(50));
        let service = ReconciliationService::new(
            EngineConfig::default(),
            Arc::new(MemoryFillStore::new()),
            Arc::new(sink),
        );
        (service, rx)
    }

    fn fill(id: &str, side: Side, price: u64, qty: u64, ts: i64) -> Fill {
        Fill::try_new(
            FillId::new(id),
            OwnerId::new("alice"),
            Symbol::new("AAPL"),
            side,
            Decimal::from(price),
            Decimal::from(qty),
            Decimal::ZERO,
            ts,
            0,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_ingest_fill_emits_audit_event() {
        let (service, mut rx) = service();
        let owner = OwnerId::new("alice");
        let outcome = service.ingest_fill(&owner, fill("f-1", Side::BUY, 10, 100, 1)).await.unwrap();

        assert_eq!(outcome.kind, MutationKind::Opened);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.action, AuditAction::TradeOpened);
        assert_eq!(event.trade_id, outcome.trade_id);
        assert_eq!(event.triggering_fill_id, Some(FillId::new("f-1")));
    }

    #[tokio::test]
    async fn test_owner_mismatch_rejected() {
        let (service, _rx) = service();
        let err = service
            .ingest_fill(&OwnerId::new("bob"), fill("f-1", Side::BUY, 10, 100, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidFill(FillError::OwnerMismatch { .. })));
        assert!(service.ledger().is_empty());
    }

    #[tokio::test]
    async fn test_queries_on_unknown_key() {
        let (service, _rx) = service();
        let owner = OwnerId::new("alice");
        let symbol = Symbol::new("AAPL");
        assert!(service.get_position(&owner, &symbol).await.is_flat());
        assert!(service.trades(&owner, &symbol).await.is_empty());
        assert!(service.open_trade(&owner, &symbol).await.is_none());
        assert!(matches!(
            service.load_position(&owner, &symbol).await.unwrap_err(),
            ReconcileError::NotFound { .. }
        ));
        assert!(matches!(
            service.recompute_from_scratch(&owner, &symbol).await.unwrap_err(),
            ReconcileError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_recompute_is_silent_on_healthy_ledger() {
        let (service, mut rx) = service();
        let owner = OwnerId::new("alice");
        service.ingest_fill(&owner, fill("f-1", Side::BUY, 10, 100, 1)).await.unwrap();
        service.ingest_fill(&owner, fill("f-2", Side::SELL, 12, 40, 2)).await.unwrap();
        while rx.try_recv().is_ok() {}

        let before = service.trades(&owner, &Symbol::new("AAPL")).await;
        let after = service.recompute_from_scratch(&owner, &Symbol::new("AAPL")).await.unwrap();
        assert_eq!(before, after);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_purge_unknown_fill() {
        let (service, _rx) = service();
        let owner = OwnerId::new("alice");
        service.ingest_fill(&owner, fill("f-1", Side::BUY, 10, 100, 1)).await.unwrap();
        let err = service
            .purge_fill(&owner, &Symbol::new("AAPL"), &FillId::new("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::FillNotFound { .. }));
    }

    #[tokio::test]
    async fn test_batch_cancelled_before_start_skips_everything() {
        let (service, _rx) = service();
        let service = Arc::new(service);
        let (tx, rx) = watch::channel(true);
        let candidates: Vec<FillCandidate> = (1..=3)
            .map(|i| FillCandidate {
                id: Some(format!("f-{}", i)),
                symbol: Some("AAPL".into()),
                side: Some("BUY".into()),
                price: Some("10".into()),
                quantity: Some("1".into()),
                commission: None,
                timestamp: Some(i.to_string()),
                sequence: None,
            })
            .collect();

        let report = service.ingest_batch(&OwnerId::new("alice"), &candidates, Some(rx)).await;
        drop(tx);
        assert!(report.cancelled);
        assert!(report.applied.is_empty());
        assert_eq!(report.skipped, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_overflowing_fill_is_never_journaled() {
        let store = Arc::new(MemoryFillStore::new());
        let (sink, _events) = ChannelAuditSink::new(64, Duration::from_millis(50));
        let service = ReconciliationService::new(EngineConfig::default(), store.clone(), Arc::new(sink));
        let owner = OwnerId::new("alice");
        let huge = Decimal::from_i128_with_scale(40_000_000_000_000_000_000_000_000_000, 0);

        let mut first = fill("f-1", Side::BUY, 1, 1, 1);
        first.price = Price::try_new(huge).unwrap();
        let mut second = first.clone();
        second.id = FillId::new("f-2");
        second.timestamp = 2;

        service.ingest_fill(&owner, first).await.unwrap();
        let err = service.ingest_fill(&owner, second).await.unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidFill(FillError::Overflow(_))));
        assert_eq!(store.len(), 1);

        // The key still recomputes cleanly from what was journaled
        let trades = service.recompute_from_scratch(&owner, &Symbol::new("AAPL")).await.unwrap();
        assert_eq!(trades[0].quantity, Quantity::from_u64(1));
    }

    /// Store whose append parks until the test releases it
    struct GatedStore {
        entered: tokio::sync::mpsc::UnboundedSender<()>,
        release: std::sync::Mutex<std::sync::mpsc::Receiver<()>>,
        inner: MemoryFillStore,
    }

    impl FillStore for GatedStore {
        fn append(&self, record: &JournalRecord) -> Result<u64, persistence::store::StoreError> {
            let _ = self.entered.send(());
            let release = self.release.lock().map_err(|_| persistence::store::StoreError::Poisoned)?;
            // Gives up rather than hanging when the runtime thread is the one parked here
            release
                .recv_timeout(Duration::from_secs(2))
                .map_err(|_| persistence::store::StoreError::Poisoned)?;
            self.inner.append(record)
        }

        fn load(&self) -> Result<persistence::store::LoadedJournal, persistence::store::StoreError> {
            self.inner.load()
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_store_append_runs_off_the_runtime_thread() {
        let (entered_tx, mut entered_rx) = tokio::sync::mpsc::unbounded_channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let store = Arc::new(GatedStore {
            entered: entered_tx,
            release: std::sync::Mutex::new(release_rx),
            inner: MemoryFillStore::new(),
        });
        let (sink, _events) = ChannelAuditSink::new(64, Duration::from_millis(50));
        let service = Arc::new(ReconciliationService::new(
            EngineConfig::default(),
            store.clone(),
            Arc::new(sink),
        ));

        let ingest = tokio::spawn({
            let service = Arc::clone(&service);
            async move {
                service
                    .ingest_fill(&OwnerId::new("alice"), fill("f-1", Side::BUY, 10, 100, 1))
                    .await
            }
        });

        // Only reachable while the append is parked if it runs on the blocking pool
        entered_rx.recv().await.unwrap();
        release_tx.send(()).unwrap();

        let outcome = ingest.await.unwrap().unwrap();
        assert_eq!(outcome.kind, MutationKind::Opened);
        assert_eq!(store.inner.len(), 1);
    }
}
