//! Audit hand-off
//!
//! Audit storage lives outside this crate. The service only guarantees that
//! each trade mutation's event was accepted by an `AuditSink` before the
//! ingest that caused it reports success.

use crate::events::AuditEvent;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::info;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuditError {
    #[error("Audit queue full after {0:?}")]
    Timeout(Duration),

    #[error("Audit queue closed")]
    Closed,
}

/// Destination for audit events
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Queue one event, waiting a bounded time for capacity.
    async fn enqueue(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

/// Bounded tokio channel sink
#[derive(Clone)]
pub struct ChannelAuditSink {
    sender: mpsc::Sender<AuditEvent>,
    timeout: Duration,
}

impl ChannelAuditSink {
    /// Create a sink and the receiver its events arrive on.
    pub fn new(capacity: usize, timeout: Duration) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender, timeout }, receiver)
    }
}

#[async_trait]
impl AuditSink for ChannelAuditSink {
    async fn enqueue(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self.sender
            .send_timeout(event.clone(), self.timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => AuditError::Timeout(self.timeout),
                SendTimeoutError::Closed(_) => AuditError::Closed,
            })
    }
}

/// Drain audit events into the log. Returns the number of events seen
/// once every sender is dropped.
pub async fn run_audit_logger(mut rx: mpsc::Receiver<AuditEvent>) -> u64 {
    let mut seen = 0u64;
    while let Some(event) = rx.recv().await {
        seen += 1;
        let after = event.after.as_ref();
        info!(
            action = event.action.label(),
            owner = %event.owner_id,
            symbol = %event.symbol,
            trade_id = %event.trade_id,
            fill_id = ?event.triggering_fill_id.as_ref().map(|f| f.as_str()),
            status = ?after.map(|t| t.status),
            remaining = ?after.map(|t| t.remaining_quantity.to_string()),
            pnl = ?after.map(|t| t.pnl.to_string()),
            "AUDIT"
        );
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AuditAction;
    use rust_decimal::Decimal;
    use trade_types::prelude::*;

    fn event() -> AuditEvent {
        let fill = Fill::try_new(
            FillId::new("f-1"),
            OwnerId::new("alice"),
            Symbol::new("AAPL"),
            Side::BUY,
            Decimal::from(10),
            Decimal::from(1),
            Decimal::ZERO,
            1,
            0,
        )
        .unwrap();
        let trade = Trade::open(&fill, fill.quantity, fill.commission);
        AuditEvent {
            owner_id: fill.owner_id.clone(),
            symbol: fill.symbol.clone(),
            trade_id: trade.id,
            action: AuditAction::TradeOpened,
            before: None,
            after: Some(trade),
            triggering_fill_id: Some(fill.id),
        }
    }

    #[tokio::test]
    async fn test_channel_sink_delivers() {
        let (sink, mut rx) = ChannelAuditSink::new(4, Duration::from_millis(10));
        sink.enqueue(&event()).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.action, AuditAction::TradeOpened);
    }

    #[tokio::test]
    async fn test_channel_sink_times_out_when_full() {
        let (sink, _rx) = ChannelAuditSink::new(1, Duration::from_millis(10));
        sink.enqueue(&event()).await.unwrap();
        let err = sink.enqueue(&event()).await.unwrap_err();
        assert_eq!(err, AuditError::Timeout(Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn test_channel_sink_reports_closed() {
        let (sink, rx) = ChannelAuditSink::new(1, Duration::from_millis(10));
        drop(rx);
        assert_eq!(sink.enqueue(&event()).await.unwrap_err(), AuditError::Closed);
    }

    #[tokio::test]
    async fn test_logger_counts_events() {
        let (sink, rx) = ChannelAuditSink::new(8, Duration::from_millis(10));
        let logger = tokio::spawn(run_audit_logger(rx));
        for _ in 0..3 {
            sink.enqueue(&event()).await.unwrap();
        }
        drop(sink);
        assert_eq!(logger.await.unwrap(), 3);
    }
}
