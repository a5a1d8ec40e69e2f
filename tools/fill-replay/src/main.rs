//! Fill replay
//!
//! Reads a JSON-lines file of candidate fills for one owner, runs them through
//! the reconciliation service and prints the derived trades as JSON.
//!
//! Usage:
//!   fill-replay fills.jsonl --owner alice [--journal-dir ./journal] [--policy average_cost]
//!
//! With `--journal-dir`, fills already journaled there are recovered first
//! and re-imported lines are recognised as duplicates.

use anyhow::{Context, Result};
use clap::Parser;
use reconciliation::{
    open_store, run_audit_logger, ChannelAuditSink, EngineConfig, FillCandidate, LineError,
    MatchingPolicy, ReconciliationService,
};
use rust_decimal::Decimal;
use serde_json::json;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use trade_types::ids::OwnerId;
use trade_types::trade::Trade;

#[derive(Parser, Debug)]
#[command(name = "fill-replay")]
#[command(about = "Reconcile a JSON-lines fill file into round-trip trades")]
struct Args {
    /// JSON-lines file, one candidate fill per line
    input: PathBuf,

    /// Owner the fills belong to
    #[arg(long)]
    owner: String,

    /// Journal directory (overrides RECON_JOURNAL_DIR)
    #[arg(long)]
    journal_dir: Option<PathBuf>,

    /// Matching policy: fifo or average_cost (overrides RECON_MATCHING_POLICY)
    #[arg(long)]
    policy: Option<MatchingPolicy>,

    /// Symbol groups replayed concurrently (overrides RECON_BATCH_PARALLELISM)
    #[arg(long)]
    parallelism: Option<usize>,

    /// Include the per-line batch report in the output
    #[arg(long)]
    report: bool,
}

/// Realized P&L net of commission over all trades
fn total_net_pnl(trades: &[Trade]) -> Decimal {
    trades
        .iter()
        .fold(Decimal::ZERO, |total, t| total.saturating_add(t.net_pnl()))
}

/// Lines of an input file, split into parsed candidates and parse failures
#[derive(Debug, Default)]
struct InputLines {
    candidates: Vec<FillCandidate>,
    /// File line of each candidate
    file_lines: Vec<usize>,
    /// Lines that are not a JSON candidate, keyed by file line
    unparseable: Vec<LineError>,
}

/// Candidates from non-blank lines, with the file line each came from.
fn read_candidates(path: &PathBuf) -> Result<InputLines> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut input = InputLines::default();

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("reading {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<FillCandidate>(&line) {
            Ok(candidate) => {
                input.candidates.push(candidate);
                input.file_lines.push(index + 1);
            }
            Err(e) => input.unparseable.push(LineError {
                line: index + 1,
                fill_id: None,
                reason: format!("Invalid JSON: {}", e),
            }),
        }
    }
    Ok(input)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = EngineConfig::from_env();
    if let Some(dir) = args.journal_dir {
        config.journal_dir = Some(dir);
    }
    if let Some(policy) = args.policy {
        config.matching_policy = policy;
    }
    if let Some(parallelism) = args.parallelism {
        config.batch_parallelism = parallelism.max(1);
    }

    let owner = OwnerId::new(args.owner.trim());
    let InputLines {
        candidates,
        file_lines,
        unparseable,
    } = read_candidates(&args.input)?;
    info!(
        path = %args.input.display(),
        lines = candidates.len(),
        unparseable = unparseable.len(),
        "Loaded candidate fills"
    );

    let (sink, audit_rx) = ChannelAuditSink::new(config.audit_queue_capacity, config.audit_enqueue_timeout);
    let audit_logger = tokio::spawn(run_audit_logger(audit_rx));

    let store = open_store(&config).context("opening fill store")?;
    let (service, recovery) =
        ReconciliationService::recover(config, store, Arc::new(sink)).context("recovering fill journal")?;
    if recovery.records > 0 {
        info!(keys = recovery.keys, records = recovery.records, "Recovered journal");
    }
    let service = Arc::new(service);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current fills");
            let _ = cancel_tx.send(true);
        }
    });

    let mut report = service.ingest_batch(&owner, &candidates, Some(cancel_rx)).await;
    interrupt.abort();

    // Report file lines rather than positions among non-blank lines
    let to_file_line = |line: usize| file_lines.get(line - 1).copied().unwrap_or(line);
    for applied in &mut report.applied {
        applied.line = to_file_line(applied.line);
    }
    for error in &mut report.errors {
        error.line = to_file_line(error.line);
    }
    report.errors.extend(unparseable);
    report.errors.sort_by_key(|e| e.line);
    for error in &report.errors {
        warn!(line = error.line, reason = %error.reason, "Rejected fill");
    }
    for skipped in &mut report.skipped {
        *skipped = to_file_line(*skipped);
    }

    let mut trades = Vec::new();
    for key in service.ledger().keys() {
        if key.owner_id == owner {
            trades.extend(service.trades(&owner, &key.symbol).await);
        }
    }

    let mut output = json!({
        "owner": owner,
        "applied": report.applied.len(),
        "rejected": report.errors.len(),
        "cancelled": report.cancelled,
        "net_pnl": total_net_pnl(&trades),
        "trades": trades,
    });
    if args.report {
        output["report"] = serde_json::to_value(&report)?;
    }
    println!("{}", serde_json::to_string_pretty(&output)?);

    drop(service);
    let events = audit_logger.await?;
    info!(events, "Audit log drained");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_unparseable_line_keeps_json_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"symbol":"AAPL","side":"BUY","price":"10","quantity":"1","timestamp":"1"}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"symbol":"AAPL","side":"BUY","price":"10""#).unwrap();

        let input = read_candidates(&file.path().to_path_buf()).unwrap();
        assert_eq!(input.candidates.len(), 1);
        assert_eq!(input.file_lines, vec![1]);
        assert_eq!(input.unparseable.len(), 1);

        let error = &input.unparseable[0];
        assert_eq!(error.line, 3);
        assert!(error.reason.starts_with("Invalid JSON"), "{}", error.reason);
        assert!(!error.reason.contains("Missing field"));
    }
}
