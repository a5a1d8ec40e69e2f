//! Engine configuration
//!
//! Plain struct with defaults; `from_env` overlays `RECON_*` variables after
//! loading `.env`. Unparseable values fall back to the default with a warning.

use persistence::journal::{FlushPolicy, FsyncPolicy, JournalConfig};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use trade_types::ids::MAX_SYMBOL_LEN;
use tracing::warn;

/// How realized P&L is measured when a position is reduced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchingPolicy {
    /// Against the entry price of each consumed lot
    #[default]
    Fifo,
    /// Against the average entry price of all open lots at the time of the close
    AverageCost,
}

impl FromStr for MatchingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fifo" => Ok(MatchingPolicy::Fifo),
            "average_cost" | "averagecost" | "avg" => Ok(MatchingPolicy::AverageCost),
            other => Err(format!("unknown matching policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub matching_policy: MatchingPolicy,
    /// Journal directory; `None` keeps the fill log in memory only
    pub journal_dir: Option<PathBuf>,
    pub flush_policy: FlushPolicy,
    pub fsync_policy: FsyncPolicy,
    pub max_file_size: u64,
    pub audit_queue_capacity: usize,
    /// Longest an ingest waits for room in the audit queue
    pub audit_enqueue_timeout: Duration,
    /// Symbol groups of one batch replayed at the same time
    pub batch_parallelism: usize,
    pub max_symbol_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            matching_policy: MatchingPolicy::Fifo,
            journal_dir: None,
            flush_policy: FlushPolicy::EveryWrite,
            fsync_policy: FsyncPolicy::EveryWrite,
            max_file_size: 64 * 1024 * 1024,
            audit_queue_capacity: 10_000,
            audit_enqueue_timeout: Duration::from_millis(250),
            batch_parallelism: 8,
            max_symbol_len: MAX_SYMBOL_LEN,
        }
    }
}

impl EngineConfig {
    /// Load `.env` (if present) and read `RECON_*` variables.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let journal_dir = lookup("RECON_JOURNAL_DIR")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        Self {
            matching_policy: parse_or(&lookup, "RECON_MATCHING_POLICY", defaults.matching_policy),
            journal_dir,
            flush_policy: lookup("RECON_FLUSH")
                .and_then(|v| parse_flush(&v).or_else(|| invalid("RECON_FLUSH", &v)))
                .unwrap_or(defaults.flush_policy),
            fsync_policy: lookup("RECON_FSYNC")
                .and_then(|v| parse_fsync(&v).or_else(|| invalid("RECON_FSYNC", &v)))
                .unwrap_or(defaults.fsync_policy),
            max_file_size: parse_or(&lookup, "RECON_MAX_FILE_SIZE", defaults.max_file_size),
            audit_queue_capacity: parse_or(&lookup, "RECON_AUDIT_QUEUE_CAPACITY", defaults.audit_queue_capacity)
                .max(1),
            audit_enqueue_timeout: Duration::from_millis(parse_or(
                &lookup,
                "RECON_AUDIT_TIMEOUT_MS",
                defaults.audit_enqueue_timeout.as_millis() as u64,
            )),
            batch_parallelism: parse_or(&lookup, "RECON_BATCH_PARALLELISM", defaults.batch_parallelism).max(1),
            max_symbol_len: parse_or(&lookup, "RECON_MAX_SYMBOL_LEN", defaults.max_symbol_len).max(1),
        }
    }

    /// Journal settings, when a journal directory is configured
    pub fn journal_config(&self) -> Option<JournalConfig> {
        self.journal_dir.as_ref().map(|dir| JournalConfig {
            max_file_size: self.max_file_size,
            flush_policy: self.flush_policy,
            fsync_policy: self.fsync_policy,
            ..JournalConfig::new(dir.clone())
        })
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, "Invalid config value, using default");
                default
            }
        },
        None => default,
    }
}

fn invalid<T>(key: &str, raw: &str) -> Option<T> {
    warn!(key, value = %raw, "Invalid config value, using default");
    None
}

/// `every` or `every:N`
fn parse_flush(raw: &str) -> Option<FlushPolicy> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "every" => Some(FlushPolicy::EveryWrite),
        other => other
            .strip_prefix("every:")
            .and_then(|n| n.parse().ok())
            .filter(|n: &usize| *n > 0)
            .map(FlushPolicy::EveryN),
    }
}

/// `every`, `every:N` or `rotation`
fn parse_fsync(raw: &str) -> Option<FsyncPolicy> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "every" => Some(FsyncPolicy::EveryWrite),
        "rotation" => Some(FsyncPolicy::OnRotation),
        other => other
            .strip_prefix("every:")
            .and_then(|n| n.parse().ok())
            .filter(|n: &usize| *n > 0)
            .map(FsyncPolicy::EveryN),
    }
}
