//! Candidate fills from imported files
//!
//! A `FillCandidate` is one loosely typed line of an import: numbers may
//! arrive as text with currency formatting, timestamps in several layouts,
//! and the id or sequence may be missing. `to_fill` turns it into a
//! validated `Fill` or reports the first field that is wrong.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::str::FromStr;
use trade_types::errors::FillError;
use trade_types::fill::{Fill, Side};
use trade_types::ids::{FillId, OwnerId, Symbol};
use trade_types::trade::ApplyOutcome;

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y"];

/// Prefix of content-derived fill ids
pub const AUTO_ID_PREFIX: &str = "auto-";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FillCandidate {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default, deserialize_with = "text_or_number")]
    pub price: Option<String>,
    #[serde(default, deserialize_with = "text_or_number")]
    pub quantity: Option<String>,
    #[serde(default, deserialize_with = "text_or_number")]
    pub commission: Option<String>,
    /// RFC 3339, a common date/time layout (UTC), or integer Unix nanos
    #[serde(default, deserialize_with = "text_or_number")]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub sequence: Option<u64>,
}

impl FillCandidate {
    /// Validate into a `Fill` owned by `owner`.
    ///
    /// `default_sequence` is used when the candidate carries none (the
    /// batch passes the line number).
    pub fn to_fill(
        &self,
        owner: &OwnerId,
        default_sequence: u64,
        max_symbol_len: usize,
    ) -> Result<Fill, FillError> {
        let raw_symbol = required(&self.symbol, "symbol")?;
        let symbol = Symbol::try_new(raw_symbol, max_symbol_len)
            .ok_or_else(|| FillError::InvalidSymbol(raw_symbol.to_string()))?;

        let raw_side = required(&self.side, "side")?;
        let side =
            Side::from_label(raw_side).ok_or_else(|| FillError::InvalidSide(raw_side.to_string()))?;

        let raw_price = required(&self.price, "price")?;
        let price = parse_decimal(raw_price).ok_or_else(|| FillError::InvalidPrice(raw_price.to_string()))?;

        let raw_quantity = required(&self.quantity, "quantity")?;
        let quantity = parse_decimal(raw_quantity)
            .ok_or_else(|| FillError::InvalidQuantity(raw_quantity.to_string()))?;

        let commission = match self.commission.as_deref().map(str::trim) {
            None | Some("") => Decimal::ZERO,
            Some(raw) => parse_decimal(raw).ok_or_else(|| FillError::InvalidCommission(raw.to_string()))?,
        };

        let raw_timestamp = required(&self.timestamp, "timestamp")?;
        let timestamp = parse_timestamp(raw_timestamp)
            .ok_or_else(|| FillError::InvalidTimestamp(raw_timestamp.to_string()))?;

        let sequence = self.sequence.unwrap_or(default_sequence);

        let id = match self.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => FillId::new(id),
            _ => content_id(owner, &symbol, side, price, quantity, commission, timestamp, sequence),
        };

        Fill::try_new(id, owner.clone(), symbol, side, price, quantity, commission, timestamp, sequence)
    }
}

fn required<'a>(value: &'a Option<String>, field: &'static str) -> Result<&'a str, FillError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(FillError::MissingField { field }),
    }
}

fn text_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(de::Error::custom(format!("expected text or number, got {}", other))),
    }
}

/// Parse a decimal that may carry `$`, thousands separators or accounting
/// parentheses for negatives.
pub fn parse_decimal(raw: &str) -> Option<Decimal> {
    let mut text: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '$' && *c != ',')
        .collect();

    let negated = text.starts_with('(') && text.ends_with(')');
    if negated {
        text = text[1..text.len() - 1].to_string();
    }
    if text.is_empty() {
        return None;
    }

    let value = Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()?;
    Some(if negated { -value } else { value })
}

/// Parse a timestamp into Unix nanos (UTC).
pub fn parse_timestamp(raw: &str) -> Option<i64> {
    let text = raw.trim();

    let digits = text.strip_prefix('-').unwrap_or(text);
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        return text.parse::<i64>().ok();
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return dt.timestamp_nanos_opt();
    }
    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return dt.and_utc().timestamp_nanos_opt();
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return date.and_hms_opt(0, 0, 0)?.and_utc().timestamp_nanos_opt();
        }
    }
    None
}

/// Deterministic id for a candidate without one, so re-importing the same
/// file stays idempotent.
#[allow(clippy::too_many_arguments)]
fn content_id(
    owner: &OwnerId,
    symbol: &Symbol,
    side: Side,
    price: Decimal,
    quantity: Decimal,
    commission: Decimal,
    timestamp: i64,
    sequence: u64,
) -> FillId {
    let mut hasher = Sha256::new();
    for part in [
        owner.to_string(),
        symbol.to_string(),
        format!("{:?}", side),
        price.normalize().to_string(),
        quantity.normalize().to_string(),
        commission.normalize().to_string(),
        timestamp.to_string(),
        sequence.to_string(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    let digest = hasher.finalize();
    FillId::new(format!("{}{:x}", AUTO_ID_PREFIX, digest))
}

// ── Batch report ────────────────────────────────────────────────────

/// A line that was applied (or recognised as a duplicate)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedLine {
    /// 1-based position in the submitted batch
    pub line: usize,
    pub fill_id: FillId,
    pub outcome: ApplyOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineError {
    pub line: usize,
    pub fill_id: Option<FillId>,
    pub reason: String,
}

/// Result of one batch ingest
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub applied: Vec<AppliedLine>,
    pub errors: Vec<LineError>,
    /// Lines not attempted because the batch was cancelled
    pub skipped: Vec<usize>,
    pub cancelled: bool,
}

impl BatchReport {
    pub fn total_lines(&self) -> usize {
        self.applied.len() + self.errors.len() + self.skipped.len()
    }

    pub(crate) fn sort(&mut self) {
        self.applied.sort_by_key(|a| a.line);
        self.errors.sort_by_key(|e| e.line);
        self.skipped.sort_unstable();
    }
}
