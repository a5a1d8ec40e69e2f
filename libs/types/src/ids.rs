//! Identifier types for journal entities
//!
//! Fill ids are supplied by the broker export (or derived from content when
//! missing), so they are opaque strings. Trade ids are UUID v5 values derived
//! from the opening fill, which makes a full replay reproduce the same ids.

use crate::errors::FillError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Longest accepted ticker symbol
pub const MAX_SYMBOL_LEN: usize = 16;

/// Namespace for trade id derivation
const TRADE_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2d0e_8a4b_5c39_9e17_b3d4_a5c6_e7f8);

/// External idempotency key of a fill
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FillId(String);

impl FillId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FillId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FillId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Owner of a fill stream (the journal's user)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Ticker symbol, trimmed and upper-cased
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol(String);

impl Symbol {
    /// Create a symbol
    ///
    /// # Panics
    /// Panics if the symbol is empty or longer than [`MAX_SYMBOL_LEN`]
    pub fn new(symbol: impl AsRef<str>) -> Self {
        match Self::try_new(symbol.as_ref(), MAX_SYMBOL_LEN) {
            Some(s) => s,
            None => panic!("Symbol must be 1..={} characters", MAX_SYMBOL_LEN),
        }
    }

    /// Normalize and validate a raw symbol, returning None if invalid
    pub fn try_new(symbol: &str, max_len: usize) -> Option<Self> {
        let normalized = symbol.trim().to_uppercase();
        if normalized.is_empty()
            || normalized.chars().count() > max_len
            || normalized.chars().any(char::is_whitespace)
        {
            return None;
        }
        Some(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Symbol {
    type Error = FillError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_new(&value, MAX_SYMBOL_LEN).ok_or(FillError::InvalidSymbol(value))
    }
}

impl From<Symbol> for String {
    fn from(symbol: Symbol) -> Self {
        symbol.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for a derived trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TradeId(Uuid);

impl TradeId {
    /// Derive the id of the trade opened by `opening_fill`.
    ///
    /// A fill opens at most one trade (the flip remainder included), so the
    /// triple is unique per key.
    pub fn derive(owner: &OwnerId, symbol: &Symbol, opening_fill: &FillId) -> Self {
        let name = format!("{}\u{1f}{}\u{1f}{}", owner, symbol, opening_fill);
        Self(Uuid::new_v5(&TRADE_NAMESPACE, name.as_bytes()))
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for TradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Serialization key for all work on one fill stream
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PositionKey {
    pub owner_id: OwnerId,
    pub symbol: Symbol,
}

impl PositionKey {
    pub fn new(owner_id: OwnerId, symbol: Symbol) -> Self {
        Self { owner_id, symbol }
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner_id, self.symbol)
    }
}
