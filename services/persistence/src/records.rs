//! Journal record taxonomy
//!
//! Records are bincode payloads inside journal frames. Only externally
//! tagged enums are used, since bincode cannot decode internally tagged ones.

use crate::journal::JournalEntry;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use trade_types::prelude::{ApplyOutcome, Fill, FillId, OwnerId, PositionKey, Symbol};

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Entry kind {entry} does not match decoded record {decoded}")]
    KindMismatch { entry: String, decoded: &'static str },
}

/// One durable fact about a position key's fill log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalRecord {
    /// A fill was accepted together with the outcome it produced
    FillApplied { fill: Fill, outcome: ApplyOutcome },
    /// An administrator removed a fill
    FillPurged {
        owner_id: OwnerId,
        symbol: Symbol,
        fill_id: FillId,
        timestamp: i64,
    },
    /// An administrator replaced a fill's contents, keeping its id
    FillAmended { fill: Fill },
}

impl JournalRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            JournalRecord::FillApplied { .. } => "FillApplied",
            JournalRecord::FillPurged { .. } => "FillPurged",
            JournalRecord::FillAmended { .. } => "FillAmended",
        }
    }

    /// Execution time of the fill the record concerns
    pub fn timestamp(&self) -> i64 {
        match self {
            JournalRecord::FillApplied { fill, .. } | JournalRecord::FillAmended { fill } => {
                fill.timestamp
            }
            JournalRecord::FillPurged { timestamp, .. } => *timestamp,
        }
    }

    pub fn position_key(&self) -> PositionKey {
        match self {
            JournalRecord::FillApplied { fill, .. } | JournalRecord::FillAmended { fill } => {
                fill.position_key()
            }
            JournalRecord::FillPurged {
                owner_id, symbol, ..
            } => PositionKey::new(owner_id.clone(), symbol.clone()),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, RecordError> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode the record carried by `entry`, checking the frame's kind tag.
    pub fn decode(entry: &JournalEntry) -> Result<Self, RecordError> {
        let record: JournalRecord = bincode::deserialize(&entry.payload)?;
        if record.kind() != entry.kind {
            return Err(RecordError::KindMismatch {
                entry: entry.kind.clone(),
                decoded: record.kind(),
            });
        }
        Ok(record)
    }
}
