//! Fill store: durable source of truth for accepted fills
//!
//! The reconciliation service appends one record per accepted fill before it
//! touches in-memory state, and reloads all records at boot.

use crate::journal::{JournalConfig, JournalError, JournalWriter};
use crate::reader::{JournalReader, ReaderError};
use crate::records::{JournalRecord, RecordError};
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Reader error: {0}")]
    Reader(#[from] ReaderError),

    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Records read back from a store
#[derive(Debug, Default)]
pub struct LoadedJournal {
    /// Records in append order
    pub records: Vec<JournalRecord>,
    /// Entries dropped because of corruption or undecodable payloads
    pub skipped: usize,
}

/// Append-only record storage
pub trait FillStore: Send + Sync {
    /// Durably append one record, returning its journal sequence.
    fn append(&self, record: &JournalRecord) -> Result<u64, StoreError>;

    /// Read every readable record in append order.
    fn load(&self) -> Result<LoadedJournal, StoreError>;
}

// ── In-memory store ─────────────────────────────────────────────────

/// Store for tests and for runs without a journal directory
#[derive(Debug, Default)]
pub struct MemoryFillStore {
    records: Mutex<Vec<JournalRecord>>,
}

impl MemoryFillStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FillStore for MemoryFillStore {
    fn append(&self, record: &JournalRecord) -> Result<u64, StoreError> {
        let mut records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        records.push(record.clone());
        Ok(records.len() as u64)
    }

    fn load(&self) -> Result<LoadedJournal, StoreError> {
        let records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(LoadedJournal {
            records: records.clone(),
            skipped: 0,
        })
    }
}

// ── Journal-backed store ────────────────────────────────────────────

/// Store backed by the CRC32C-framed journal
pub struct JournalFillStore {
    dir: PathBuf,
    writer: Mutex<JournalWriter>,
}

impl JournalFillStore {
    /// Open the journal in `config.dir`, resuming after its last sequence.
    pub fn open(config: JournalConfig) -> Result<Self, StoreError> {
        let dir = config.dir.clone();
        let mut writer = JournalWriter::open(config)?;

        let mut reader = JournalReader::open(&dir)?;
        let (entries, _) = reader.recover_entries()?;
        let last_sequence = reader.last_sequence().unwrap_or(0);
        writer.set_next_sequence(last_sequence + 1);

        info!(
            dir = %dir.display(),
            entries = entries.len(),
            next_sequence = last_sequence + 1,
            "Fill journal ready"
        );

        Ok(Self {
            dir,
            writer: Mutex::new(writer),
        })
    }

    /// Flush and fsync buffered entries.
    pub fn sync(&self) -> Result<(), StoreError> {
        let mut writer = self.writer.lock().map_err(|_| StoreError::Poisoned)?;
        writer.sync()?;
        Ok(())
    }
}

impl FillStore for JournalFillStore {
    fn append(&self, record: &JournalRecord) -> Result<u64, StoreError> {
        let payload = record.encode()?;
        let mut writer = self.writer.lock().map_err(|_| StoreError::Poisoned)?;
        let entry = writer.append_record(record.timestamp(), record.kind(), payload)?;
        Ok(entry.sequence)
    }

    fn load(&self) -> Result<LoadedJournal, StoreError> {
        // Buffered entries must reach the file before it is read back
        self.sync()?;

        let mut reader = JournalReader::open(&self.dir)?;
        let (entries, corruptions) = reader.recover_entries()?;
        for corruption in &corruptions {
            warn!(
                file = %corruption.file.display(),
                offset = corruption.byte_offset,
                kind = %corruption.kind,
                detail = %corruption.detail,
                "Journal corruption"
            );
        }

        let mut loaded = LoadedJournal {
            records: Vec::with_capacity(entries.len()),
            skipped: corruptions.len(),
        };
        for entry in &entries {
            match JournalRecord::decode(entry) {
                Ok(record) => loaded.records.push(record),
                Err(e) => {
                    warn!(sequence = entry.sequence, error = %e, "Skipping undecodable journal record");
                    loaded.skipped += 1;
                }
            }
        }
        Ok(loaded)
    }
}
