//! Fill journal reader
//!
//! Walks the segment files in index order and yields every frame whose
//! checksum holds. Damage is recorded rather than fatal:
//! - a frame with a bad CRC is stepped over, its length is still usable
//! - an unparseable frame ends that segment, since later frame boundaries are lost
//! - a frame whose sequence does not advance is dropped

use crate::journal::{parse_journal_index, JournalEntry, JournalError};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("journal io: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error("{} at byte {} of {}", .0.kind, .0.byte_offset, .0.file.display())]
    Corrupt(CorruptionRecord),
}

/// Where and how a segment is damaged
#[derive(Debug, Clone, PartialEq)]
pub struct CorruptionRecord {
    pub file: PathBuf,
    pub byte_offset: u64,
    pub kind: CorruptionKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptionKind {
    ChecksumMismatch,
    TruncatedEntry,
    SequenceRegression,
}

impl fmt::Display for CorruptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CorruptionKind::ChecksumMismatch => "checksum mismatch",
            CorruptionKind::TruncatedEntry => "unreadable tail",
            CorruptionKind::SequenceRegression => "sequence regression",
        })
    }
}

/// Reader over every segment of one journal directory
pub struct JournalReader {
    segments: Vec<PathBuf>,
    last_sequence: Option<u64>,
}

impl JournalReader {
    /// Collect the segments under `dir`. A missing directory is an empty journal.
    pub fn open(dir: &Path) -> Result<Self, ReaderError> {
        let mut indexed = Vec::new();
        match fs::read_dir(dir) {
            Ok(listing) => {
                for item in listing {
                    let item = item?;
                    if let Some(index) = parse_journal_index(&item.file_name().to_string_lossy()) {
                        indexed.push((index, item.path()));
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        indexed.sort_unstable_by_key(|(index, _)| *index);

        Ok(Self {
            segments: indexed.into_iter().map(|(_, path)| path).collect(),
            last_sequence: None,
        })
    }

    /// Every intact entry, failing on the first sign of damage.
    pub fn read_all(&mut self) -> Result<Vec<JournalEntry>, ReaderError> {
        let (entries, damage) = self.scan()?;
        match damage.into_iter().next() {
            Some(first) => Err(ReaderError::Corrupt(first)),
            None => Ok(entries),
        }
    }

    /// Every intact entry, plus a record of what had to be skipped.
    pub fn recover_entries(&mut self) -> Result<(Vec<JournalEntry>, Vec<CorruptionRecord>), ReaderError> {
        self.scan()
    }

    /// Highest sequence seen by the last read
    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    fn scan(&mut self) -> Result<(Vec<JournalEntry>, Vec<CorruptionRecord>), ReaderError> {
        let mut entries = Vec::new();
        let mut damage = Vec::new();
        self.last_sequence = None;

        for path in &self.segments {
            let data = fs::read(path)?;
            let mut offset = 0usize;

            while offset < data.len() {
                let at = |kind, detail: String| CorruptionRecord {
                    file: path.clone(),
                    byte_offset: offset as u64,
                    kind,
                    detail,
                };

                let (entry, frame_len) = match JournalEntry::from_bytes(&data[offset..]) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        let lost = data.len() - offset;
                        damage.push(at(CorruptionKind::TruncatedEntry, format!("{} bytes lost: {}", lost, e)));
                        break;
                    }
                };

                if !entry.verify_checksum() {
                    damage.push(at(
                        CorruptionKind::ChecksumMismatch,
                        format!("seq {} stored crc {:#010x}", entry.sequence, entry.checksum),
                    ));
                } else if self.last_sequence.is_some_and(|last| entry.sequence <= last) {
                    damage.push(at(
                        CorruptionKind::SequenceRegression,
                        format!("seq {} after {:?}", entry.sequence, self.last_sequence),
                    ));
                } else {
                    self.last_sequence = Some(entry.sequence);
                    entries.push(entry);
                }
                offset += frame_len;
            }
        }
        Ok((entries, damage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{JournalConfig, JournalWriter};
    use tempfile::TempDir;

    /// Size of each frame written by `write_fills`
    const FRAME: usize = 4 + 26 + "FillApplied".len() + 10;

    fn write_fills(dir: &Path, count: u64) -> PathBuf {
        let mut writer = JournalWriter::open(JournalConfig::new(dir)).unwrap();
        for n in 1..=count {
            writer.append_record(n as i64 * 1_000, "FillApplied", vec![n as u8; 10]).unwrap();
        }
        writer.sync().unwrap();
        writer.current_file_path().to_path_buf()
    }

    fn flip_byte(path: &Path, at: usize) {
        let mut data = fs::read(path).unwrap();
        data[at] ^= 0xFF;
        fs::write(path, &data).unwrap();
    }

    #[test]
    fn test_reads_back_in_order() {
        let tmp = TempDir::new().unwrap();
        write_fills(tmp.path(), 25);

        let mut reader = JournalReader::open(tmp.path()).unwrap();
        let entries = reader.read_all().unwrap();
        let sequences: Vec<u64> = entries.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (1..=25).collect::<Vec<_>>());
        assert_eq!(reader.last_sequence(), Some(25));
    }

    #[test]
    fn test_strict_read_fails_on_bad_crc() {
        let tmp = TempDir::new().unwrap();
        let path = write_fills(tmp.path(), 4);
        // A payload byte of the third frame
        flip_byte(&path, 3 * FRAME - 6);

        match JournalReader::open(tmp.path()).unwrap().read_all() {
            Err(ReaderError::Corrupt(record)) => {
                assert_eq!(record.kind, CorruptionKind::ChecksumMismatch);
                assert_eq!(record.byte_offset, 2 * FRAME as u64);
            }
            other => panic!("Expected corruption, got: {:?}", other.map(|e| e.len())),
        }
    }

    #[test]
    fn test_recovery_steps_over_bad_crc() {
        let tmp = TempDir::new().unwrap();
        let path = write_fills(tmp.path(), 6);
        flip_byte(&path, 3 * FRAME - 6);

        let (entries, damage) = JournalReader::open(tmp.path()).unwrap().recover_entries().unwrap();
        let sequences: Vec<u64> = entries.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 4, 5, 6]);
        assert_eq!(damage.len(), 1);
        assert_eq!(damage[0].file, path);
    }

    #[test]
    fn test_garbage_tail_ends_the_segment() {
        let tmp = TempDir::new().unwrap();
        let path = write_fills(tmp.path(), 3);
        let mut data = fs::read(&path).unwrap();
        data.extend_from_slice(&[0x30, 0x00, 0x00, 0x00, 0x01]);
        fs::write(&path, &data).unwrap();

        let (entries, damage) = JournalReader::open(tmp.path()).unwrap().recover_entries().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(damage[0].kind, CorruptionKind::TruncatedEntry);
        assert_eq!(damage[0].byte_offset, 3 * FRAME as u64);
    }

    #[test]
    fn test_replayed_sequence_is_dropped() {
        let tmp = TempDir::new().unwrap();
        let path = write_fills(tmp.path(), 2);
        let mut data = fs::read(&path).unwrap();
        data.extend_from_slice(&JournalEntry::new(2, 0, "FillApplied", vec![]).to_bytes().unwrap());
        fs::write(&path, &data).unwrap();

        let (entries, damage) = JournalReader::open(tmp.path()).unwrap().recover_entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(damage[0].kind, CorruptionKind::SequenceRegression);
    }

    #[test]
    fn test_segments_read_in_index_order() {
        let tmp = TempDir::new().unwrap();
        let config = JournalConfig {
            max_file_size: 100,
            ..JournalConfig::new(tmp.path())
        };
        let mut writer = JournalWriter::open(config).unwrap();
        for n in 1..=30u8 {
            writer.append_record(n as i64, "FillApplied", vec![n; 5]).unwrap();
        }
        writer.sync().unwrap();

        let entries = JournalReader::open(tmp.path()).unwrap().read_all().unwrap();
        assert_eq!(entries.len(), 30);
        assert!(entries.windows(2).all(|w| w[0].sequence + 1 == w[1].sequence));
        assert_eq!(entries[29].payload, vec![30; 5]);
    }

    #[test]
    fn test_empty_or_missing_directory() {
        let tmp = TempDir::new().unwrap();
        assert!(JournalReader::open(tmp.path()).unwrap().read_all().unwrap().is_empty());

        let mut missing = JournalReader::open(&tmp.path().join("absent")).unwrap();
        assert!(missing.read_all().unwrap().is_empty());
        assert_eq!(missing.last_sequence(), None);
    }
}
