//! Fill journal writer
//!
//! The journal is a directory of numbered segment files
//! (`journal-000000.bin`, `journal-000001.bin`, ...). Each accepted fill and
//! each administrative edit is written as one self-delimiting frame, so a
//! frame is the unit of atomicity for the ledger: after a crash a frame is
//! either fully present or cut off at the tail.
//!
//! # Frame layout
//! All integers little-endian.
//! ```text
//! len      u32   bytes that follow this field
//! seq      u64   journal-wide sequence, starting at 1
//! ts       i64   execution time of the fill concerned (Unix nanos)
//! kind     u16 length + utf-8
//! payload  u32 length + bincode record
//! crc      u32   CRC32C of seq, ts, kind and payload bytes
//! ```

use crc32c::{crc32c, crc32c_append};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Frames claiming more than this are treated as garbage
const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

/// Body of a frame with an empty kind and payload
const MIN_BODY_LEN: usize = 8 + 8 + 2 + 4 + 4;

const DEFAULT_SEGMENT_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("journal io: {0}")]
    Io(#[from] io::Error),

    #[error("bad frame: {0}")]
    Serialization(String),

    #[error("out of sequence append: next is {expected}, entry has {got}")]
    SequenceError { expected: u64, got: u64 },
}

fn bad_frame(detail: impl Into<String>) -> JournalError {
    JournalError::Serialization(detail.into())
}

// ── Entry ───────────────────────────────────────────────────────────

/// One framed record as it sits in a segment file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub sequence: u64,
    /// Execution time of the fill the record concerns, not the wall clock
    pub timestamp: i64,
    /// Record kind, e.g. "FillApplied"
    pub kind: String,
    pub payload: Vec<u8>,
    pub checksum: u32,
}

impl JournalEntry {
    pub fn new(sequence: u64, timestamp: i64, kind: impl Into<String>, payload: Vec<u8>) -> Self {
        let kind = kind.into();
        let checksum = Self::compute_checksum(sequence, timestamp, &kind, &payload);
        Self {
            sequence,
            timestamp,
            kind,
            payload,
            checksum,
        }
    }

    pub fn compute_checksum(sequence: u64, timestamp: i64, kind: &str, payload: &[u8]) -> u32 {
        let crc = crc32c(&sequence.to_le_bytes());
        let crc = crc32c_append(crc, &timestamp.to_le_bytes());
        let crc = crc32c_append(crc, kind.as_bytes());
        crc32c_append(crc, payload)
    }

    pub fn verify_checksum(&self) -> bool {
        Self::compute_checksum(self.sequence, self.timestamp, &self.kind, &self.payload) == self.checksum
    }

    /// Encode as a complete frame, length prefix included.
    pub fn to_bytes(&self) -> Result<Vec<u8>, JournalError> {
        let kind_len: u16 = self
            .kind
            .len()
            .try_into()
            .map_err(|_| bad_frame(format!("record kind of {} bytes", self.kind.len())))?;
        let payload_len: u32 = self
            .payload
            .len()
            .try_into()
            .map_err(|_| bad_frame(format!("payload of {} bytes", self.payload.len())))?;

        let body_len = MIN_BODY_LEN + self.kind.len() + self.payload.len();
        if body_len > MAX_BODY_LEN {
            return Err(bad_frame(format!("frame body of {} bytes is over the limit", body_len)));
        }

        let mut frame = Vec::with_capacity(4 + body_len);
        frame.extend_from_slice(&(body_len as u32).to_le_bytes());
        frame.extend_from_slice(&self.sequence.to_le_bytes());
        frame.extend_from_slice(&self.timestamp.to_le_bytes());
        frame.extend_from_slice(&kind_len.to_le_bytes());
        frame.extend_from_slice(self.kind.as_bytes());
        frame.extend_from_slice(&payload_len.to_le_bytes());
        frame.extend_from_slice(&self.payload);
        frame.extend_from_slice(&self.checksum.to_le_bytes());
        Ok(frame)
    }

    /// Decode the frame at the start of `data`, returning it with its encoded size.
    ///
    /// The checksum is left for the caller to verify: a frame whose CRC fails
    /// still has a trustworthy length and can be stepped over.
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize), JournalError> {
        let body_len = Cursor::new(data).u32()? as usize;
        if !(MIN_BODY_LEN..=MAX_BODY_LEN).contains(&body_len) {
            return Err(bad_frame(format!("length prefix {} out of range", body_len)));
        }
        let frame_len = 4 + body_len;
        let Some(body) = data.get(4..frame_len) else {
            return Err(bad_frame(format!(
                "frame needs {} bytes, {} remain",
                frame_len,
                data.len()
            )));
        };

        let mut cursor = Cursor::new(body);
        let sequence = cursor.u64()?;
        let timestamp = i64::from_le_bytes(cursor.fixed()?);
        let kind_len = cursor.u16()? as usize;
        let kind = std::str::from_utf8(cursor.bytes(kind_len)?)
            .map_err(|e| bad_frame(format!("record kind: {}", e)))?
            .to_owned();
        let payload_len = cursor.u32()? as usize;
        let payload = cursor.bytes(payload_len)?.to_vec();
        let checksum = cursor.u32()?;
        if cursor.remaining() != 0 {
            return Err(bad_frame(format!("{} stray bytes inside frame", cursor.remaining())));
        }

        let entry = Self {
            sequence,
            timestamp,
            kind,
            payload,
            checksum,
        };
        Ok((entry, frame_len))
    }
}

/// Little-endian field reader that never reads past its slice
struct Cursor<'a> {
    rest: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { rest: data }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], JournalError> {
        if len > self.rest.len() {
            return Err(bad_frame(format!(
                "field of {} bytes but only {} left in frame",
                len,
                self.rest.len()
            )));
        }
        let (head, tail) = self.rest.split_at(len);
        self.rest = tail;
        Ok(head)
    }

    fn fixed<const N: usize>(&mut self) -> Result<[u8; N], JournalError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16, JournalError> {
        self.fixed().map(u16::from_le_bytes)
    }

    fn u32(&mut self) -> Result<u32, JournalError> {
        self.fixed().map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> Result<u64, JournalError> {
        self.fixed().map(u64::from_le_bytes)
    }

    fn remaining(&self) -> usize {
        self.rest.len()
    }
}

// ── Durability settings ─────────────────────────────────────────────

/// When buffered frames are handed to the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlushPolicy {
    EveryWrite,
    EveryN(usize),
}

/// When segment files are fsynced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsyncPolicy {
    EveryWrite,
    EveryN(usize),
    /// Only when a segment is closed (and on explicit `sync`)
    OnRotation,
}

impl FlushPolicy {
    fn due(self, pending: usize) -> bool {
        match self {
            FlushPolicy::EveryWrite => true,
            FlushPolicy::EveryN(n) => pending >= n,
        }
    }
}

impl FsyncPolicy {
    fn due(self, pending: usize) -> bool {
        match self {
            FsyncPolicy::EveryWrite => true,
            FsyncPolicy::EveryN(n) => pending >= n,
            FsyncPolicy::OnRotation => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JournalConfig {
    pub dir: PathBuf,
    /// A new segment is started once the current one reaches this size
    pub max_file_size: u64,
    pub flush_policy: FlushPolicy,
    pub fsync_policy: FsyncPolicy,
}

impl JournalConfig {
    /// Segments of 64 MiB, every frame flushed and fsynced.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_file_size: DEFAULT_SEGMENT_BYTES,
            flush_policy: FlushPolicy::EveryWrite,
            fsync_policy: FsyncPolicy::EveryWrite,
        }
    }
}

// ── Writer ──────────────────────────────────────────────────────────

/// File operations a segment needs, so tests can make them fail
trait SegmentFile: Send {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
    fn sync_all(&self) -> io::Result<()>;
    fn set_len(&self, len: u64) -> io::Result<()>;
}

impl SegmentFile for File {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        Write::write_all(self, buf)
    }

    fn sync_all(&self) -> io::Result<()> {
        File::sync_all(self)
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }
}

/// The segment currently being appended to.
///
/// Acknowledged bytes are `file[..on_disk]` followed by `pending`; `len`
/// is their total.
struct Segment {
    index: u64,
    path: PathBuf,
    file: Box<dyn SegmentFile>,
    len: u64,
    on_disk: u64,
    pending: Vec<u8>,
    unflushed: usize,
    unsynced: usize,
    /// Set when a rollback could not shorten the file
    torn_at: Option<u64>,
}

impl Segment {
    fn open(dir: &Path, index: u64) -> Result<Self, JournalError> {
        let path = JournalWriter::journal_path(dir, index);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            index,
            path,
            file: Box::new(file),
            len,
            on_disk: len,
            pending: Vec::new(),
            unflushed: 0,
            unsynced: 0,
            torn_at: None,
        })
    }

    /// Hand pending frames to the OS. A short write is cut back off the file
    /// and the frames stay pending.
    fn flush(&mut self) -> Result<(), JournalError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.file.write_all(&self.pending) {
            self.truncate_to(self.on_disk)?;
            return Err(e.into());
        }
        self.on_disk += self.pending.len() as u64;
        self.pending.clear();
        self.unflushed = 0;
        Ok(())
    }

    fn fsync(&mut self) -> Result<(), JournalError> {
        self.flush()?;
        self.file.sync_all()?;
        self.unsynced = 0;
        Ok(())
    }

    fn truncate_to(&mut self, len: u64) -> Result<(), JournalError> {
        if let Err(e) = self.file.set_len(len) {
            self.torn_at = Some(len);
            return Err(e.into());
        }
        self.on_disk = len;
        self.torn_at = None;
        Ok(())
    }

    /// Drop every byte after the first `acknowledged`, on disk and pending.
    fn roll_back(&mut self, acknowledged: u64) -> Result<(), JournalError> {
        if self.on_disk > acknowledged {
            self.truncate_to(acknowledged)?;
        }
        self.pending.truncate((acknowledged - self.on_disk) as usize);
        if self.pending.is_empty() {
            self.unflushed = 0;
        }
        Ok(())
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(path = %self.path.display(), error = %e, "Pending journal frames lost on close");
        }
    }
}

/// Single appender for the fill journal.
///
/// Sequences are assigned here and must be gapless in what this writer
/// appends; `set_next_sequence` resumes after a recovered journal.
pub struct JournalWriter {
    config: JournalConfig,
    segment: Segment,
    next_sequence: u64,
}

impl JournalWriter {
    /// Open the newest segment in `config.dir` for appending.
    ///
    /// A frame left half-written by a crash is cut off first, otherwise
    /// every later frame in that segment would be unreadable.
    pub fn open(config: JournalConfig) -> Result<Self, JournalError> {
        fs::create_dir_all(&config.dir)?;

        let index = latest_segment_index(&config.dir);
        cut_torn_tail(&Self::journal_path(&config.dir, index))?;
        let segment = Segment::open(&config.dir, index)?;
        info!(path = %segment.path.display(), size = segment.len, "Journal opened");

        Ok(Self {
            config,
            segment,
            next_sequence: 1,
        })
    }

    pub fn set_next_sequence(&mut self, seq: u64) {
        self.next_sequence = seq;
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn current_file_path(&self) -> &Path {
        &self.segment.path
    }

    /// Append an already built entry; its sequence must be `next_sequence`.
    pub fn append(&mut self, entry: &JournalEntry) -> Result<(), JournalError> {
        if entry.sequence != self.next_sequence {
            return Err(JournalError::SequenceError {
                expected: self.next_sequence,
                got: entry.sequence,
            });
        }
        let frame = entry.to_bytes()?;

        if self.segment.len >= self.config.max_file_size {
            self.start_next_segment()?;
        }

        let segment = &mut self.segment;
        if let Some(len) = segment.torn_at {
            segment.truncate_to(len)?;
        }
        let acknowledged = segment.len;
        segment.pending.extend_from_slice(&frame);
        segment.unflushed += 1;
        segment.unsynced += 1;

        let written = if self.config.fsync_policy.due(segment.unsynced) {
            segment.fsync()
        } else if self.config.flush_policy.due(segment.unflushed) {
            segment.flush()
        } else {
            Ok(())
        };
        if let Err(e) = written {
            // The frame must not surface later through another frame's flush
            segment.unflushed = segment.unflushed.saturating_sub(1);
            segment.unsynced = segment.unsynced.saturating_sub(1);
            if let Err(rollback) = segment.roll_back(acknowledged) {
                error!(path = %segment.path.display(), error = %rollback, "Journal rollback failed");
            }
            warn!(sequence = entry.sequence, error = %e, "Journal append failed");
            return Err(e);
        }
        segment.len += frame.len() as u64;
        self.next_sequence += 1;

        debug!(sequence = entry.sequence, kind = %entry.kind, bytes = frame.len(), "Journal entry appended");
        Ok(())
    }

    /// Frame `payload` under the next sequence and append it.
    pub fn append_record(
        &mut self,
        timestamp: i64,
        kind: &str,
        payload: Vec<u8>,
    ) -> Result<JournalEntry, JournalError> {
        let entry = JournalEntry::new(self.next_sequence, timestamp, kind, payload);
        self.append(&entry)?;
        Ok(entry)
    }

    /// Flush and fsync everything appended so far.
    pub fn sync(&mut self) -> Result<(), JournalError> {
        self.segment.fsync()
    }

    fn start_next_segment(&mut self) -> Result<(), JournalError> {
        self.segment.fsync()?;
        self.segment = Segment::open(&self.config.dir, self.segment.index + 1)?;
        info!(path = %self.segment.path.display(), "Journal rotated");
        Ok(())
    }

    pub(crate) fn journal_path(dir: &Path, index: u64) -> PathBuf {
        dir.join(format!("journal-{:06}.bin", index))
    }
}

/// Parse the index out of a `journal-NNNNNN.bin` file name.
pub(crate) fn parse_journal_index(name: &str) -> Option<u64> {
    name.strip_prefix("journal-")?
        .strip_suffix(".bin")?
        .parse::<u64>()
        .ok()
}

fn latest_segment_index(dir: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|e| parse_journal_index(&e.file_name().to_string_lossy()))
        .max()
        .unwrap_or(0)
}

/// Shorten `path` to its last whole frame. Returns how many bytes were dropped.
fn cut_torn_tail(path: &Path) -> Result<u64, JournalError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut whole = 0usize;
    while let Ok((_, frame_len)) = JournalEntry::from_bytes(&data[whole..]) {
        whole += frame_len;
    }

    let dropped = (data.len() - whole) as u64;
    if dropped > 0 {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(whole as u64)?;
        file.sync_all()?;
        warn!(path = %path.display(), dropped_bytes = dropped, "Cut torn frame off journal tail");
    }
    Ok(dropped)
}
