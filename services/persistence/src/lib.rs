//! Fill Journal Persistence
//!
//! Provides the append-only fill journal, a sequential reader with
//! corruption detection, the record taxonomy stored in journal frames, and
//! the `FillStore` abstraction the reconciliation service writes through.
//!
//! # Guarantees
//! - One journal entry per accepted fill or administrative edit
//! - CRC32C checksum on every entry
//! - Torn tails are cut on reopen; corrupt frames are skipped on read
//! - Strictly increasing entry sequences across rotated files

pub mod journal;
pub mod reader;
pub mod records;
pub mod store;
