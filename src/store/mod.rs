//! Ledger Store
//!
//! Append/read contract over the external high-throughput store, and the
//! key layout that turns a reverse-chronological walk into a forward scan.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audit::SignedEntry;

pub use memory::InMemoryLedgerStore;
pub use sqlite::SqliteLedgerStore;

/// Hex characters of the entry hash appended to the sort key
pub const HASH_PREFIX_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt stored entry: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Row key: `(MAX - timestamp_micros)` zero-padded, then `:` and a hash prefix.
///
/// Keys sort ascending in reverse-chronological order. The hash prefix only
/// disambiguates identical timestamps and carries no chain meaning.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SortKey(String);

impl SortKey {
    pub fn new(timestamp: DateTime<Utc>, entry_hash: &str) -> Self {
        let prefix: String = entry_hash.chars().take(HASH_PREFIX_LEN).collect();
        Self(format!("{:020}:{}", inverted_micros(timestamp), prefix))
    }

    pub fn for_entry(entry: &SignedEntry) -> Self {
        Self::new(entry.timestamp(), entry.entry_hash())
    }

    /// Smallest key belonging to an entry at or before `timestamp`
    pub fn scan_start(timestamp: DateTime<Utc>) -> Self {
        Self(format!("{:020}", inverted_micros(timestamp)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn inverted_micros(timestamp: DateTime<Utc>) -> u64 {
    let micros = u64::try_from(timestamp.timestamp_micros()).unwrap_or(0);
    u64::MAX - micros
}

/// Durable storage for signed entries
///
/// Implementations must treat a repeated `append_entry` with the same key as
/// an overwrite, never a second row, and must not retry internally.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn append_entry(&self, entry: &SignedEntry) -> Result<(), StoreError>;

    /// Up to `limit` entries, most recent first, starting at `start_time`
    /// (inclusive) when given
    async fn read_range(
        &self,
        limit: usize,
        start_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<SignedEntry>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_newer_entries_sort_first() {
        let older = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let newer = older + chrono::Duration::microseconds(1);

        let a = SortKey::new(older, "ffff");
        let b = SortKey::new(newer, "0000");
        assert!(b < a);
    }

    #[test]
    fn test_fixed_width_layout() {
        let ts = Utc.timestamp_micros(1_000_000).unwrap();
        let key = SortKey::new(ts, "0123456789abcdef0123456789abcdef");

        assert_eq!(key.as_str(), "18446744073708551615:0123456789abcdef");
    }

    #[test]
    fn test_scan_start_includes_same_timestamp() {
        let ts = Utc.with_ymd_and_hms(2026, 5, 5, 5, 5, 5).unwrap();
        let start = SortKey::scan_start(ts);

        assert!(start <= SortKey::new(ts, "00"));
        assert!(start > SortKey::new(ts + chrono::Duration::seconds(1), "ff"));
        assert!(start < SortKey::new(ts - chrono::Duration::seconds(1), "00"));
    }
}
