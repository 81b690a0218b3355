//! In-memory ledger store used as a test double.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{LedgerStore, SortKey, StoreError};
use crate::audit::SignedEntry;

#[derive(Default)]
pub struct InMemoryLedgerStore {
    rows: RwLock<BTreeMap<SortKey, SignedEntry>>,
    unavailable: AtomicBool,
    write_delay_ms: AtomicU64,
    append_calls: AtomicU64,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `StoreError::Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Sleep before each write; the write still lands afterwards
    pub fn set_write_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.write_delay_ms.store(millis, Ordering::SeqCst);
    }

    pub fn append_calls(&self) -> u64 {
        self.append_calls.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.rows.read().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("in-memory store disabled".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn append_entry(&self, entry: &SignedEntry) -> Result<(), StoreError> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let mut rows = self
            .rows
            .write()
            .map_err(|e| StoreError::Unavailable(format!("store lock poisoned: {}", e)))?;
        rows.insert(SortKey::for_entry(entry), entry.clone());
        Ok(())
    }

    async fn read_range(
        &self,
        limit: usize,
        start_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<SignedEntry>, StoreError> {
        self.check_available()?;
        let rows = self
            .rows
            .read()
            .map_err(|e| StoreError::Unavailable(format!("store lock poisoned: {}", e)))?;

        let entries = match start_time {
            Some(start) => rows
                .range(SortKey::scan_start(start)..)
                .take(limit)
                .map(|(_, entry)| entry.clone())
                .collect(),
            None => rows.values().take(limit).cloned().collect(),
        };
        Ok(entries)
    }
}
