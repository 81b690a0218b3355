//! In-memory replication metadata used as a test double.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;

use super::{ReplicationMetadata, SyncError};

#[derive(Default)]
pub struct InMemoryReplicationMetadata {
    regions: RwLock<HashMap<String, BTreeSet<String>>>,
    /// Regions that silently drop writes, to simulate partial replication
    lagging: RwLock<BTreeSet<String>>,
    unavailable: AtomicBool,
    delay_ms: AtomicU64,
}

impl InMemoryReplicationMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_region_lagging(&self, region: &str, lagging: bool) {
        if let Ok(mut set) = self.lagging.write() {
            if lagging {
                set.insert(region.to_string());
            } else {
                set.remove(region);
            }
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.delay_ms.store(millis, Ordering::SeqCst);
    }

    async fn simulate_latency(&self) -> Result<(), SyncError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SyncError::Unavailable("in-memory metadata disabled".to_string()));
        }
        Ok(())
    }
}

fn poisoned<E: std::fmt::Display>(err: E) -> SyncError {
    SyncError::Unavailable(format!("metadata lock poisoned: {}", err))
}

#[async_trait]
impl ReplicationMetadata for InMemoryReplicationMetadata {
    async fn record(&self, entry_hash: &str, regions: &BTreeSet<String>) -> Result<(), SyncError> {
        self.simulate_latency().await?;

        let lagging = self.lagging.read().map_err(poisoned)?.clone();
        let mut known = self.regions.write().map_err(poisoned)?;
        let entry = known.entry(entry_hash.to_string()).or_default();
        entry.extend(regions.iter().filter(|r| !lagging.contains(*r)).cloned());
        Ok(())
    }

    async fn query(&self, entry_hash: &str) -> Result<BTreeSet<String>, SyncError> {
        self.simulate_latency().await?;

        let known = self.regions.read().map_err(poisoned)?;
        Ok(known.get(entry_hash).cloned().unwrap_or_default())
    }
}
