//! Replication Verification
//!
//! Checks that committed entry hashes are discoverable in every configured
//! region through the cross-region metadata collaborator. Advisory only: a
//! degraded result never blocks a local commit.

pub mod http;
pub mod memory;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::audit::SignedEntry;

pub use http::HttpReplicationMetadata;
pub use memory::InMemoryReplicationMetadata;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("replication metadata unavailable: {0}")]
    Unavailable(String),

    #[error("replication metadata call timed out after {0:?}")]
    Timeout(Duration),

    #[error("no regions requested")]
    NoRegions,
}

/// Cross-region metadata collaborator
#[async_trait]
pub trait ReplicationMetadata: Send + Sync {
    async fn record(&self, entry_hash: &str, regions: &BTreeSet<String>) -> Result<(), SyncError>;

    /// Regions in which `entry_hash` is known
    async fn query(&self, entry_hash: &str) -> Result<BTreeSet<String>, SyncError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConsistencyStatus {
    Consistent {
        regions: BTreeSet<String>,
    },
    Partial {
        present: BTreeSet<String>,
        missing: BTreeSet<String>,
    },
    NotFound,
}

impl ConsistencyStatus {
    pub fn is_consistent(&self) -> bool {
        matches!(self, ConsistencyStatus::Consistent { .. })
    }
}

/// Replication state of one entry, as last observed by the verifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationRecord {
    pub entry_hash: String,
    pub regions: BTreeSet<String>,
    pub status: ConsistencyStatus,
    pub checked_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ReplicationVerifier {
    metadata: Arc<dyn ReplicationMetadata>,
    required_regions: BTreeSet<String>,
    call_timeout: Duration,
}

impl ReplicationVerifier {
    pub fn new(
        metadata: Arc<dyn ReplicationMetadata>,
        required_regions: impl IntoIterator<Item = impl Into<String>>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            metadata,
            required_regions: required_regions.into_iter().map(Into::into).collect(),
            call_timeout,
        }
    }

    pub fn required_regions(&self) -> &BTreeSet<String> {
        &self.required_regions
    }

    /// Record `entry` as replicated to `regions`, then report what is visible
    pub async fn sync(
        &self,
        entry: &SignedEntry,
        regions: &BTreeSet<String>,
    ) -> Result<ReplicationRecord, SyncError> {
        if regions.is_empty() {
            return Err(SyncError::NoRegions);
        }

        self.bounded(self.metadata.record(entry.entry_hash(), regions))
            .await?;
        debug!(entry_hash = %entry.entry_hash(), regions = ?regions, "replication recorded");

        let record = self.check_consistency(entry.entry_hash()).await?;
        if !record.status.is_consistent() {
            warn!(
                target: "audit_ledger::monitoring",
                entry_hash = %record.entry_hash,
                status = ?record.status,
                "degraded replication"
            );
        }
        Ok(record)
    }

    /// Sync to every required region
    pub async fn sync_required(&self, entry: &SignedEntry) -> Result<ReplicationRecord, SyncError> {
        let regions = self.required_regions.clone();
        self.sync(entry, &regions).await
    }

    /// Read-only comparison of visible regions against the required set
    pub async fn check_consistency(&self, entry_hash: &str) -> Result<ReplicationRecord, SyncError> {
        let regions = self.bounded(self.metadata.query(entry_hash)).await?;
        let status = classify(&self.required_regions, &regions);

        Ok(ReplicationRecord {
            entry_hash: entry_hash.to_string(),
            regions,
            status,
            checked_at: Utc::now(),
        })
    }

    async fn bounded<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, SyncError>>,
    ) -> Result<T, SyncError> {
        timeout(self.call_timeout, call)
            .await
            .map_err(|_| SyncError::Timeout(self.call_timeout))?
    }
}

fn classify(required: &BTreeSet<String>, present: &BTreeSet<String>) -> ConsistencyStatus {
    if present.is_empty() {
        return ConsistencyStatus::NotFound;
    }
    let missing: BTreeSet<String> = required.difference(present).cloned().collect();
    if missing.is_empty() {
        ConsistencyStatus::Consistent {
            regions: present.clone(),
        }
    } else {
        ConsistencyStatus::Partial {
            present: present.clone(),
            missing,
        }
    }
}
