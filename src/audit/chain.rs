//! Hash-Chain Core
//!
//! Owns the chain pointer and serializes appends so that every entry links to
//! exactly one predecessor. The pointer only advances after the entry is
//! durably stored.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::audit::bundle::AuditBundle;
use crate::audit::entry::{EntryBuilder, EntryDraft, EventKind, Outcome, SignedEntry, GENESIS_HASH};
use crate::audit::verify::{verify_chain, verify_chain_from, VerificationReport};
use crate::crypto::{KeyVersion, SigningAdapter};
use crate::error::{LedgerError, Result};
use crate::replication::ReplicationVerifier;
use crate::store::{LedgerStore, StoreError};

/// Upper bounds for calls to external collaborators
#[derive(Debug, Clone, Copy)]
pub struct LedgerTimeouts {
    pub sign: Duration,
    pub store: Duration,
}

impl Default for LedgerTimeouts {
    fn default() -> Self {
        Self {
            sign: Duration::from_secs(5),
            store: Duration::from_secs(5),
        }
    }
}

/// Capped exponential backoff for transient append failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }
}

/// The chain pointer and the state needed to extend it
#[derive(Debug)]
struct ChainHead {
    last_entry_hash: String,
    last_timestamp: Option<DateTime<Utc>>,
    /// Set when a persistence outcome is unknown; the next append re-reads
    /// the pointer from the store.
    needs_resync: bool,
}

impl ChainHead {
    fn genesis() -> Self {
        Self {
            last_entry_hash: GENESIS_HASH.to_string(),
            last_timestamp: None,
            needs_resync: false,
        }
    }

    fn from_latest(latest: Option<&SignedEntry>) -> Self {
        match latest {
            Some(entry) => Self {
                last_entry_hash: entry.entry_hash().to_string(),
                last_timestamp: Some(entry.timestamp()),
                needs_resync: false,
            },
            None => Self::genesis(),
        }
    }

    /// Strictly after the previous entry, at microsecond resolution
    fn next_timestamp(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let now = now.trunc_subsecs(6);
        match self.last_timestamp {
            Some(last) if now <= last => last + chrono::Duration::microseconds(1),
            _ => now,
        }
    }

    fn advance(&mut self, entry: &SignedEntry) {
        self.last_entry_hash = entry.entry_hash().to_string();
        self.last_timestamp = Some(entry.timestamp());
        self.needs_resync = false;
    }
}

/// Handle to one logical chain
///
/// Obtained once at startup and passed to callers; clones share the same
/// pointer and lock.
#[derive(Clone)]
pub struct Ledger {
    chain_id: String,
    head: Arc<Mutex<ChainHead>>,
    store: Arc<dyn LedgerStore>,
    signer: SigningAdapter,
    replication: Option<ReplicationVerifier>,
    timeouts: LedgerTimeouts,
}

impl Ledger {
    /// New chain starting at the genesis pointer
    pub fn new(
        chain_id: impl Into<String>,
        store: Arc<dyn LedgerStore>,
        signer: SigningAdapter,
        timeouts: LedgerTimeouts,
    ) -> Self {
        Self::with_head(chain_id.into(), ChainHead::genesis(), store, signer, timeouts)
    }

    /// Resume a chain from the most recent entry already in `store`
    pub async fn open(
        chain_id: impl Into<String>,
        store: Arc<dyn LedgerStore>,
        signer: SigningAdapter,
        timeouts: LedgerTimeouts,
    ) -> Result<Self> {
        let chain_id = chain_id.into();
        let latest = bounded_read(&store, timeouts.store, 1).await?;
        let head = ChainHead::from_latest(latest.first());
        info!(
            chain_id = %chain_id,
            head_hash = %head.last_entry_hash,
            "ledger opened"
        );
        Ok(Self::with_head(chain_id, head, store, signer, timeouts))
    }

    fn with_head(
        chain_id: String,
        head: ChainHead,
        store: Arc<dyn LedgerStore>,
        signer: SigningAdapter,
        timeouts: LedgerTimeouts,
    ) -> Self {
        Self {
            chain_id,
            head: Arc::new(Mutex::new(head)),
            store,
            signer,
            replication: None,
            timeouts,
        }
    }

    /// Sync every committed entry to the verifier's regions in the background
    pub fn with_replication(mut self, verifier: ReplicationVerifier) -> Self {
        self.replication = Some(verifier);
        self
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    pub fn signer(&self) -> &SigningAdapter {
        &self.signer
    }

    pub fn replication(&self) -> Option<&ReplicationVerifier> {
        self.replication.as_ref()
    }

    /// Current chain pointer; waits for any in-flight append
    pub async fn head_hash(&self) -> String {
        self.head.lock().await.last_entry_hash.clone()
    }

    /// Build, sign and persist one entry, then advance the pointer
    ///
    /// Dropping the returned future before persistence is issued has no
    /// effect. Once issued, persistence runs to completion on its own task
    /// and the lock is released only after the pointer reflects the outcome.
    pub async fn append(&self, draft: EntryDraft) -> Result<SignedEntry> {
        let mut head = Arc::clone(&self.head).lock_owned().await;
        if head.needs_resync {
            self.resync(&mut head).await?;
        }

        let timestamp = head.next_timestamp(Utc::now());
        let entry = EntryBuilder::build_at(draft, &head.last_entry_hash, timestamp)?;

        let signature = match timeout(self.timeouts.sign, self.signer.sign(entry.entry_hash())).await {
            Ok(signature) => signature?,
            Err(_) => {
                warn!(chain_id = %self.chain_id, entry_hash = %entry.entry_hash(), "signing timed out");
                return Err(LedgerError::Indeterminate { operation: "signing" });
            }
        };
        let signed = SignedEntry::new(entry, signature);

        let store = Arc::clone(&self.store);
        let store_timeout = self.timeouts.store;
        let committed = signed.clone();
        let persist = tokio::spawn(async move {
            match timeout(store_timeout, store.append_entry(&committed)).await {
                Ok(Ok(())) => {
                    head.advance(&committed);
                    Ok(())
                }
                Ok(Err(e)) => {
                    head.needs_resync = true;
                    Err(LedgerError::Store(e))
                }
                Err(_) => {
                    head.needs_resync = true;
                    Err(LedgerError::Indeterminate { operation: "persistence" })
                }
            }
        });

        if let Err(e) = persist
            .await
            .map_err(|e| LedgerError::TaskFailed(e.to_string()))?
        {
            warn!(chain_id = %self.chain_id, entry_hash = %signed.entry_hash(), error = %e, "append not committed");
            return Err(e);
        }

        info!(
            chain_id = %self.chain_id,
            entry_hash = %signed.entry_hash(),
            event_kind = %signed.entry().event_kind(),
            key_version = %signed.signature().key_version,
            "audit entry committed"
        );
        self.replicate(&signed);
        Ok(signed)
    }

    /// `append` with capped exponential backoff on transient failures
    ///
    /// Every attempt re-reads the pointer. After an indeterminate persistence
    /// the retry may record the event a second time; the chain stays linear.
    pub async fn append_with_retry(&self, draft: EntryDraft, policy: &RetryPolicy) -> Result<SignedEntry> {
        let mut attempt = 1;
        loop {
            match self.append(draft.clone()).await {
                Ok(entry) => return Ok(entry),
                Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    warn!(
                        chain_id = %self.chain_id,
                        attempt,
                        delay_ms = saturating_millis(delay),
                        error = %e,
                        "retrying append"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn resync(&self, head: &mut ChainHead) -> Result<()> {
        let latest = bounded_read(&self.store, self.timeouts.store, 1).await?;
        *head = ChainHead::from_latest(latest.first());
        info!(chain_id = %self.chain_id, head_hash = %head.last_entry_hash, "chain pointer resynced from store");
        Ok(())
    }

    fn replicate(&self, entry: &SignedEntry) {
        let Some(verifier) = self.replication.clone() else {
            return;
        };
        let entry = entry.clone();
        tokio::spawn(async move {
            match verifier.sync_required(&entry).await {
                Ok(record) => debug!(entry_hash = %record.entry_hash, status = ?record.status, "replication synced"),
                Err(e) => warn!(
                    target: "audit_ledger::monitoring",
                    entry_hash = %entry.entry_hash(),
                    error = %e,
                    "replication sync failed"
                ),
            }
        });
    }

    /// Most recent entries first
    pub async fn read_range(&self, limit: usize, start_time: Option<DateTime<Utc>>) -> Result<Vec<SignedEntry>> {
        match timeout(self.timeouts.store, self.store.read_range(limit, start_time)).await {
            Ok(entries) => Ok(entries?),
            Err(_) => Err(StoreError::Unavailable("read timed out".to_string()).into()),
        }
    }

    /// Verify persisted entries; a full read is anchored at genesis
    ///
    /// Works purely from the store and never touches the chain pointer.
    pub async fn verify_stored(&self, limit: Option<usize>) -> Result<VerificationReport> {
        let entries = self.read_range(limit.unwrap_or(usize::MAX), None).await?;
        let report = match limit {
            None => verify_chain_from(&entries, Some(GENESIS_HASH), &self.signer).await,
            Some(_) => verify_chain(&entries, &self.signer).await,
        };
        Ok(report)
    }

    /// Rotate the signing key and record the rotation in the chain
    ///
    /// When the signer is shared with other chains, rotate once through the
    /// signer and call [`Ledger::record_key_rotation`] on each chain instead.
    pub async fn rotate_key(&self, actor: &str, policy: &RetryPolicy) -> Result<(KeyVersion, SignedEntry)> {
        let version = self.signer.rotate().await?;
        let entry = self.record_key_rotation(actor, version, policy).await?;
        Ok((version, entry))
    }

    /// Append the KeyRotation entry for a key that is already active
    ///
    /// The rotation cannot be undone, so a failure here leaves the chain
    /// without its rotation record and is reported on the monitoring target.
    pub async fn record_key_rotation(
        &self,
        actor: &str,
        version: KeyVersion,
        policy: &RetryPolicy,
    ) -> Result<SignedEntry> {
        let draft = EntryDraft::new(
            EventKind::KeyRotation,
            actor,
            format!("signing-key/{}", self.chain_id),
            "rotate",
            "global",
            Outcome::Success,
        )
        .with_metadata("key_version", version.0);

        self.append_with_retry(draft, policy).await.inspect_err(|e| {
            error!(
                target: "audit_ledger::monitoring",
                chain_id = %self.chain_id,
                key_version = %version,
                error = %e,
                "key rotated but rotation entry not recorded"
            );
        })
    }

    /// Export entries (oldest first) with the public keys needed to check them
    pub async fn export_bundle(&self, limit: Option<usize>) -> Result<AuditBundle> {
        let mut entries = self.read_range(limit.unwrap_or(usize::MAX), None).await?;
        entries.reverse();

        let versions: BTreeSet<KeyVersion> = entries.iter().map(|e| e.signature().key_version).collect();
        let mut public_keys = BTreeMap::new();
        for version in versions {
            let key = self.signer.public_key(version).await?;
            public_keys.insert(version, hex::encode(key));
        }

        let bundle = AuditBundle::seal(&self.chain_id, entries, public_keys)?;
        info!(chain_id = %self.chain_id, entries = bundle.entries.len(), digest = %bundle.digest, "audit bundle exported");
        Ok(bundle)
    }
}

async fn bounded_read(store: &Arc<dyn LedgerStore>, limit_timeout: Duration, limit: usize) -> Result<Vec<SignedEntry>> {
    match timeout(limit_timeout, store.read_range(limit, None)).await {
        Ok(entries) => Ok(entries?),
        Err(_) => Err(LedgerError::Indeterminate { operation: "pointer read" }),
    }
}

/// Independent chains keyed by jurisdiction, each with its own lock and pointer
#[derive(Clone, Default)]
pub struct PartitionedLedger {
    chains: HashMap<String, Ledger>,
}

impl PartitionedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, jurisdiction: impl Into<String>, ledger: Ledger) {
        self.chains.insert(jurisdiction.into(), ledger);
    }

    pub fn chain(&self, jurisdiction: &str) -> Option<&Ledger> {
        self.chains.get(jurisdiction)
    }

    pub fn jurisdictions(&self) -> impl Iterator<Item = &str> {
        self.chains.keys().map(String::as_str)
    }

    pub fn chains(&self) -> impl Iterator<Item = &Ledger> {
        self.chains.values()
    }

    fn route(&self, jurisdiction: &str) -> Result<&Ledger> {
        self.chains.get(jurisdiction).ok_or_else(|| {
            LedgerError::invalid_field(
                "jurisdiction",
                format!("no chain configured for jurisdiction {}", jurisdiction),
            )
        })
    }

    /// Route to the chain for `draft.jurisdiction`
    pub async fn append(&self, draft: EntryDraft) -> Result<SignedEntry> {
        self.route(&draft.jurisdiction)?.append(draft).await
    }

    pub async fn append_with_retry(&self, draft: EntryDraft, policy: &RetryPolicy) -> Result<SignedEntry> {
        self.route(&draft.jurisdiction)?
            .append_with_retry(draft, policy)
            .await
    }
}

fn saturating_millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}
