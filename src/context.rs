//! Wires the ledger and its collaborators together from configuration.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::audit::{EntryDraft, Ledger, PartitionedLedger, SignedEntry};
use crate::config::{LedgerConfig, SigningMode};
use crate::crypto::{KeyVersion, LocalKeyring, RemoteSigner, SigningAdapter};
use crate::error::Result;
use crate::replication::{HttpReplicationMetadata, ReplicationVerifier};
use crate::store::SqliteLedgerStore;

pub struct LedgerContext {
    pub config: LedgerConfig,
    pub signer: SigningAdapter,
    pub replication: Option<ReplicationVerifier>,
    /// The chain named by `chain_id`
    pub ledger: Ledger,
    /// Per-jurisdiction chains when `partitions` is configured
    pub partitions: Option<PartitionedLedger>,
}

impl LedgerContext {
    pub async fn from_config(config: LedgerConfig) -> Result<Self> {
        let signer = build_signer(&config).await?;
        let replication = build_replication(&config)?;

        let store = SqliteLedgerStore::connect(&config.database_url, config.chain_id.as_str()).await?;
        let pool = store.pool().clone();
        let ledger = open_ledger(&config, &config.chain_id, store, &signer, &replication).await?;

        let partitions = if config.partitions.is_empty() {
            None
        } else {
            let mut partitioned = PartitionedLedger::new();
            for jurisdiction in &config.partitions {
                let chain_id = format!("{}:{}", config.chain_id, jurisdiction);
                let store = SqliteLedgerStore::with_pool(pool.clone(), chain_id.as_str());
                let chain = open_ledger(&config, &chain_id, store, &signer, &replication).await?;
                partitioned.insert(jurisdiction.as_str(), chain);
            }
            Some(partitioned)
        };

        info!(
            chain_id = %config.chain_id,
            partitions = config.partitions.len(),
            replication = replication.is_some(),
            "ledger context ready"
        );

        Ok(Self {
            config,
            signer,
            replication,
            ledger,
            partitions,
        })
    }

    /// Append with the configured retry policy, routed to the jurisdiction's
    /// chain when partitions are configured
    pub async fn append(&self, draft: EntryDraft) -> Result<SignedEntry> {
        let policy = self.config.retry_policy();
        match &self.partitions {
            Some(partitions) => partitions.append_with_retry(draft, &policy).await,
            None => self.ledger.append_with_retry(draft, &policy).await,
        }
    }

    /// Rotate the shared signing key and record the rotation on every chain
    ///
    /// Each chain is attempted even if an earlier one fails; the first
    /// failure is returned.
    pub async fn rotate_key(&self, actor: &str) -> Result<(KeyVersion, Vec<SignedEntry>)> {
        let policy = self.config.retry_policy();
        let version = self.signer.rotate().await?;

        let chains = std::iter::once(&self.ledger).chain(self.partitions.iter().flat_map(PartitionedLedger::chains));
        let mut recorded = Vec::new();
        let mut first_error = None;
        for chain in chains {
            match chain.record_key_rotation(actor, version, &policy).await {
                Ok(entry) => recorded.push(entry),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok((version, recorded)),
        }
    }

    /// Chain for `jurisdiction`, or the default chain when none is given
    pub fn ledger_for(&self, jurisdiction: Option<&str>) -> Option<&Ledger> {
        match (jurisdiction, &self.partitions) {
            (Some(jurisdiction), Some(partitions)) => partitions.chain(jurisdiction),
            (Some(_), None) | (None, _) => Some(&self.ledger),
        }
    }
}

async fn open_ledger(
    config: &LedgerConfig,
    chain_id: &str,
    store: SqliteLedgerStore,
    signer: &SigningAdapter,
    replication: &Option<ReplicationVerifier>,
) -> Result<Ledger> {
    let ledger = Ledger::open(chain_id, Arc::new(store), signer.clone(), config.timeouts()).await?;
    Ok(match replication {
        Some(verifier) => ledger.with_replication(verifier.clone()),
        None => ledger,
    })
}

async fn build_signer(config: &LedgerConfig) -> Result<SigningAdapter> {
    let signer = match config.signing.mode {
        SigningMode::Local => {
            let keyring = LocalKeyring::load_or_create(&config.signing.keyring_path).await?;
            info!(path = %config.signing.keyring_path, "using local keyring");
            SigningAdapter::new(Arc::new(keyring))
        }
        SigningMode::Remote => {
            let timeout = Duration::from_millis(config.signing.timeout_ms);
            let remote = RemoteSigner::new(config.signing.url.as_str(), timeout)?;
            info!(url = %config.signing.url, "using remote signer");
            SigningAdapter::new(Arc::new(remote))
        }
    };
    Ok(signer)
}

fn build_replication(config: &LedgerConfig) -> Result<Option<ReplicationVerifier>> {
    if !config.replication.enabled {
        return Ok(None);
    }
    let metadata = HttpReplicationMetadata::new(config.replication.url.as_str(), config.replication_timeout())?;
    Ok(Some(ReplicationVerifier::new(
        Arc::new(metadata),
        config.replication.regions.iter().cloned(),
        config.replication_timeout(),
    )))
}
