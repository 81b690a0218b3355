//! Audit Bundle Export
//!
//! Self-contained export of a chain segment for offline verification by a
//! third party: entries oldest first, the public keys that signed them, a
//! Merkle root over entry hashes and a digest over the whole document.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audit::entry::{canonical_json, sha256_hex, SignedEntry};
use crate::audit::merkle::{inclusion_proof, merkle_root, MerkleProof};
use crate::audit::verify::{verify_chain, VerificationReport};
use crate::crypto::{KeyVersion, SigningAdapter, StaticKeys};
use crate::error::{LedgerError, Result};

pub const BUNDLE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditBundle {
    pub format_version: u32,
    pub chain_id: String,
    pub exported_at: DateTime<Utc>,
    pub entries: Vec<SignedEntry>,
    /// Hex-encoded compressed secp256k1 public keys by version
    pub public_keys: BTreeMap<KeyVersion, String>,
    pub merkle_root: Option<String>,
    /// SHA-256 over the canonical JSON of every other field
    pub digest: String,
}

/// Outcome of checking a bundle offline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleReport {
    pub digest_valid: bool,
    pub merkle_valid: bool,
    pub chain: VerificationReport,
}

impl BundleReport {
    pub fn is_valid(&self) -> bool {
        self.digest_valid && self.merkle_valid && self.chain.chain_valid
    }
}

impl AuditBundle {
    /// Assemble a bundle from entries in ascending order and compute its digest
    pub fn seal(
        chain_id: &str,
        entries: Vec<SignedEntry>,
        public_keys: BTreeMap<KeyVersion, String>,
    ) -> Result<Self> {
        let leaves: Vec<String> = entries.iter().map(|e| e.entry_hash().to_string()).collect();
        let mut bundle = Self {
            format_version: BUNDLE_FORMAT_VERSION,
            chain_id: chain_id.to_string(),
            exported_at: Utc::now().trunc_subsecs(6),
            entries,
            public_keys,
            merkle_root: merkle_root(&leaves),
            digest: String::new(),
        };
        bundle.digest = bundle.compute_digest()?;
        Ok(bundle)
    }

    pub fn compute_digest(&self) -> Result<String> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(fields) = &mut value {
            fields.remove("digest");
        }
        Ok(sha256_hex(canonical_json(&value).as_bytes()))
    }

    pub fn verify_digest(&self) -> bool {
        self.compute_digest()
            .map(|digest| digest == self.digest)
            .unwrap_or(false)
    }

    fn leaves(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.entry_hash().to_string()).collect()
    }

    pub fn verify_merkle_root(&self) -> bool {
        merkle_root(&self.leaves()) == self.merkle_root
    }

    /// Proof that the entry with `entry_hash` is covered by `merkle_root`
    pub fn inclusion_proof(&self, entry_hash: &str) -> Result<MerkleProof> {
        let leaves = self.leaves();
        let index = leaves.iter().position(|leaf| leaf == entry_hash).ok_or_else(|| {
            LedgerError::invalid_field("entry_hash", format!("{} is not in this bundle", entry_hash))
        })?;
        inclusion_proof(&leaves, index)
    }

    /// Check digest, Merkle root, hashes, links and signatures using only the
    /// keys carried in the bundle
    pub async fn verify(&self) -> Result<BundleReport> {
        let keys = StaticKeys::from_hex(&self.public_keys)?;
        let signer = SigningAdapter::new(Arc::new(keys));
        let chain = verify_chain(&self.entries, &signer).await;

        Ok(BundleReport {
            digest_valid: self.verify_digest(),
            merkle_valid: self.verify_merkle_root(),
            chain,
        })
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::{EntryBuilder, EntryDraft, EventKind, Outcome, GENESIS_HASH};
    use crate::crypto::LocalKeyring;

    async fn sealed(len: usize) -> AuditBundle {
        let signer = SigningAdapter::new(Arc::new(LocalKeyring::generate()));
        let mut previous = GENESIS_HASH.to_string();
        let mut entries = Vec::new();
        for i in 0..len {
            let draft = EntryDraft::new(
                EventKind::ConsentValidation,
                format!("subject-{}", i),
                "consent/marketing",
                "withdraw",
                "EU",
                Outcome::Success,
            )
            .with_metadata("ratio", 0.1 + i as f64);
            let entry = EntryBuilder::build(draft, &previous).unwrap();
            previous = entry.entry_hash().to_string();
            let signature = signer.sign(entry.entry_hash()).await.unwrap();
            entries.push(SignedEntry::new(entry, signature));
        }
        let key = signer.public_key(KeyVersion(1)).await.unwrap();
        let keys = BTreeMap::from([(KeyVersion(1), hex::encode(key))]);
        AuditBundle::seal("eu", entries, keys).unwrap()
    }

    #[tokio::test]
    async fn test_sealed_bundle_verifies() {
        let bundle = sealed(3).await;
        let report = bundle.verify().await.unwrap();
        assert!(report.is_valid(), "{:?}", report);
        assert_eq!(report.chain.total, 3);
    }

    #[tokio::test]
    async fn test_digest_survives_file_round_trip() {
        let bundle = sealed(2).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.json");

        bundle.save(&path).await.unwrap();
        let loaded = AuditBundle::load(&path).await.unwrap();
        assert!(loaded.verify_digest());
        assert_eq!(loaded, bundle);
    }

    #[tokio::test]
    async fn test_edited_bundle_is_detected() {
        let mut bundle = sealed(3).await;
        bundle.entries[1].entry.actor = "someone-else".into();

        let report = bundle.verify().await.unwrap();
        assert!(!report.digest_valid);
        assert!(report.merkle_valid, "stored hashes were not touched");
        assert!(!report.chain.chain_valid);
        assert!(!report.is_valid());
    }

    #[tokio::test]
    async fn test_dropped_entry_breaks_merkle_root() {
        let mut bundle = sealed(4).await;
        bundle.entries.remove(3);
        assert!(!bundle.verify_merkle_root());
    }

    #[tokio::test]
    async fn test_inclusion_proof_for_entry() {
        let bundle = sealed(5).await;
        let target = bundle.entries[3].entry_hash().to_string();
        let proof = bundle.inclusion_proof(&target).unwrap();
        assert!(proof.verify(bundle.merkle_root.as_deref().unwrap()));
        assert!(bundle.inclusion_proof(&"f".repeat(64)).is_err());
    }
}
