//! Audit Chain Verification
//!
//! Re-derives every entry hash, checks hash-chain continuity and delegates
//! signature checks. Findings are aggregated so one scan shows the full
//! extent of any tampering.

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::audit::entry::SignedEntry;
use crate::crypto::{KeyVersion, SignatureCheck, SigningAdapter};

/// A single integrity violation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Finding {
    /// Stored hash disagrees with the hash recomputed from the fields
    HashMismatch {
        index: usize,
        stored: String,
        recomputed: String,
    },
    /// `previous_hash` does not match the predecessor (or the anchor when
    /// `previous_index` is `None`)
    ChainBreak {
        index: usize,
        previous_index: Option<usize>,
        expected: String,
        found: String,
    },
    InvalidSignature {
        index: usize,
        key_version: KeyVersion,
    },
    /// The signature check could not be attempted
    SignatureUnverifiable {
        index: usize,
        key_version: KeyVersion,
        reason: String,
    },
}

impl Finding {
    pub fn index(&self) -> usize {
        match self {
            Finding::HashMismatch { index, .. }
            | Finding::ChainBreak { index, .. }
            | Finding::InvalidSignature { index, .. }
            | Finding::SignatureUnverifiable { index, .. } => *index,
        }
    }

    fn blocks_chain(&self) -> bool {
        !matches!(self, Finding::HashMismatch { .. })
    }
}

/// Result of verifying an ordered set of entries
///
/// `chain_valid == false` must be treated as blocking; there is no partially
/// trusted chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub total: usize,
    /// Entries whose stored hash matches their fields
    pub valid_count: usize,
    pub chain_valid: bool,
    pub findings: Vec<Finding>,
}

impl VerificationReport {
    pub fn summary(&self) -> String {
        if self.chain_valid {
            format!("✅ Audit chain is valid ({} entries)", self.total)
        } else {
            format!(
                "❌ Audit chain is invalid ({} of {} entries intact, {} findings)",
                self.valid_count,
                self.total,
                self.findings.len()
            )
        }
    }
}

/// Verify `entries` in timestamp order without an anchor for the first entry
pub async fn verify_chain(entries: &[SignedEntry], signer: &SigningAdapter) -> VerificationReport {
    verify_chain_from(entries, None, signer).await
}

/// Verify `entries`, additionally requiring the first `previous_hash` to
/// equal `anchor` when one is given
pub async fn verify_chain_from(
    entries: &[SignedEntry],
    anchor: Option<&str>,
    signer: &SigningAdapter,
) -> VerificationReport {
    let ordered = order_for_verification(entries);
    let mut findings = Vec::new();
    let mut valid_count = 0;

    for (index, entry) in ordered.iter().enumerate() {
        let recomputed = entry.entry().calculate_hash();
        if recomputed != entry.entry_hash() {
            findings.push(Finding::HashMismatch {
                index,
                stored: entry.entry_hash().to_string(),
                recomputed,
            });
            continue;
        }
        valid_count += 1;

        let expected = match index.checked_sub(1) {
            Some(previous) => ordered
                .get(previous)
                .map(|prev| (Some(previous), prev.entry_hash())),
            None => anchor.map(|anchor| (None, anchor)),
        };
        if let Some((previous_index, expected)) = expected {
            if entry.previous_hash() != expected {
                findings.push(Finding::ChainBreak {
                    index,
                    previous_index,
                    expected: expected.to_string(),
                    found: entry.previous_hash().to_string(),
                });
            }
        }

        let key_version = entry.signature().key_version;
        match signer.verify(entry.entry_hash(), entry.signature()).await {
            Ok(SignatureCheck::Valid) => {}
            Ok(SignatureCheck::Invalid) => {
                findings.push(Finding::InvalidSignature { index, key_version });
            }
            Err(e) => findings.push(Finding::SignatureUnverifiable {
                index,
                key_version,
                reason: e.to_string(),
            }),
        }
    }

    let total = ordered.len();
    let chain_valid = valid_count == total && !findings.iter().any(Finding::blocks_chain);

    for finding in &findings {
        error!(finding = ?finding, "audit chain integrity violation");
    }
    info!(total, valid_count, chain_valid, "audit chain verified");

    VerificationReport {
        total,
        valid_count,
        chain_valid,
        findings,
    }
}

/// Ascending timestamp order; entries sharing a timestamp follow their links
pub fn order_for_verification(entries: &[SignedEntry]) -> Vec<&SignedEntry> {
    let mut by_time: Vec<&SignedEntry> = entries.iter().collect();
    by_time.sort_by_key(|entry| entry.timestamp());

    let mut ordered: Vec<&SignedEntry> = Vec::with_capacity(by_time.len());
    let mut start = 0;
    while start < by_time.len() {
        let timestamp = by_time[start].timestamp();
        let end = by_time[start..]
            .iter()
            .position(|entry| entry.timestamp() != timestamp)
            .map_or(by_time.len(), |offset| start + offset);

        let mut group: Vec<&SignedEntry> = by_time[start..end].to_vec();
        while !group.is_empty() {
            let last_hash = ordered.last().map(|entry| entry.entry_hash());
            let next = group
                .iter()
                .position(|entry| Some(entry.previous_hash()) == last_hash)
                .unwrap_or(0);
            ordered.push(group.remove(next));
        }
        start = end;
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::{EntryBuilder, EntryDraft, EventKind, Outcome, GENESIS_HASH};
    use crate::crypto::{EntrySignature, LocalKeyring};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn draft(actor: &str) -> EntryDraft {
        EntryDraft::new(EventKind::SovereigntyCheck, actor, "bucket/eu", "store", "EU", Outcome::Success)
    }

    async fn chain(signer: &SigningAdapter, len: usize, same_timestamp: bool) -> Vec<SignedEntry> {
        let base = Utc.with_ymd_and_hms(2026, 2, 2, 0, 0, 0).unwrap();
        let mut previous = GENESIS_HASH.to_string();
        let mut out = Vec::new();
        for i in 0..len {
            let offset = if same_timestamp { 0 } else { i as i64 };
            let ts = base + chrono::Duration::seconds(offset);
            let entry = EntryBuilder::build_at(draft(&format!("actor-{}", i)), &previous, ts).unwrap();
            let signature = signer.sign(entry.entry_hash()).await.unwrap();
            previous = entry.entry_hash().to_string();
            out.push(SignedEntry::new(entry, signature));
        }
        out
    }

    fn signer() -> SigningAdapter {
        SigningAdapter::new(Arc::new(LocalKeyring::generate()))
    }

    #[tokio::test]
    async fn test_valid_chain() {
        let signer = signer();
        let entries = chain(&signer, 4, false).await;

        let report = verify_chain_from(&entries, Some(GENESIS_HASH), &signer).await;
        assert_eq!(report.total, 4);
        assert_eq!(report.valid_count, 4);
        assert!(report.chain_valid);
        assert!(report.findings.is_empty());
    }

    #[tokio::test]
    async fn test_empty_chain_is_valid() {
        let report = verify_chain(&[], &signer()).await;
        assert_eq!(report.total, 0);
        assert!(report.chain_valid);
    }

    #[tokio::test]
    async fn test_reverse_input_is_sorted_first() {
        let signer = signer();
        let mut entries = chain(&signer, 5, false).await;
        entries.reverse();

        assert!(verify_chain(&entries, &signer).await.chain_valid);
    }

    #[tokio::test]
    async fn test_same_timestamp_follows_links() {
        let signer = signer();
        let mut entries = chain(&signer, 3, true).await;
        entries.reverse();

        let report = verify_chain_from(&entries, Some(GENESIS_HASH), &signer).await;
        assert!(report.chain_valid, "{:?}", report.findings);
    }

    #[tokio::test]
    async fn test_mutated_field_reports_hash_mismatch() {
        let signer = signer();
        let mut entries = chain(&signer, 3, false).await;
        entries[1].entry.outcome = Outcome::Violation;

        let report = verify_chain(&entries, &signer).await;
        assert!(!report.chain_valid);
        assert_eq!(report.valid_count, 2);
        assert_eq!(report.findings.len(), 1);
        assert!(matches!(report.findings[0], Finding::HashMismatch { index: 1, .. }));
    }

    #[tokio::test]
    async fn test_rehashed_previous_hash_reports_chain_break() {
        let signer = signer();
        let mut entries = chain(&signer, 4, false).await;

        // Forge a consistent hash so only the link is wrong.
        let forged = &mut entries[2].entry;
        forged.previous_hash = "ab".repeat(32);
        forged.entry_hash = forged.calculate_hash();

        let report = verify_chain(&entries, &signer).await;
        assert!(!report.chain_valid);
        assert!(report.findings.contains(&Finding::ChainBreak {
            index: 2,
            previous_index: Some(1),
            expected: entries[1].entry_hash().to_string(),
            found: "ab".repeat(32),
        }));
        // The recomputed hash no longer matches the old signature either.
        assert!(report
            .findings
            .iter()
            .any(|f| matches!(f, Finding::InvalidSignature { index: 2, .. })));
    }

    #[tokio::test]
    async fn test_anchor_mismatch() {
        let signer = signer();
        let entries = chain(&signer, 2, false).await;
        let anchor = "1".repeat(64);

        let report = verify_chain_from(&entries, Some(&anchor), &signer).await;
        assert!(matches!(
            report.findings[0],
            Finding::ChainBreak { index: 0, previous_index: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_foreign_signature_is_invalid() {
        let signer = signer();
        let mut entries = chain(&signer, 2, false).await;
        let other = SigningAdapter::new(Arc::new(LocalKeyring::generate()));
        entries[0].signature = other.sign(entries[0].entry_hash()).await.unwrap();

        let report = verify_chain(&entries, &signer).await;
        assert_eq!(report.valid_count, 2);
        assert!(!report.chain_valid);
        assert_eq!(
            report.findings,
            vec![Finding::InvalidSignature {
                index: 0,
                key_version: KeyVersion(1)
            }]
        );
    }

    #[tokio::test]
    async fn test_unverifiable_signature_blocks_chain() {
        let signer = signer();
        let mut entries = chain(&signer, 1, false).await;
        entries[0].signature = EntrySignature {
            key_version: KeyVersion(42),
            value: entries[0].signature.value.clone(),
        };

        let report = verify_chain(&entries, &signer).await;
        assert!(!report.chain_valid);
        assert!(matches!(
            report.findings[0],
            Finding::SignatureUnverifiable { index: 0, key_version: KeyVersion(42), .. }
        ));
    }
}
