//! Audit Ledger
//!
//! Tamper-evident chain of signed audit entries: building and hashing
//! entries, the serialized append path, offline verification, Merkle
//! commitments and exportable bundles.

pub mod bundle;
pub mod chain;
pub mod entry;
pub mod merkle;
pub mod verify;

pub use bundle::{AuditBundle, BundleReport};
pub use chain::{Ledger, LedgerTimeouts, PartitionedLedger, RetryPolicy};
pub use entry::{AuditEntry, EntryBuilder, EntryDraft, EventKind, Outcome, SignedEntry, GENESIS_HASH};
pub use merkle::{inclusion_proof, merkle_root, MerkleProof};
pub use verify::{order_for_verification, verify_chain, verify_chain_from, Finding, VerificationReport};
