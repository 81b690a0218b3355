pub mod audit;
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod replication;
pub mod store;

pub use audit::{EntryDraft, EventKind, Ledger, Outcome, SignedEntry, VerificationReport};
pub use config::LedgerConfig;
pub use error::{LedgerError, Result};
