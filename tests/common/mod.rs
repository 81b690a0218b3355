#![allow(dead_code)]

use std::sync::Arc;

use audit_ledger::audit::{EntryDraft, EventKind, Ledger, LedgerTimeouts, Outcome};
use audit_ledger::crypto::{LocalKeyring, SigningAdapter};
use audit_ledger::store::InMemoryLedgerStore;

pub struct TestLedger {
    pub ledger: Ledger,
    pub store: Arc<InMemoryLedgerStore>,
    pub keyring: Arc<LocalKeyring>,
}

/// Ledger over an in-memory store with a fresh local keyring
pub fn setup_test_ledger() -> TestLedger {
    setup_test_ledger_with(LedgerTimeouts::default())
}

pub fn setup_test_ledger_with(timeouts: LedgerTimeouts) -> TestLedger {
    let store = Arc::new(InMemoryLedgerStore::new());
    let keyring = Arc::new(LocalKeyring::generate());
    let ledger = Ledger::new("test-chain", store.clone(), SigningAdapter::new(keyring.clone()), timeouts);
    TestLedger { ledger, store, keyring }
}

/// A successful data access by `actor` in the EU
pub fn data_access(actor: &str) -> EntryDraft {
    EntryDraft::new(EventKind::DataAccess, actor, "patients/1234", "read", "EU", Outcome::Success)
}
