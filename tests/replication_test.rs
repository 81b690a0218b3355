//! Ledger wired to replication metadata and a remote signer

mod common;

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use audit_ledger::audit::{Ledger, LedgerTimeouts};
use audit_ledger::crypto::{RemoteSigner, SigningAdapter};
use audit_ledger::replication::{ConsistencyStatus, InMemoryReplicationMetadata, ReplicationVerifier};
use audit_ledger::store::InMemoryLedgerStore;
use audit_ledger::LedgerError;
use common::{data_access, setup_test_ledger};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const REGIONS: [&str; 2] = ["eu-central", "eu-west"];

fn replicated(metadata: Arc<InMemoryReplicationMetadata>) -> (Ledger, ReplicationVerifier) {
    let verifier = ReplicationVerifier::new(metadata, REGIONS, Duration::from_millis(200));
    let ledger = setup_test_ledger().ledger.with_replication(verifier.clone());
    (ledger, verifier)
}

/// Formatted tracing output collected in memory
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn capture_logs() -> (CapturedLogs, tracing::subscriber::DefaultGuard) {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    (logs, tracing::subscriber::set_default(subscriber))
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_committed_entry_reaches_every_region() {
    let metadata = Arc::new(InMemoryReplicationMetadata::new());
    let (ledger, verifier) = replicated(metadata);

    let entry = ledger.append(data_access("alice")).await.unwrap();
    settle().await;

    let record = verifier.check_consistency(entry.entry_hash()).await.unwrap();
    assert!(record.status.is_consistent(), "{:?}", record.status);
}

#[tokio::test]
async fn test_lagging_region_is_partial() {
    let metadata = Arc::new(InMemoryReplicationMetadata::new());
    metadata.set_region_lagging("eu-west", true);
    let (ledger, verifier) = replicated(metadata);

    let entry = ledger.append(data_access("alice")).await.unwrap();
    settle().await;

    let record = verifier.check_consistency(entry.entry_hash()).await.unwrap();
    match record.status {
        ConsistencyStatus::Partial { present, missing } => {
            assert!(present.contains("eu-central"));
            assert!(missing.contains("eu-west"));
        }
        other => panic!("expected partial replication, got {:?}", other),
    }
}

#[tokio::test]
async fn test_partial_sync_warns_on_monitoring_target() {
    let metadata = Arc::new(InMemoryReplicationMetadata::new());
    metadata.set_region_lagging("eu-west", true);
    let verifier = ReplicationVerifier::new(metadata, REGIONS, Duration::from_millis(200));
    let entry = setup_test_ledger().ledger.append(data_access("alice")).await.unwrap();

    let (logs, _guard) = capture_logs();
    let record = verifier.sync_required(&entry).await.unwrap();
    assert!(matches!(record.status, ConsistencyStatus::Partial { .. }));

    let output = logs.contents();
    let line = output
        .lines()
        .find(|line| line.contains("degraded replication"))
        .unwrap_or_else(|| panic!("no degraded replication event in {:?}", output));
    assert!(line.contains("WARN"), "{}", line);
    assert!(line.contains("audit_ledger::monitoring"), "{}", line);
    assert!(line.contains(entry.entry_hash()), "{}", line);
}

#[tokio::test]
async fn test_consistent_sync_does_not_warn() {
    let metadata = Arc::new(InMemoryReplicationMetadata::new());
    let verifier = ReplicationVerifier::new(metadata, REGIONS, Duration::from_millis(200));
    let entry = setup_test_ledger().ledger.append(data_access("alice")).await.unwrap();

    let (logs, _guard) = capture_logs();
    let record = verifier.sync_required(&entry).await.unwrap();
    assert!(record.status.is_consistent());
    assert!(!logs.contents().contains("WARN"), "{}", logs.contents());
}

#[tokio::test]
async fn test_replication_outage_does_not_block_commit() {
    let metadata = Arc::new(InMemoryReplicationMetadata::new());
    metadata.set_unavailable(true);
    let (ledger, verifier) = replicated(metadata.clone());

    let first = ledger.append(data_access("alice")).await.unwrap();
    let second = ledger.append(data_access("bob")).await.unwrap();
    assert_eq!(second.previous_hash(), first.entry_hash());

    metadata.set_unavailable(false);
    settle().await;
    let record = verifier.check_consistency(first.entry_hash()).await.unwrap();
    assert_eq!(record.status, ConsistencyStatus::NotFound);
}

#[tokio::test]
async fn test_ledger_with_remote_signer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sign"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "key_version": 3, "signature": "ab".repeat(64) })),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/verify"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "valid": true })))
        .mount(&server)
        .await;

    let signer = SigningAdapter::new(Arc::new(RemoteSigner::new(server.uri(), Duration::from_secs(2)).unwrap()));
    let ledger = Ledger::new("remote", Arc::new(InMemoryLedgerStore::new()), signer, LedgerTimeouts::default());

    let entry = ledger.append(data_access("alice")).await.unwrap();
    assert_eq!(entry.signature().key_version.0, 3);
    assert!(ledger.verify_stored(None).await.unwrap().chain_valid);
}

#[tokio::test]
async fn test_remote_signer_outage_is_signing_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sign"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryLedgerStore::new());
    let signer = SigningAdapter::new(Arc::new(RemoteSigner::new(server.uri(), Duration::from_secs(2)).unwrap()));
    let ledger = Ledger::new("remote", store.clone(), signer, LedgerTimeouts::default());

    let err = ledger.append(data_access("alice")).await.unwrap_err();
    assert!(matches!(err, LedgerError::SigningUnavailable(_)));
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_slow_remote_signer_is_indeterminate() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sign"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_millis(500))
                .set_body_json(json!({ "key_version": 1, "signature": "ab".repeat(64) })),
        )
        .mount(&server)
        .await;

    let signer = SigningAdapter::new(Arc::new(RemoteSigner::new(server.uri(), Duration::from_secs(5)).unwrap()));
    let timeouts = LedgerTimeouts {
        sign: Duration::from_millis(50),
        store: Duration::from_secs(1),
    };
    let ledger = Ledger::new("remote", Arc::new(InMemoryLedgerStore::new()), signer, timeouts);

    let err = ledger.append(data_access("alice")).await.unwrap_err();
    assert!(matches!(err, LedgerError::Indeterminate { operation: "signing" }));
}
