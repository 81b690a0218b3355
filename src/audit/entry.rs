//! Audit Ledger Entry
//!
//! Defines the immutable audit record, its closed vocabularies, and the
//! canonical encoding its content hash is computed over.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::crypto::EntrySignature;
use crate::error::{LedgerError, Result};

/// `previous_hash` of the first entry in every chain: 64 hex zeros.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Kind of sovereignty/compliance decision being recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SovereigntyCheck,
    DataAccess,
    DataTransfer,
    HighRiskInference,
    ConsentValidation,
    KeyRotation,
    BreachNotification,
    RetentionEnforcement,
    SystemConfiguration,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::SovereigntyCheck,
        EventKind::DataAccess,
        EventKind::DataTransfer,
        EventKind::HighRiskInference,
        EventKind::ConsentValidation,
        EventKind::KeyRotation,
        EventKind::BreachNotification,
        EventKind::RetentionEnforcement,
        EventKind::SystemConfiguration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SovereigntyCheck => "sovereignty_check",
            EventKind::DataAccess => "data_access",
            EventKind::DataTransfer => "data_transfer",
            EventKind::HighRiskInference => "high_risk_inference",
            EventKind::ConsentValidation => "consent_validation",
            EventKind::KeyRotation => "key_rotation",
            EventKind::BreachNotification => "breach_notification",
            EventKind::RetentionEnforcement => "retention_enforcement",
            EventKind::SystemConfiguration => "system_configuration",
        }
    }

    fn variant_name(&self) -> &'static str {
        match self {
            EventKind::SovereigntyCheck => "SovereigntyCheck",
            EventKind::DataAccess => "DataAccess",
            EventKind::DataTransfer => "DataTransfer",
            EventKind::HighRiskInference => "HighRiskInference",
            EventKind::ConsentValidation => "ConsentValidation",
            EventKind::KeyRotation => "KeyRotation",
            EventKind::BreachNotification => "BreachNotification",
            EventKind::RetentionEnforcement => "RetentionEnforcement",
            EventKind::SystemConfiguration => "SystemConfiguration",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = LedgerError;

    /// Accepts the snake_case wire name or the variant name.
    fn from_str(s: &str) -> Result<Self> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s || kind.variant_name() == s)
            .ok_or_else(|| LedgerError::invalid_field("event_kind", format!("unknown event kind: {}", s)))
    }
}

/// Result of the decision, as reported by the policy engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Violation,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Violation => "violation",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" | "Success" => Ok(Outcome::Success),
            "failure" | "Failure" => Ok(Outcome::Failure),
            "violation" | "Violation" => Ok(Outcome::Violation),
            _ => Err(LedgerError::invalid_field("outcome", format!("unknown outcome: {}", s))),
        }
    }
}

/// Caller-supplied fields for a new entry, as received from the policy engine.
///
/// `event_kind` and `outcome` stay as raw strings until the builder checks
/// them against the closed vocabularies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryDraft {
    pub event_kind: String,
    pub actor: String,
    pub resource: String,
    pub action: String,
    pub jurisdiction: String,
    pub outcome: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl EntryDraft {
    pub fn new(
        event_kind: EventKind,
        actor: impl Into<String>,
        resource: impl Into<String>,
        action: impl Into<String>,
        jurisdiction: impl Into<String>,
        outcome: Outcome,
    ) -> Self {
        Self {
            event_kind: event_kind.as_str().to_string(),
            actor: actor.into(),
            resource: resource.into(),
            action: action.into(),
            jurisdiction: jurisdiction.into(),
            outcome: outcome.as_str().to_string(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Immutable audit record whose `entry_hash` commits to every other field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub(crate) timestamp: DateTime<Utc>,
    pub(crate) event_kind: EventKind,
    pub(crate) actor: String,
    pub(crate) resource: String,
    pub(crate) action: String,
    pub(crate) jurisdiction: String,
    pub(crate) outcome: Outcome,
    pub(crate) metadata: BTreeMap<String, Value>,
    pub(crate) previous_hash: String,
    pub(crate) entry_hash: String,
}

impl AuditEntry {
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn event_kind(&self) -> EventKind {
        self.event_kind
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn jurisdiction(&self) -> &str {
        &self.jurisdiction
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    pub fn previous_hash(&self) -> &str {
        &self.previous_hash
    }

    pub fn entry_hash(&self) -> &str {
        &self.entry_hash
    }

    /// Canonical encoding of every field except `entry_hash`
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut fields = Map::new();
        fields.insert("action".into(), Value::String(self.action.clone()));
        fields.insert("actor".into(), Value::String(self.actor.clone()));
        fields.insert("event_kind".into(), Value::String(self.event_kind.as_str().into()));
        fields.insert("jurisdiction".into(), Value::String(self.jurisdiction.clone()));
        fields.insert(
            "metadata".into(),
            Value::Object(self.metadata.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        );
        fields.insert("outcome".into(), Value::String(self.outcome.as_str().into()));
        fields.insert("previous_hash".into(), Value::String(self.previous_hash.clone()));
        fields.insert("resource".into(), Value::String(self.resource.clone()));
        fields.insert("timestamp".into(), Value::String(canonical_timestamp(&self.timestamp)));

        canonical_json(&Value::Object(fields)).into_bytes()
    }

    /// Recompute the content hash from the current field values
    pub fn calculate_hash(&self) -> String {
        sha256_hex(&self.canonical_bytes())
    }

    /// Whether the stored `entry_hash` still matches the fields
    pub fn verify_hash(&self) -> bool {
        self.entry_hash == self.calculate_hash()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} by {} on {} [{}] -> {}",
            self.event_kind, self.actor, self.resource, self.jurisdiction, self.outcome
        )
    }
}

/// An entry together with the signature over its `entry_hash`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedEntry {
    #[serde(flatten)]
    pub(crate) entry: AuditEntry,
    pub(crate) signature: EntrySignature,
}

impl SignedEntry {
    pub fn new(entry: AuditEntry, signature: EntrySignature) -> Self {
        Self { entry, signature }
    }

    pub fn entry(&self) -> &AuditEntry {
        &self.entry
    }

    pub fn signature(&self) -> &EntrySignature {
        &self.signature
    }

    pub fn entry_hash(&self) -> &str {
        &self.entry.entry_hash
    }

    pub fn previous_hash(&self) -> &str {
        &self.entry.previous_hash
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.entry.timestamp
    }
}

/// Constructs audit entries; pure, no side effects
pub struct EntryBuilder;

impl EntryBuilder {
    /// Build an entry stamped with the current time
    pub fn build(draft: EntryDraft, previous_hash: &str) -> Result<AuditEntry> {
        Self::build_at(draft, previous_hash, Utc::now())
    }

    /// Build an entry with an explicit timestamp
    ///
    /// The timestamp is truncated to microseconds so it survives every store
    /// encoding unchanged.
    pub fn build_at(
        draft: EntryDraft,
        previous_hash: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<AuditEntry> {
        let event_kind: EventKind = draft.event_kind.parse()?;
        let outcome: Outcome = draft.outcome.parse()?;

        if !is_digest_hex(previous_hash) {
            return Err(LedgerError::invalid_field(
                "previous_hash",
                "expected 64 lowercase hex characters",
            ));
        }

        let mut entry = AuditEntry {
            timestamp: timestamp.trunc_subsecs(6),
            event_kind,
            actor: draft.actor,
            resource: draft.resource,
            action: draft.action,
            jurisdiction: draft.jurisdiction,
            outcome,
            metadata: draft.metadata,
            previous_hash: previous_hash.to_string(),
            entry_hash: String::new(),
        };
        entry.entry_hash = entry.calculate_hash();
        Ok(entry)
    }
}

/// RFC 3339, UTC, nine fractional digits, `Z` suffix
pub fn canonical_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Compact JSON with object keys sorted at every depth
pub fn canonical_json(value: &Value) -> String {
    sorted(value).to_string()
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let ordered: BTreeMap<&String, &Value> = map.iter().collect();
            let mut out = Map::new();
            for (key, inner) in ordered {
                out.insert(key.clone(), sorted(inner));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

/// Lowercase hex SHA-256 of `bytes`
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub(crate) fn is_digest_hex(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
