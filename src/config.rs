//! Configuration for the audit ledger
//!
//! Layered as built-in defaults, an optional TOML file, then `LEDGER_*`
//! environment variables (nested keys joined with `__`, e.g.
//! `LEDGER_SIGNING__MODE=remote`).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audit::{LedgerTimeouts, RetryPolicy};
use crate::error::{LedgerError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_chain_id")]
    pub chain_id: String,

    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Jurisdictions that each get their own chain; empty means one chain
    #[serde(default)]
    pub partitions: Vec<String>,

    #[serde(default)]
    pub signing: SigningConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub replication: ReplicationConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            chain_id: default_chain_id(),
            database_url: default_database_url(),
            partitions: Vec::new(),
            signing: SigningConfig::default(),
            store: StoreConfig::default(),
            replication: ReplicationConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SigningMode {
    /// Keys held in a local keyring file
    Local,
    /// Delegate to a KMS/HSM over HTTP
    Remote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigningConfig {
    #[serde(default = "default_signing_mode")]
    pub mode: SigningMode,

    #[serde(default = "default_keyring_path")]
    pub keyring_path: String,

    /// Base URL of the remote signer
    #[serde(default)]
    pub url: String,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            mode: default_signing_mode(),
            keyring_path: default_keyring_path(),
            url: String::new(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Base URL of the replication metadata service
    #[serde(default)]
    pub url: String,

    /// Regions every entry must reach
    #[serde(default)]
    pub regions: Vec<String>,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            regions: Vec::new(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_chain_id() -> String {
    "default".to_string()
}

fn default_database_url() -> String {
    "sqlite://audit-ledger.db".to_string()
}

fn default_signing_mode() -> SigningMode {
    SigningMode::Local
}

fn default_keyring_path() -> String {
    "audit-ledger-keys.json".to_string()
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    2000
}

impl LedgerConfig {
    /// Load and validate configuration
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&LedgerConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix("LEDGER")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("partitions")
                .with_list_parse_key("replication.regions")
                .try_parsing(true),
        );

        let config: LedgerConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chain_id.trim().is_empty() {
            return Err(LedgerError::ConfigError("chain_id must not be empty".to_string()));
        }
        if self.signing.timeout_ms == 0 || self.store.timeout_ms == 0 || self.replication.timeout_ms == 0 {
            return Err(LedgerError::ConfigError("timeouts must be greater than zero".to_string()));
        }
        if self.signing.mode == SigningMode::Remote && self.signing.url.is_empty() {
            return Err(LedgerError::ConfigError(
                "signing.url is required when signing.mode is remote".to_string(),
            ));
        }
        if self.replication.enabled {
            if self.replication.url.is_empty() {
                return Err(LedgerError::ConfigError(
                    "replication.url is required when replication is enabled".to_string(),
                ));
            }
            if self.replication.regions.is_empty() {
                return Err(LedgerError::ConfigError(
                    "replication.regions must list at least one region".to_string(),
                ));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(LedgerError::ConfigError("retry.max_attempts must be at least 1".to_string()));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(LedgerError::ConfigError(
                "retry.initial_backoff_ms exceeds retry.max_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeouts(&self) -> LedgerTimeouts {
        LedgerTimeouts {
            sign: Duration::from_millis(self.signing.timeout_ms),
            store: Duration::from_millis(self.store.timeout_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
        }
    }

    pub fn replication_timeout(&self) -> Duration {
        Duration::from_millis(self.replication.timeout_ms)
    }
}
