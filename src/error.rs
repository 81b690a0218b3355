use thiserror::Error;

use crate::crypto::SigningError;
use crate::replication::SyncError;
use crate::store::StoreError;

impl From<SigningError> for LedgerError {
    fn from(err: SigningError) -> Self {
        match err {
            SigningError::Unavailable(reason) => Self::SigningUnavailable(reason),
            other => Self::Signing(other),
        }
    }
}

impl From<config::ConfigError> for LedgerError {
    fn from(err: config::ConfigError) -> Self {
        Self::ConfigError(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Signing unavailable: {0}")]
    SigningUnavailable(String),

    #[error("Signing error: {0}")]
    Signing(SigningError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Replication sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Outcome of {operation} is unknown (timed out); retry with a fresh chain pointer")]
    Indeterminate { operation: &'static str },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

impl LedgerError {
    pub fn invalid_field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }

    /// Whether a caller may retry the failed operation with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::SigningUnavailable(_)
                | Self::Store(StoreError::Unavailable(_) | StoreError::Database(_))
                | Self::Sync(_)
                | Self::Indeterminate { .. }
        )
    }
}
