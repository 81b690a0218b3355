//! Signing Adapter
//!
//! Produces and checks non-repudiable signatures over entry hashes by
//! delegating to an external signing collaborator.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Version of the signing key that produced a signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyVersion(pub u32);

impl fmt::Display for KeyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Signature bytes plus the key version that produced them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySignature {
    pub key_version: KeyVersion,
    #[serde(with = "hex::serde")]
    pub value: Vec<u8>,
}

#[derive(Error, Debug)]
pub enum SigningError {
    #[error("signing service unavailable: {0}")]
    Unavailable(String),

    #[error("unknown key version {0}")]
    UnknownKeyVersion(KeyVersion),

    #[error("malformed signing input: {0}")]
    Malformed(String),

    #[error("operation not supported by this signer: {0}")]
    Unsupported(&'static str),
}

/// External signing collaborator (KMS/HSM boundary)
#[async_trait]
pub trait SigningService: Send + Sync {
    /// Sign `digest` with the currently active key
    async fn sign(&self, digest: &[u8]) -> Result<EntrySignature, SigningError>;

    /// Check `signature` over `digest` using the key `key_version`
    async fn verify(
        &self,
        digest: &[u8],
        signature: &[u8],
        key_version: KeyVersion,
    ) -> Result<bool, SigningError>;

    /// Activate a new key and return its version
    async fn rotate_key(&self) -> Result<KeyVersion, SigningError>;

    /// Public key for `key_version`, serialized for offline verification
    async fn public_key(&self, key_version: KeyVersion) -> Result<Vec<u8>, SigningError>;
}

/// Outcome of a signature check that could be attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureCheck {
    Valid,
    Invalid,
}

impl SignatureCheck {
    pub fn is_valid(&self) -> bool {
        matches!(self, SignatureCheck::Valid)
    }
}

/// Adapter between entry hashes and the signing collaborator
#[derive(Clone)]
pub struct SigningAdapter {
    service: Arc<dyn SigningService>,
}

impl SigningAdapter {
    pub fn new(service: Arc<dyn SigningService>) -> Self {
        Self { service }
    }

    /// Sign an entry hash (64 hex chars)
    pub async fn sign(&self, entry_hash: &str) -> Result<EntrySignature, SigningError> {
        let digest = decode_digest(entry_hash)?;
        let signature = self.service.sign(&digest).await?;
        debug!(
            entry_hash = %entry_hash,
            key_version = %signature.key_version,
            "signed entry hash"
        );
        Ok(signature)
    }

    /// Verify using the key version recorded in the signature
    ///
    /// `Err` means the check could not be attempted; it never stands in for
    /// an invalid signature.
    pub async fn verify(
        &self,
        entry_hash: &str,
        signature: &EntrySignature,
    ) -> Result<SignatureCheck, SigningError> {
        let digest = match decode_digest(entry_hash) {
            Ok(digest) => digest,
            // A hash that is not a digest cannot carry a valid signature.
            Err(SigningError::Malformed(_)) => return Ok(SignatureCheck::Invalid),
            Err(other) => return Err(other),
        };

        let valid = self
            .service
            .verify(&digest, &signature.value, signature.key_version)
            .await?;

        Ok(if valid {
            SignatureCheck::Valid
        } else {
            SignatureCheck::Invalid
        })
    }

    pub async fn rotate(&self) -> Result<KeyVersion, SigningError> {
        let version = self.service.rotate_key().await?;
        info!(key_version = %version, "signing key rotated");
        Ok(version)
    }

    pub async fn public_key(&self, key_version: KeyVersion) -> Result<Vec<u8>, SigningError> {
        self.service.public_key(key_version).await
    }
}

fn decode_digest(entry_hash: &str) -> Result<Vec<u8>, SigningError> {
    let digest = hex::decode(entry_hash)
        .map_err(|e| SigningError::Malformed(format!("entry hash is not hex: {}", e)))?;
    if digest.len() != 32 {
        return Err(SigningError::Malformed(format!(
            "entry hash must be 32 bytes, got {}",
            digest.len()
        )));
    }
    Ok(digest)
}
