//! Local Key Management
//!
//! secp256k1 ECDSA keyring with versioned keys. Used as the in-process
//! signing collaborator in tests and single-node deployments; production key
//! custody goes through [`crate::crypto::RemoteSigner`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use secp256k1::{ecdsa::Signature, All, Message, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use super::signatures::{EntrySignature, KeyVersion, SigningError, SigningService};

/// On-disk keyring format
#[derive(Debug, Serialize, Deserialize)]
struct KeyringFile {
    active: KeyVersion,
    keys: Vec<StoredKey>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredKey {
    version: KeyVersion,
    secret_key: String,
}

struct KeyringState {
    active: KeyVersion,
    keys: BTreeMap<KeyVersion, SecretKey>,
}

/// Versioned secp256k1 signing keys held in process memory
pub struct LocalKeyring {
    secp: Secp256k1<All>,
    state: RwLock<KeyringState>,
    path: Option<PathBuf>,
    available: AtomicBool,
}

impl LocalKeyring {
    /// Fresh keyring with a single key at version 1
    pub fn generate() -> Self {
        Self::from_state(KeyringState::fresh(), None)
    }

    /// Load a keyring file, creating it with a fresh key if missing
    ///
    /// Rotations are written back to the same file.
    pub async fn load_or_create(path: impl AsRef<Path>) -> Result<Self, SigningError> {
        let path = path.as_ref().to_path_buf();
        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|e| SigningError::Unavailable(format!("failed to stat keyring {:?}: {}", path, e)))?;
        if !exists {
            let state = KeyringState::fresh();
            let file = state.to_file();
            let keyring = Self::from_state(state, Some(path));
            keyring.persist(&file).await?;
            info!(path = ?keyring.path, "created local keyring");
            return Ok(keyring);
        }

        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| SigningError::Unavailable(format!("failed to read keyring {:?}: {}", path, e)))?;
        let file: KeyringFile = serde_json::from_str(&raw)
            .map_err(|e| SigningError::Malformed(format!("failed to parse keyring {:?}: {}", path, e)))?;

        let mut keys = BTreeMap::new();
        for stored in file.keys {
            let bytes = hex::decode(&stored.secret_key)
                .map_err(|e| SigningError::Malformed(format!("key {} is not hex: {}", stored.version, e)))?;
            let secret = SecretKey::from_slice(&bytes)
                .map_err(|e| SigningError::Malformed(format!("key {} is invalid: {}", stored.version, e)))?;
            keys.insert(stored.version, secret);
        }
        if !keys.contains_key(&file.active) {
            return Err(SigningError::UnknownKeyVersion(file.active));
        }

        info!(path = ?path, key_count = keys.len(), active = %file.active, "loaded local keyring");
        Ok(Self::from_state(
            KeyringState {
                active: file.active,
                keys,
            },
            Some(path),
        ))
    }

    fn from_state(state: KeyringState, path: Option<PathBuf>) -> Self {
        Self {
            secp: Secp256k1::new(),
            state: RwLock::new(state),
            path,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the collaborator going away (or coming back)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), SigningError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SigningError::Unavailable("local keyring disabled".to_string()))
        }
    }

    async fn persist(&self, state: &KeyringFile) -> Result<(), SigningError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SigningError::Unavailable(format!("failed to create keyring directory: {}", e)))?;
        }
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| SigningError::Malformed(format!("failed to encode keyring: {}", e)))?;
        tokio::fs::write(path, json)
            .await
            .map_err(|e| SigningError::Unavailable(format!("failed to write keyring {:?}: {}", path, e)))
    }
}

impl KeyringState {
    fn fresh() -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(KeyVersion(1), new_secret_key());
        Self {
            active: KeyVersion(1),
            keys,
        }
    }

    /// Copy of this state with a new active key one version past the newest
    fn rotated(&self) -> Self {
        let next = self
            .keys
            .keys()
            .next_back()
            .map(|v| KeyVersion(v.0 + 1))
            .unwrap_or(KeyVersion(1));
        let mut keys = self.keys.clone();
        keys.insert(next, new_secret_key());
        Self { active: next, keys }
    }

    fn to_file(&self) -> KeyringFile {
        KeyringFile {
            active: self.active,
            keys: self
                .keys
                .iter()
                .map(|(version, secret)| StoredKey {
                    version: *version,
                    secret_key: hex::encode(secret.secret_bytes()),
                })
                .collect(),
        }
    }
}

#[async_trait]
impl SigningService for LocalKeyring {
    async fn sign(&self, digest: &[u8]) -> Result<EntrySignature, SigningError> {
        self.ensure_available()?;
        let message = digest_message(digest)?;

        let state = self.state.read().await;
        let secret = state
            .keys
            .get(&state.active)
            .ok_or(SigningError::UnknownKeyVersion(state.active))?;
        let signature = self.secp.sign_ecdsa(&message, secret);

        Ok(EntrySignature {
            key_version: state.active,
            value: signature.serialize_compact().to_vec(),
        })
    }

    async fn verify(
        &self,
        digest: &[u8],
        signature: &[u8],
        key_version: KeyVersion,
    ) -> Result<bool, SigningError> {
        self.ensure_available()?;
        let message = digest_message(digest)?;

        let state = self.state.read().await;
        let secret = state
            .keys
            .get(&key_version)
            .ok_or(SigningError::UnknownKeyVersion(key_version))?;
        let public_key = PublicKey::from_secret_key(&self.secp, secret);

        Ok(verify_compact(&self.secp, &message, signature, &public_key))
    }

    async fn rotate_key(&self) -> Result<KeyVersion, SigningError> {
        self.ensure_available()?;
        let mut state = self.state.write().await;

        // The new key only becomes active once it is on disk.
        let rotated = state.rotated();
        self.persist(&rotated.to_file()).await?;
        let next = rotated.active;
        *state = rotated;

        info!(path = ?self.path, active = %next, "rotated local signing key");
        Ok(next)
    }

    async fn public_key(&self, key_version: KeyVersion) -> Result<Vec<u8>, SigningError> {
        let state = self.state.read().await;
        let secret = state
            .keys
            .get(&key_version)
            .ok_or(SigningError::UnknownKeyVersion(key_version))?;
        Ok(PublicKey::from_secret_key(&self.secp, secret).serialize().to_vec())
    }
}

/// Verify-only signing service built from published public keys
///
/// Lets an external auditor check signatures without any secret material.
pub struct StaticKeys {
    secp: Secp256k1<All>,
    keys: BTreeMap<KeyVersion, PublicKey>,
}

impl StaticKeys {
    /// Build from hex-encoded compressed public keys
    pub fn from_hex(keys: &BTreeMap<KeyVersion, String>) -> Result<Self, SigningError> {
        let mut parsed = BTreeMap::new();
        for (version, encoded) in keys {
            let bytes = hex::decode(encoded)
                .map_err(|e| SigningError::Malformed(format!("public key {} is not hex: {}", version, e)))?;
            let key = PublicKey::from_slice(&bytes)
                .map_err(|e| SigningError::Malformed(format!("public key {} is invalid: {}", version, e)))?;
            parsed.insert(*version, key);
        }
        Ok(Self {
            secp: Secp256k1::new(),
            keys: parsed,
        })
    }
}

#[async_trait]
impl SigningService for StaticKeys {
    async fn sign(&self, _digest: &[u8]) -> Result<EntrySignature, SigningError> {
        Err(SigningError::Unsupported("sign"))
    }

    async fn verify(
        &self,
        digest: &[u8],
        signature: &[u8],
        key_version: KeyVersion,
    ) -> Result<bool, SigningError> {
        let message = digest_message(digest)?;
        let public_key = self
            .keys
            .get(&key_version)
            .ok_or(SigningError::UnknownKeyVersion(key_version))?;
        Ok(verify_compact(&self.secp, &message, signature, public_key))
    }

    async fn rotate_key(&self) -> Result<KeyVersion, SigningError> {
        Err(SigningError::Unsupported("rotate_key"))
    }

    async fn public_key(&self, key_version: KeyVersion) -> Result<Vec<u8>, SigningError> {
        self.keys
            .get(&key_version)
            .map(|key| key.serialize().to_vec())
            .ok_or(SigningError::UnknownKeyVersion(key_version))
    }
}

fn new_secret_key() -> SecretKey {
    SecretKey::new(&mut secp256k1::rand::thread_rng())
}

fn digest_message(digest: &[u8]) -> Result<Message, SigningError> {
    Message::from_digest_slice(digest)
        .map_err(|e| SigningError::Malformed(format!("invalid message digest: {}", e)))
}

/// Malformed signature bytes are an invalid signature, not an error.
fn verify_compact(
    secp: &Secp256k1<All>,
    message: &Message,
    signature: &[u8],
    public_key: &PublicKey,
) -> bool {
    match Signature::from_compact(signature) {
        Ok(signature) => secp.verify_ecdsa(message, &signature, public_key).is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const DIGEST: [u8; 32] = [7u8; 32];

    #[tokio::test]
    async fn test_unavailable_keyring_refuses_to_sign() {
        let keyring = LocalKeyring::generate();
        keyring.set_available(false);

        assert!(matches!(keyring.sign(&DIGEST).await, Err(SigningError::Unavailable(_))));

        keyring.set_available(true);
        assert!(keyring.sign(&DIGEST).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_key_version() {
        let keyring = LocalKeyring::generate();
        let signature = keyring.sign(&DIGEST).await.unwrap();

        let result = keyring.verify(&DIGEST, &signature.value, KeyVersion(9)).await;
        assert!(matches!(result, Err(SigningError::UnknownKeyVersion(KeyVersion(9)))));
    }

    #[tokio::test]
    async fn test_garbage_signature_is_invalid() {
        let keyring = LocalKeyring::generate();
        assert!(!keyring.verify(&DIGEST, b"short", KeyVersion(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_keyring_file_survives_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys").join("keyring.json");

        let keyring = LocalKeyring::load_or_create(&path).await.unwrap();
        let first = keyring.sign(&DIGEST).await.unwrap();
        keyring.rotate_key().await.unwrap();
        let second = keyring.sign(&DIGEST).await.unwrap();
        drop(keyring);

        let reloaded = LocalKeyring::load_or_create(&path).await.unwrap();
        assert!(reloaded.verify(&DIGEST, &first.value, KeyVersion(1)).await.unwrap());
        assert!(reloaded.verify(&DIGEST, &second.value, KeyVersion(2)).await.unwrap());
        assert_eq!(reloaded.sign(&DIGEST).await.unwrap().key_version, KeyVersion(2));
    }

    #[tokio::test]
    async fn test_failed_rotation_keeps_active_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keyring.json");

        let keyring = LocalKeyring::load_or_create(&path).await.unwrap();
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        let result = keyring.rotate_key().await;
        assert!(matches!(result, Err(SigningError::Unavailable(_))));
        assert_eq!(keyring.sign(&DIGEST).await.unwrap().key_version, KeyVersion(1));
        assert!(matches!(
            keyring.public_key(KeyVersion(2)).await,
            Err(SigningError::UnknownKeyVersion(KeyVersion(2)))
        ));
    }

    #[tokio::test]
    async fn test_static_keys_verify_only() {
        let keyring = LocalKeyring::generate();
        let signature = keyring.sign(&DIGEST).await.unwrap();

        let mut published = BTreeMap::new();
        published.insert(KeyVersion(1), hex::encode(keyring.public_key(KeyVersion(1)).await.unwrap()));
        let verifier = StaticKeys::from_hex(&published).unwrap();

        assert!(verifier.verify(&DIGEST, &signature.value, KeyVersion(1)).await.unwrap());
        assert!(matches!(verifier.sign(&DIGEST).await, Err(SigningError::Unsupported(_))));
    }
}
