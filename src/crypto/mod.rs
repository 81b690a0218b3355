//! Signing
//!
//! Signature production and verification over entry hashes, with the
//! collaborator implementations the ledger can be wired to.

pub mod keyring;
pub mod remote;
pub mod signatures;

pub use keyring::{LocalKeyring, StaticKeys};
pub use remote::RemoteSigner;
pub use signatures::{
    EntrySignature, KeyVersion, SignatureCheck, SigningAdapter, SigningError, SigningService,
};
