//! Platform key vault contract.
//!
//! A vault is an external key-custody service (hardware enclave, OS keychain)
//! that holds keys under an alias and performs operations with them without
//! handing raw key bytes back to the application. Cellar depends only on the
//! operations below; how a vault protects its keys is its own business.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::cipher::CipherSuite;

/// Kind of key a vault is asked to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeySpec {
    /// 256-bit symmetric key used directly for record encryption.
    Symmetric256,
    /// Asymmetric pair used to wrap a software-generated symmetric key.
    WrappingKeyPair,
}

/// Opaque reference to a key held by a vault.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyHandle {
    alias: String,
    spec: KeySpec,
}

impl KeyHandle {
    pub fn new(alias: impl Into<String>, spec: KeySpec) -> Self {
        Self {
            alias: alias.into(),
            spec,
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn spec(&self) -> KeySpec {
        self.spec
    }
}

/// What a vault can do, probed once when a namespace opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultCapabilities {
    /// Can generate and use symmetric keys internally.
    pub symmetric_keys: bool,
    /// Can hold a key pair and wrap/unwrap with it.
    pub key_wrapping: bool,
    /// Internal symmetric operations support AEAD.
    pub aead: bool,
}

impl VaultCapabilities {
    pub const fn full() -> Self {
        Self {
            symmetric_keys: true,
            key_wrapping: true,
            aead: true,
        }
    }

    pub const fn none() -> Self {
        Self {
            symmetric_keys: false,
            key_wrapping: false,
            aead: false,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VaultError {
    /// The vault could not be reached or refused the operation.
    #[error("vault unavailable: {reason}")]
    Unavailable { reason: String },
    /// No key is stored under the alias.
    #[error("no vault key for alias {alias}")]
    KeyNotFound { alias: String },
    /// The alias exists but holds a different kind of key.
    #[error("vault key {alias} is not a {expected:?} key")]
    WrongKeyKind { alias: String, expected: KeySpec },
    /// A cryptographic operation inside the vault failed.
    #[error("vault crypto failure: {reason}")]
    Crypto { reason: String },
}

/// Operations Cellar needs from a platform key vault.
pub trait PlatformKeyVault: Send + Sync {
    /// Capability probe used to pick a key custody tier.
    fn capabilities(&self) -> VaultCapabilities;

    /// Create a new key under `alias`, replacing whatever was there.
    fn generate_key(&self, alias: &str, spec: KeySpec) -> Result<KeyHandle, VaultError>;

    /// Look up an existing key.
    fn get_key(&self, alias: &str) -> Result<Option<KeyHandle>, VaultError>;

    /// Wrap raw key bytes with the public half of a key pair.
    fn wrap(&self, public: &KeyHandle, raw_key: &[u8]) -> Result<Vec<u8>, VaultError>;

    /// Recover raw key bytes with the private half of a key pair.
    fn unwrap(&self, private: &KeyHandle, wrapped: &[u8])
        -> Result<Zeroizing<Vec<u8>>, VaultError>;

    /// Encrypt with a vault-held symmetric key.
    fn encrypt(
        &self,
        key: &KeyHandle,
        suite: CipherSuite,
        iv: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, VaultError>;

    /// Decrypt with a vault-held symmetric key.
    fn decrypt(
        &self,
        key: &KeyHandle,
        suite: CipherSuite,
        iv: &[u8],
        ciphertext: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, VaultError>;
}
