//! Platform key vault implementations.
//!
//! [`KeyringVault`] keeps key material in the OS keyring through the `keyring`
//! crate and performs every operation with it internally. [`InMemoryVault`] is
//! the same thing without the keyring, for tests and ephemeral sessions.
//!
//! Wrapping is an X25519 sealed box: an ephemeral key agrees a secret with the
//! vault pair, HKDF-SHA256 stretches it into an AES-256-GCM key, and the output
//! is `ephemeral_public (32) || iv (12) || ciphertext + tag`.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use base64::{engine::general_purpose, Engine as _};
use cellar_core::{
    cipher::CipherSuite,
    vault::{KeyHandle, KeySpec, PlatformKeyVault, VaultCapabilities, VaultError},
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use tracing::debug;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::cipher::{self, KEY_LEN};

const WRAP_INFO: &[u8] = b"cellar-key-wrap-v1";
const PUBLIC_LEN: usize = 32;

/// Key material as a vault holds it.
enum VaultSecret {
    Symmetric(Zeroizing<[u8; KEY_LEN]>),
    KeyPair(StaticSecret),
}

impl VaultSecret {
    fn generate(spec: KeySpec) -> Self {
        match spec {
            KeySpec::Symmetric256 => VaultSecret::Symmetric(cipher::generate_key()),
            KeySpec::WrappingKeyPair => VaultSecret::KeyPair(StaticSecret::random_from_rng(OsRng)),
        }
    }

    fn spec(&self) -> KeySpec {
        match self {
            VaultSecret::Symmetric(_) => KeySpec::Symmetric256,
            VaultSecret::KeyPair(_) => KeySpec::WrappingKeyPair,
        }
    }

    fn symmetric(&self, alias: &str) -> Result<&[u8; KEY_LEN], VaultError> {
        match self {
            VaultSecret::Symmetric(bytes) => Ok(&**bytes),
            VaultSecret::KeyPair(_) => Err(VaultError::WrongKeyKind {
                alias: alias.to_string(),
                expected: KeySpec::Symmetric256,
            }),
        }
    }

    fn key_pair(&self, alias: &str) -> Result<&StaticSecret, VaultError> {
        match self {
            VaultSecret::KeyPair(secret) => Ok(secret),
            VaultSecret::Symmetric(_) => Err(VaultError::WrongKeyKind {
                alias: alias.to_string(),
                expected: KeySpec::WrappingKeyPair,
            }),
        }
    }

    /// `sym:<base64>` or `x25519:<base64>`.
    fn encode(&self) -> Zeroizing<String> {
        Zeroizing::new(match self {
            VaultSecret::Symmetric(bytes) => {
                format!("sym:{}", general_purpose::STANDARD.encode(&bytes[..]))
            }
            VaultSecret::KeyPair(secret) => {
                format!("x25519:{}", general_purpose::STANDARD.encode(secret.to_bytes()))
            }
        })
    }

    fn decode(encoded: &str) -> Result<Self, VaultError> {
        let corrupt = |reason: String| VaultError::Crypto {
            reason: format!("stored vault key is corrupt: {reason}"),
        };
        let (kind, body) = encoded
            .split_once(':')
            .ok_or_else(|| corrupt("missing kind prefix".to_string()))?;
        let bytes = Zeroizing::new(
            general_purpose::STANDARD
                .decode(body)
                .map_err(|e| corrupt(e.to_string()))?,
        );
        let array: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| corrupt(format!("expected 32 bytes, got {}", bytes.len())))?;
        match kind {
            "sym" => Ok(VaultSecret::Symmetric(Zeroizing::new(array))),
            "x25519" => Ok(VaultSecret::KeyPair(StaticSecret::from(array))),
            other => Err(corrupt(format!("unknown kind {other}"))),
        }
    }

    fn wrap(&self, alias: &str, raw_key: &[u8]) -> Result<Vec<u8>, VaultError> {
        let recipient = PublicKey::from(self.key_pair(alias)?);
        seal_to(&recipient, raw_key)
    }

    fn unwrap(&self, alias: &str, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        open_with(self.key_pair(alias)?, wrapped)
    }

    fn encrypt(
        &self,
        alias: &str,
        suite: CipherSuite,
        iv: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, VaultError> {
        cipher::seal(suite, &self.symmetric(alias)?[..], iv, plaintext).map_err(crypto_err)
    }

    fn decrypt(
        &self,
        alias: &str,
        suite: CipherSuite,
        iv: &[u8],
        ciphertext: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        cipher::open(suite, &self.symmetric(alias)?[..], iv, ciphertext).map_err(crypto_err)
    }
}

/// Vault backed by the OS keyring (Keychain, Credential Manager, Secret Service).
///
/// One keyring entry per alias under `service`. Key bytes are loaded for each
/// operation and dropped (zeroized) right after; they are never returned.
#[derive(Debug, Clone)]
pub struct KeyringVault {
    service: String,
}

impl KeyringVault {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, alias: &str) -> Result<keyring::Entry, VaultError> {
        keyring::Entry::new(&self.service, alias).map_err(keyring_err)
    }

    fn load(&self, alias: &str) -> Result<Option<VaultSecret>, VaultError> {
        match self.entry(alias)?.get_password() {
            Ok(encoded) => VaultSecret::decode(&Zeroizing::new(encoded)).map(Some),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(keyring_err(err)),
        }
    }

    fn require(&self, handle: &KeyHandle) -> Result<VaultSecret, VaultError> {
        self.load(handle.alias())?
            .ok_or_else(|| VaultError::KeyNotFound {
                alias: handle.alias().to_string(),
            })
    }
}

impl PlatformKeyVault for KeyringVault {
    fn capabilities(&self) -> VaultCapabilities {
        VaultCapabilities::full()
    }

    fn generate_key(&self, alias: &str, spec: KeySpec) -> Result<KeyHandle, VaultError> {
        let secret = VaultSecret::generate(spec);
        self.entry(alias)?
            .set_password(&secret.encode())
            .map_err(keyring_err)?;
        debug!(service = %self.service, alias, ?spec, "generated keyring key");
        Ok(KeyHandle::new(alias, spec))
    }

    fn get_key(&self, alias: &str) -> Result<Option<KeyHandle>, VaultError> {
        Ok(self
            .load(alias)?
            .map(|secret| KeyHandle::new(alias, secret.spec())))
    }

    fn wrap(&self, public: &KeyHandle, raw_key: &[u8]) -> Result<Vec<u8>, VaultError> {
        self.require(public)?.wrap(public.alias(), raw_key)
    }

    fn unwrap(
        &self,
        private: &KeyHandle,
        wrapped: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        self.require(private)?.unwrap(private.alias(), wrapped)
    }

    fn encrypt(
        &self,
        key: &KeyHandle,
        suite: CipherSuite,
        iv: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, VaultError> {
        self.require(key)?.encrypt(key.alias(), suite, iv, plaintext)
    }

    fn decrypt(
        &self,
        key: &KeyHandle,
        suite: CipherSuite,
        iv: &[u8],
        ciphertext: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        self.require(key)?.decrypt(key.alias(), suite, iv, ciphertext)
    }
}

/// In-memory vault for tests and ephemeral sessions. Clones share keys.
#[derive(Clone)]
pub struct InMemoryVault {
    capabilities: VaultCapabilities,
    keys: Arc<Mutex<HashMap<String, VaultSecret>>>,
}

impl Default for InMemoryVault {
    fn default() -> Self {
        Self::with_capabilities(VaultCapabilities::full())
    }
}

impl InMemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Vault that advertises (and enforces) a reduced capability set.
    pub fn with_capabilities(capabilities: VaultCapabilities) -> Self {
        Self {
            capabilities,
            keys: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Drop a key, as when a device is restored without its keystore.
    pub fn forget(&self, alias: &str) {
        if let Ok(mut keys) = self.keys.lock() {
            keys.remove(alias);
        }
    }

    fn with_secret<R>(
        &self,
        handle: &KeyHandle,
        f: impl FnOnce(&VaultSecret) -> Result<R, VaultError>,
    ) -> Result<R, VaultError> {
        let keys = self.keys.lock().map_err(|err| VaultError::Unavailable {
            reason: format!("lock poisoned: {err}"),
        })?;
        let secret = keys
            .get(handle.alias())
            .ok_or_else(|| VaultError::KeyNotFound {
                alias: handle.alias().to_string(),
            })?;
        f(secret)
    }

    fn require(&self, supported: bool, operation: &str) -> Result<(), VaultError> {
        if supported {
            Ok(())
        } else {
            Err(VaultError::Unavailable {
                reason: format!("{operation} is not supported by this vault"),
            })
        }
    }
}

impl PlatformKeyVault for InMemoryVault {
    fn capabilities(&self) -> VaultCapabilities {
        self.capabilities
    }

    fn generate_key(&self, alias: &str, spec: KeySpec) -> Result<KeyHandle, VaultError> {
        match spec {
            KeySpec::Symmetric256 => self.require(self.capabilities.symmetric_keys, "symmetric keys")?,
            KeySpec::WrappingKeyPair => self.require(self.capabilities.key_wrapping, "key wrapping")?,
        }
        let mut keys = self.keys.lock().map_err(|err| VaultError::Unavailable {
            reason: format!("lock poisoned: {err}"),
        })?;
        keys.insert(alias.to_string(), VaultSecret::generate(spec));
        Ok(KeyHandle::new(alias, spec))
    }

    fn get_key(&self, alias: &str) -> Result<Option<KeyHandle>, VaultError> {
        let keys = self.keys.lock().map_err(|err| VaultError::Unavailable {
            reason: format!("lock poisoned: {err}"),
        })?;
        Ok(keys
            .get(alias)
            .map(|secret| KeyHandle::new(alias, secret.spec())))
    }

    fn wrap(&self, public: &KeyHandle, raw_key: &[u8]) -> Result<Vec<u8>, VaultError> {
        self.with_secret(public, |secret| secret.wrap(public.alias(), raw_key))
    }

    fn unwrap(
        &self,
        private: &KeyHandle,
        wrapped: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        self.with_secret(private, |secret| secret.unwrap(private.alias(), wrapped))
    }

    fn encrypt(
        &self,
        key: &KeyHandle,
        suite: CipherSuite,
        iv: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, VaultError> {
        if suite.is_authenticated() {
            self.require(self.capabilities.aead, "aead")?;
        }
        self.with_secret(key, |secret| secret.encrypt(key.alias(), suite, iv, plaintext))
    }

    fn decrypt(
        &self,
        key: &KeyHandle,
        suite: CipherSuite,
        iv: &[u8],
        ciphertext: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        if suite.is_authenticated() {
            self.require(self.capabilities.aead, "aead")?;
        }
        self.with_secret(key, |secret| secret.decrypt(key.alias(), suite, iv, ciphertext))
    }
}

fn seal_to(recipient: &PublicKey, raw_key: &[u8]) -> Result<Vec<u8>, VaultError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);
    let kek = derive_kek(shared.as_bytes(), &ephemeral_public, recipient)?;

    let iv = cipher::generate_iv(CipherSuite::Aes256Gcm);
    let sealed = cipher::seal(CipherSuite::Aes256Gcm, &kek[..], &iv, raw_key).map_err(crypto_err)?;

    let mut out = Vec::with_capacity(PUBLIC_LEN + iv.len() + sealed.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn open_with(secret: &StaticSecret, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>, VaultError> {
    let iv_len = CipherSuite::Aes256Gcm.iv_len();
    if wrapped.len() < PUBLIC_LEN + iv_len {
        return Err(VaultError::Crypto {
            reason: "wrapped key is truncated".to_string(),
        });
    }
    let (public_bytes, rest) = wrapped.split_at(PUBLIC_LEN);
    let (iv, sealed) = rest.split_at(iv_len);
    let ephemeral_public: [u8; PUBLIC_LEN] = public_bytes.try_into().map_err(|_| VaultError::Crypto {
        reason: "bad ephemeral key".to_string(),
    })?;
    let ephemeral_public = PublicKey::from(ephemeral_public);
    let recipient = PublicKey::from(secret);

    let shared = secret.diffie_hellman(&ephemeral_public);
    let kek = derive_kek(shared.as_bytes(), &ephemeral_public, &recipient)?;
    cipher::open(CipherSuite::Aes256Gcm, &kek[..], iv, sealed).map_err(crypto_err)
}

fn derive_kek(
    shared: &[u8; 32],
    ephemeral: &PublicKey,
    recipient: &PublicKey,
) -> Result<Zeroizing<[u8; KEY_LEN]>, VaultError> {
    let mut salt = [0u8; PUBLIC_LEN * 2];
    salt[..PUBLIC_LEN].copy_from_slice(ephemeral.as_bytes());
    salt[PUBLIC_LEN..].copy_from_slice(recipient.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut kek = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(WRAP_INFO, &mut kek[..]).map_err(|e| VaultError::Crypto {
        reason: format!("key derivation failed: {e}"),
    })?;
    Ok(kek)
}

fn crypto_err<E: ToString>(err: E) -> VaultError {
    VaultError::Crypto {
        reason: err.to_string(),
    }
}

fn keyring_err(err: keyring::Error) -> VaultError {
    VaultError::Unavailable {
        reason: format!("keyring error: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_round_trip() {
        let vault = InMemoryVault::new();
        let pair = vault
            .generate_key("pair", KeySpec::WrappingKeyPair)
            .expect("generate");
        let raw = cipher::generate_key();

        let wrapped = vault.wrap(&pair, &raw[..]).expect("wrap");
        assert_eq!(wrapped.len(), PUBLIC_LEN + 12 + KEY_LEN + 16);
        assert!(!wrapped.windows(KEY_LEN).any(|w| w == &raw[..]));

        let unwrapped = vault.unwrap(&pair, &wrapped).expect("unwrap");
        assert_eq!(unwrapped.as_slice(), &raw[..]);
    }

    #[test]
    fn unwrap_rejects_tampering_and_other_pairs() {
        let vault = InMemoryVault::new();
        let pair = vault
            .generate_key("pair", KeySpec::WrappingKeyPair)
            .expect("generate");
        let other = vault
            .generate_key("other", KeySpec::WrappingKeyPair)
            .expect("generate");
        let mut wrapped = vault.wrap(&pair, b"0123456789abcdef0123456789abcdef").expect("wrap");

        assert!(vault.unwrap(&other, &wrapped).is_err());
        let last = wrapped.len() - 1;
        wrapped[last] ^= 0x01;
        assert!(vault.unwrap(&pair, &wrapped).is_err());
        assert!(vault.unwrap(&pair, &wrapped[..10]).is_err());
    }

    #[test]
    fn symmetric_key_encrypts_inside_vault() {
        let vault = InMemoryVault::new();
        let key = vault
            .generate_key("data", KeySpec::Symmetric256)
            .expect("generate");
        let iv = cipher::generate_iv(CipherSuite::Aes256Gcm);

        let sealed = vault
            .encrypt(&key, CipherSuite::Aes256Gcm, &iv, b"abc123")
            .expect("encrypt");
        let opened = vault
            .decrypt(&key, CipherSuite::Aes256Gcm, &iv, &sealed)
            .expect("decrypt");
        assert_eq!(opened.as_slice(), b"abc123");
    }

    #[test]
    fn wrong_key_kind_is_rejected() {
        let vault = InMemoryVault::new();
        let key = vault
            .generate_key("data", KeySpec::Symmetric256)
            .expect("generate");
        let err = vault.wrap(&key, b"x").expect_err("symmetric key cannot wrap");
        assert!(matches!(err, VaultError::WrongKeyKind { .. }));
    }

    #[test]
    fn reduced_capabilities_are_enforced() {
        let vault = InMemoryVault::with_capabilities(VaultCapabilities {
            symmetric_keys: true,
            key_wrapping: false,
            aead: false,
        });
        assert!(vault.generate_key("pair", KeySpec::WrappingKeyPair).is_err());

        let key = vault
            .generate_key("data", KeySpec::Symmetric256)
            .expect("generate");
        let gcm_iv = cipher::generate_iv(CipherSuite::Aes256Gcm);
        assert!(vault
            .encrypt(&key, CipherSuite::Aes256Gcm, &gcm_iv, b"x")
            .is_err());
        let ctr_iv = cipher::generate_iv(CipherSuite::Aes256Ctr);
        assert!(vault
            .encrypt(&key, CipherSuite::Aes256Ctr, &ctr_iv, b"x")
            .is_ok());
    }

    #[test]
    fn forget_drops_key() {
        let vault = InMemoryVault::new();
        vault
            .generate_key("data", KeySpec::Symmetric256)
            .expect("generate");
        vault.forget("data");
        assert_eq!(vault.get_key("data").expect("get"), None);
    }

    #[test]
    fn stored_secret_encoding_round_trips() {
        let secret = VaultSecret::generate(KeySpec::WrappingKeyPair);
        let decoded = VaultSecret::decode(&secret.encode()).expect("decode");
        assert_eq!(decoded.spec(), KeySpec::WrappingKeyPair);

        assert!(VaultSecret::decode("sym:AAAA").is_err());
        assert!(VaultSecret::decode("garbage").is_err());
    }
}
