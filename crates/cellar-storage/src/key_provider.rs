use std::{fmt, sync::Arc};

use base64::{engine::general_purpose, Engine as _};
use cellar_core::{
    cipher::CipherSuite,
    vault::{KeyHandle, KeySpec, PlatformKeyVault, VaultError},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::{
    cipher::{self, KEY_LEN},
    record_store::{RecordStore, RecordStoreError},
};

/// Metadata entry describing how the namespace key is held.
pub const KEY_MATERIAL_METADATA_KEY: &str = "cellar.keyMaterial";

/// Suite used whenever the raw key lives in this process.
const SOFTWARE_SUITE: CipherSuite = CipherSuite::Aes256Gcm;

/// Key custody tiers, ordered weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyTier {
    /// Raw key persisted base64-encoded in the metadata region.
    ///
    /// Anyone who can read the storage backend can read the key, so this only
    /// hides values from casual inspection. It exists for platforms with no
    /// secure key custody at all.
    SoftwareOnly,
    /// Raw key generated here, persisted wrapped by a vault-held key pair.
    VaultWrapped,
    /// Key generated and used inside the vault; only its alias is known here.
    VaultSymmetric,
}

impl KeyTier {
    /// Highest tier the vault can serve.
    pub fn probe(vault: Option<&dyn PlatformKeyVault>) -> KeyTier {
        let Some(vault) = vault else {
            return KeyTier::SoftwareOnly;
        };
        let caps = vault.capabilities();
        if caps.symmetric_keys {
            KeyTier::VaultSymmetric
        } else if caps.key_wrapping {
            KeyTier::VaultWrapped
        } else {
            KeyTier::SoftwareOnly
        }
    }

    pub fn is_supported_by(self, vault: Option<&dyn PlatformKeyVault>) -> bool {
        match (self, vault) {
            (KeyTier::SoftwareOnly, _) => true,
            (_, None) => false,
            (KeyTier::VaultWrapped, Some(v)) => v.capabilities().key_wrapping,
            (KeyTier::VaultSymmetric, Some(v)) => v.capabilities().symmetric_keys,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            KeyTier::SoftwareOnly => "software-only",
            KeyTier::VaultWrapped => "vault-wrapped",
            KeyTier::VaultSymmetric => "vault-symmetric",
        }
    }
}

/// Every variant means the namespace key is unavailable.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("vault error: {0}")]
    Vault(#[from] VaultError),
    #[error("storage error: {0}")]
    Storage(#[from] RecordStoreError),
    #[error("key material error: {0}")]
    Decode(String),
    #[error("tier {} is not supported by the available vault", .0.name())]
    Unsupported(KeyTier),
    /// Refuse to overwrite key material a stronger tier wrote.
    #[error("key material was written by tier {}, refusing to downgrade to {}", .stored.name(), .requested.name())]
    Downgrade { stored: KeyTier, requested: KeyTier },
}

/// Symmetric key material scoped to one namespace.
///
/// Never leaves this crate; callers of the store only ever see plaintext
/// values.
pub struct EncryptionKey {
    pub(crate) inner: KeyInner,
}

pub(crate) enum KeyInner {
    Raw(Zeroizing<[u8; KEY_LEN]>),
    Vault {
        vault: Arc<dyn PlatformKeyVault>,
        handle: KeyHandle,
    },
}

impl EncryptionKey {
    pub(crate) fn raw(bytes: Zeroizing<[u8; KEY_LEN]>) -> Self {
        Self {
            inner: KeyInner::Raw(bytes),
        }
    }

    pub(crate) fn vault_held(vault: Arc<dyn PlatformKeyVault>, handle: KeyHandle) -> Self {
        Self {
            inner: KeyInner::Vault { vault, handle },
        }
    }

    pub fn is_vault_held(&self) -> bool {
        matches!(self.inner, KeyInner::Vault { .. })
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            KeyInner::Raw(_) => f.write_str("EncryptionKey::Raw(<redacted>)"),
            KeyInner::Vault { handle, .. } => {
                write!(f, "EncryptionKey::Vault({})", handle.alias())
            }
        }
    }
}

/// Result of key acquisition.
#[derive(Debug)]
pub struct KeyGrant {
    pub key: EncryptionKey,
    /// Key of a weaker tier this one replaces. Records sealed under it have to
    /// be re-encrypted (always with [`SOFTWARE_SUITE`]) before `finish`.
    pub superseded: Option<EncryptionKey>,
    pending: Option<StoredKeyMaterial>,
}

impl KeyGrant {
    fn ready(key: EncryptionKey) -> Self {
        Self {
            key,
            superseded: None,
            pending: None,
        }
    }

    /// Suite the superseded key was used with.
    pub fn superseded_suite(&self) -> CipherSuite {
        SOFTWARE_SUITE
    }

    /// Record the new custody once superseded records have been re-keyed.
    pub fn finish(&self, records: &RecordStore) -> Result<(), KeyError> {
        if let Some(material) = &self.pending {
            write_material(records, material)?;
        }
        Ok(())
    }
}

/// Produces the namespace key, creating and persisting it on first use.
///
/// Calls are idempotent: after the first call has persisted the key, every
/// later call (in this process or a later one) yields the same key.
pub trait KeyProvider: Send + Sync {
    fn tier(&self) -> KeyTier;

    /// Suite records of this tier are sealed with.
    fn cipher_suite(&self) -> CipherSuite;

    fn obtain_key(&self, records: &RecordStore) -> Result<KeyGrant, KeyError>;
}

/// Build the provider for `tier`, checking the vault can serve it.
pub fn provider_for(
    tier: KeyTier,
    vault: Option<Arc<dyn PlatformKeyVault>>,
) -> Result<Box<dyn KeyProvider>, KeyError> {
    if !tier.is_supported_by(vault.as_deref()) {
        return Err(KeyError::Unsupported(tier));
    }
    match (tier, vault) {
        (KeyTier::SoftwareOnly, _) => Ok(Box::new(SoftwareKeyProvider)),
        (KeyTier::VaultWrapped, Some(vault)) => Ok(Box::new(VaultWrappedProvider::new(vault))),
        (KeyTier::VaultSymmetric, Some(vault)) => {
            Ok(Box::new(VaultSymmetricProvider::new(vault)))
        }
        (_, None) => Err(KeyError::Unsupported(tier)),
    }
}

/// Raw key stored base64-encoded in the metadata region.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareKeyProvider;

impl KeyProvider for SoftwareKeyProvider {
    fn tier(&self) -> KeyTier {
        KeyTier::SoftwareOnly
    }

    fn cipher_suite(&self) -> CipherSuite {
        SOFTWARE_SUITE
    }

    fn obtain_key(&self, records: &RecordStore) -> Result<KeyGrant, KeyError> {
        match read_material(records)? {
            Some(material) if material.tier == KeyTier::SoftwareOnly => {
                Ok(KeyGrant::ready(EncryptionKey::raw(decode_key(&material.value)?)))
            }
            Some(material) => Err(KeyError::Downgrade {
                stored: material.tier,
                requested: KeyTier::SoftwareOnly,
            }),
            None => {
                let bytes = cipher::generate_key();
                write_material(
                    records,
                    &StoredKeyMaterial::new(KeyTier::SoftwareOnly, encode_key(&bytes)),
                )?;
                debug!(namespace = records.namespace(), "generated software key");
                Ok(KeyGrant::ready(EncryptionKey::raw(bytes)))
            }
        }
    }
}

/// Raw key wrapped by a vault key pair; the wrapped form is persisted.
pub struct VaultWrappedProvider {
    vault: Arc<dyn PlatformKeyVault>,
}

impl VaultWrappedProvider {
    pub fn new(vault: Arc<dyn PlatformKeyVault>) -> Self {
        Self { vault }
    }

    fn generate_and_wrap(
        &self,
        records: &RecordStore,
        pair: &KeyHandle,
    ) -> Result<KeyGrant, KeyError> {
        let bytes = cipher::generate_key();
        self.store_wrapped(records, pair, &bytes)?;
        debug!(namespace = records.namespace(), "generated wrapped key");
        Ok(KeyGrant::ready(EncryptionKey::raw(bytes)))
    }

    fn store_wrapped(
        &self,
        records: &RecordStore,
        pair: &KeyHandle,
        bytes: &[u8; KEY_LEN],
    ) -> Result<(), KeyError> {
        let wrapped = self.vault.wrap(pair, bytes)?;
        write_material(
            records,
            &StoredKeyMaterial::new(KeyTier::VaultWrapped, general_purpose::STANDARD.encode(wrapped)),
        )
    }
}

impl KeyProvider for VaultWrappedProvider {
    fn tier(&self) -> KeyTier {
        KeyTier::VaultWrapped
    }

    fn cipher_suite(&self) -> CipherSuite {
        SOFTWARE_SUITE
    }

    fn obtain_key(&self, records: &RecordStore) -> Result<KeyGrant, KeyError> {
        let alias = wrapping_alias(records.namespace());
        let (pair, regenerated) = vault_key(self.vault.as_ref(), &alias, KeySpec::WrappingKeyPair)?;

        match read_material(records)? {
            Some(material) if material.tier == KeyTier::VaultWrapped => {
                if regenerated {
                    warn!(
                        namespace = records.namespace(),
                        "wrapping key pair was lost; previous key is unrecoverable"
                    );
                    return self.generate_and_wrap(records, &pair);
                }
                let bytes = unwrap_key(self.vault.as_ref(), &pair, &material.value)?;
                Ok(KeyGrant::ready(EncryptionKey::raw(bytes)))
            }
            Some(material) if material.tier == KeyTier::SoftwareOnly => {
                // Same key, stronger custody: records stay valid as they are.
                let bytes = decode_key(&material.value)?;
                self.store_wrapped(records, &pair, &bytes)?;
                debug!(
                    namespace = records.namespace(),
                    "moved software key under vault wrapping"
                );
                Ok(KeyGrant::ready(EncryptionKey::raw(bytes)))
            }
            Some(material) => Err(KeyError::Downgrade {
                stored: material.tier,
                requested: KeyTier::VaultWrapped,
            }),
            None => self.generate_and_wrap(records, &pair),
        }
    }
}

/// Key generated and held inside the vault.
pub struct VaultSymmetricProvider {
    vault: Arc<dyn PlatformKeyVault>,
}

impl VaultSymmetricProvider {
    pub fn new(vault: Arc<dyn PlatformKeyVault>) -> Self {
        Self { vault }
    }

    fn recover_wrapped(
        &self,
        records: &RecordStore,
        wrapped: &str,
    ) -> Result<Option<EncryptionKey>, KeyError> {
        if !self.vault.capabilities().key_wrapping {
            warn!(
                namespace = records.namespace(),
                "vault can no longer unwrap the previous key; its records are lost"
            );
            return Ok(None);
        }
        let alias = wrapping_alias(records.namespace());
        match self.vault.get_key(&alias)? {
            Some(pair) => Ok(Some(EncryptionKey::raw(unwrap_key(
                self.vault.as_ref(),
                &pair,
                wrapped,
            )?))),
            None => {
                warn!(
                    namespace = records.namespace(),
                    "wrapping key pair is gone; previous records are lost"
                );
                Ok(None)
            }
        }
    }
}

impl KeyProvider for VaultSymmetricProvider {
    fn tier(&self) -> KeyTier {
        KeyTier::VaultSymmetric
    }

    fn cipher_suite(&self) -> CipherSuite {
        if self.vault.capabilities().aead {
            CipherSuite::Aes256Gcm
        } else {
            CipherSuite::Aes256Ctr
        }
    }

    fn obtain_key(&self, records: &RecordStore) -> Result<KeyGrant, KeyError> {
        let alias = symmetric_alias(records.namespace());
        let (handle, regenerated) = vault_key(self.vault.as_ref(), &alias, KeySpec::Symmetric256)?;
        let key = EncryptionKey::vault_held(self.vault.clone(), handle);
        let marker = StoredKeyMaterial::new(KeyTier::VaultSymmetric, alias);

        let superseded = match read_material(records)? {
            None => None,
            Some(material) if material.tier == KeyTier::VaultSymmetric => {
                if regenerated {
                    warn!(
                        namespace = records.namespace(),
                        "vault key was lost; previous records are unreadable"
                    );
                }
                return Ok(KeyGrant::ready(key));
            }
            Some(material) if material.tier == KeyTier::SoftwareOnly => {
                Some(EncryptionKey::raw(decode_key(&material.value)?))
            }
            Some(material) => self.recover_wrapped(records, &material.value)?,
        };

        if superseded.is_none() {
            write_material(records, &marker)?;
            return Ok(KeyGrant::ready(key));
        }
        debug!(
            namespace = records.namespace(),
            "vault key supersedes a weaker key; records need re-keying"
        );
        Ok(KeyGrant {
            key,
            superseded,
            pending: Some(marker),
        })
    }
}

/// How the namespace key is held, as persisted in metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoredKeyMaterial {
    tier: KeyTier,
    /// Base64 key (software), base64 wrapped key (wrapped), or vault alias.
    value: String,
}

impl StoredKeyMaterial {
    fn new(tier: KeyTier, value: String) -> Self {
        Self { tier, value }
    }
}

fn read_material(records: &RecordStore) -> Result<Option<StoredKeyMaterial>, KeyError> {
    match records.read_metadata(KEY_MATERIAL_METADATA_KEY)? {
        None => Ok(None),
        Some(json) => serde_json::from_str(&json)
            .map(Some)
            .map_err(|e| KeyError::Decode(e.to_string())),
    }
}

fn write_material(records: &RecordStore, material: &StoredKeyMaterial) -> Result<(), KeyError> {
    let json = serde_json::to_string(material).map_err(|e| KeyError::Decode(e.to_string()))?;
    records.write_metadata(KEY_MATERIAL_METADATA_KEY, &json)?;
    Ok(())
}

/// Existing vault key under `alias`, or a freshly generated one (`true`).
fn vault_key(
    vault: &dyn PlatformKeyVault,
    alias: &str,
    spec: KeySpec,
) -> Result<(KeyHandle, bool), KeyError> {
    match vault.get_key(alias)? {
        Some(handle) if handle.spec() == spec => Ok((handle, false)),
        Some(_) => Err(KeyError::Vault(VaultError::WrongKeyKind {
            alias: alias.to_string(),
            expected: spec,
        })),
        None => Ok((vault.generate_key(alias, spec)?, true)),
    }
}

fn unwrap_key(
    vault: &dyn PlatformKeyVault,
    pair: &KeyHandle,
    wrapped_b64: &str,
) -> Result<Zeroizing<[u8; KEY_LEN]>, KeyError> {
    let wrapped = general_purpose::STANDARD
        .decode(wrapped_b64)
        .map_err(|e| KeyError::Decode(e.to_string()))?;
    let raw = vault.unwrap(pair, &wrapped)?;
    key_from_slice(&raw)
}

fn symmetric_alias(namespace: &str) -> String {
    format!("cellar.{namespace}.data-key")
}

fn wrapping_alias(namespace: &str) -> String {
    format!("cellar.{namespace}.wrapping-key")
}

fn encode_key(bytes: &[u8; KEY_LEN]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

fn decode_key(secret: &str) -> Result<Zeroizing<[u8; KEY_LEN]>, KeyError> {
    let bytes = Zeroizing::new(
        general_purpose::STANDARD
            .decode(secret)
            .map_err(|e| KeyError::Decode(e.to_string()))?,
    );
    key_from_slice(&bytes)
}

fn key_from_slice(bytes: &[u8]) -> Result<Zeroizing<[u8; KEY_LEN]>, KeyError> {
    if bytes.len() != KEY_LEN {
        return Err(KeyError::Decode(format!(
            "expected {KEY_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    out.copy_from_slice(bytes);
    Ok(out)
}
