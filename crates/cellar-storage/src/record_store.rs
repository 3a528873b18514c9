use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use cellar_core::storage::{BackendError, Mutation, StorageBackend, StoredValue};
use thiserror::Error;
use tracing::instrument;

/// Suffix of the entry holding base64 ciphertext.
pub const ENCRYPTED_SUFFIX: &str = ".encrypted";
/// Suffix of the entry holding the base64 IV.
pub const IV_SUFFIX: &str = ".iv";
/// Suffix of the entry holding the record format version.
pub const VERSION_SUFFIX: &str = ".keyvaluestoreversion";
/// Every suffix an encrypted record is spread across.
pub const RECORD_SUFFIXES: [&str; 3] = [ENCRYPTED_SUFFIX, IV_SUFFIX, VERSION_SUFFIX];

/// Appended to a namespace name to form its metadata region.
pub const METADATA_REGION_SUFFIX: &str = "#meta";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordStoreError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    /// Some but not all record fields are present, or a field fails to decode.
    #[error("malformed record {key}: {reason}")]
    Malformed { key: String, reason: String },
}

/// Durable projection of one logical value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedRecord {
    /// Base64 ciphertext (tag included for AEAD suites).
    pub ciphertext: String,
    /// Base64 IV used for this write only.
    pub iv: String,
    pub format_version: u32,
}

impl EncryptedRecord {
    pub fn new(ciphertext: &[u8], iv: &[u8], format_version: u32) -> Self {
        Self {
            ciphertext: STANDARD.encode(ciphertext),
            iv: STANDARD.encode(iv),
            format_version,
        }
    }

    pub fn ciphertext_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.ciphertext)
    }

    pub fn iv_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.iv)
    }
}

/// True when a raw stored key belongs to an encrypted record.
pub fn is_record_field(raw_key: &str) -> bool {
    RECORD_SUFFIXES
        .iter()
        .any(|suffix| raw_key.ends_with(suffix))
}

/// Namespace-scoped view of a storage backend.
///
/// Records live in the namespace's own region, spread over three suffixed
/// entries written in one atomic commit. Key material and the store format
/// version live in a separate metadata region so that clearing records never
/// touches them.
#[derive(Clone)]
pub struct RecordStore {
    backend: Arc<dyn StorageBackend>,
    namespace: String,
    metadata_region: String,
}

impl RecordStore {
    pub fn new(backend: Arc<dyn StorageBackend>, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let metadata_region = format!("{namespace}{METADATA_REGION_SUFFIX}");
        Self {
            backend,
            namespace,
            metadata_region,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn has(&self, key: &str) -> Result<bool, RecordStoreError> {
        Ok(self
            .backend
            .get(&self.namespace, &field(key, ENCRYPTED_SUFFIX))?
            .is_some())
    }

    /// All three fields come from one region snapshot, so they always belong
    /// to the same commit.
    #[instrument(skip_all, fields(namespace = %self.namespace, key = %key))]
    pub fn read(&self, key: &str) -> Result<Option<EncryptedRecord>, RecordStoreError> {
        let mut snapshot = self.backend.load(&self.namespace)?;
        let ciphertext = snapshot.remove(&field(key, ENCRYPTED_SUFFIX));
        let iv = snapshot.remove(&field(key, IV_SUFFIX));
        let version = snapshot.remove(&field(key, VERSION_SUFFIX));

        let (ciphertext, iv, version) = match (ciphertext, iv, version) {
            (None, None, None) => return Ok(None),
            (Some(c), Some(i), Some(v)) => (c, i, v),
            _ => {
                return Err(RecordStoreError::Malformed {
                    key: key.to_string(),
                    reason: "incomplete record fields".to_string(),
                })
            }
        };

        let text = |value: StoredValue, name: &str| match value {
            StoredValue::Text(s) => Ok(s),
            other => Err(RecordStoreError::Malformed {
                key: key.to_string(),
                reason: format!("{name} stored as {}", other.kind()),
            }),
        };
        let ciphertext = text(ciphertext, "ciphertext")?;
        let iv = text(iv, "iv")?;
        let format_version = text(version, "version")?
            .parse::<u32>()
            .map_err(|e| RecordStoreError::Malformed {
                key: key.to_string(),
                reason: format!("version: {e}"),
            })?;

        Ok(Some(EncryptedRecord {
            ciphertext,
            iv,
            format_version,
        }))
    }

    /// Write all three record fields in one commit.
    #[instrument(skip_all, fields(namespace = %self.namespace, key = %key))]
    pub fn write(&self, key: &str, record: &EncryptedRecord) -> Result<(), RecordStoreError> {
        self.backend.commit(
            &self.namespace,
            &[
                Mutation::put(
                    field(key, ENCRYPTED_SUFFIX),
                    StoredValue::text(record.ciphertext.clone()),
                ),
                Mutation::put(field(key, IV_SUFFIX), StoredValue::text(record.iv.clone())),
                Mutation::put(
                    field(key, VERSION_SUFFIX),
                    StoredValue::text(record.format_version.to_string()),
                ),
            ],
        )?;
        Ok(())
    }

    /// Remove all three record fields in one commit (idempotent).
    #[instrument(skip_all, fields(namespace = %self.namespace, key = %key))]
    pub fn delete(&self, key: &str) -> Result<(), RecordStoreError> {
        let mutations: Vec<Mutation> = RECORD_SUFFIXES
            .iter()
            .map(|suffix| Mutation::remove(field(key, suffix)))
            .collect();
        self.backend.commit(&self.namespace, &mutations)?;
        Ok(())
    }

    /// Remove every record in the namespace; metadata is kept.
    #[instrument(skip_all, fields(namespace = %self.namespace))]
    pub fn clear(&self) -> Result<(), RecordStoreError> {
        self.backend.drop_region(&self.namespace)?;
        Ok(())
    }

    /// Raw stored keys, record fields and legacy entries alike.
    pub fn enumerate(&self) -> Result<Vec<String>, RecordStoreError> {
        Ok(self.backend.load(&self.namespace)?.into_keys().collect())
    }

    /// Logical keys of every encrypted record present.
    pub fn logical_keys(&self) -> Result<Vec<String>, RecordStoreError> {
        Ok(self
            .enumerate()?
            .into_iter()
            .filter_map(|raw| raw.strip_suffix(ENCRYPTED_SUFFIX).map(str::to_string))
            .collect())
    }

    pub fn read_raw(&self, raw_key: &str) -> Result<Option<StoredValue>, RecordStoreError> {
        Ok(self.backend.get(&self.namespace, raw_key)?)
    }

    pub fn remove_raw(&self, raw_key: &str) -> Result<(), RecordStoreError> {
        self.backend
            .commit(&self.namespace, &[Mutation::remove(raw_key)])?;
        Ok(())
    }

    pub fn read_metadata(&self, key: &str) -> Result<Option<String>, RecordStoreError> {
        match self.backend.get(&self.metadata_region, key)? {
            None => Ok(None),
            Some(StoredValue::Text(value)) => Ok(Some(value)),
            Some(other) => Err(RecordStoreError::Malformed {
                key: key.to_string(),
                reason: format!("metadata stored as {}", other.kind()),
            }),
        }
    }

    pub fn write_metadata(&self, key: &str, value: &str) -> Result<(), RecordStoreError> {
        self.backend.commit(
            &self.metadata_region,
            &[Mutation::put(key, StoredValue::text(value))],
        )?;
        Ok(())
    }

    /// Drop key material and format version. Records are left alone.
    #[instrument(skip_all, fields(namespace = %self.namespace))]
    pub fn wipe_metadata(&self) -> Result<(), RecordStoreError> {
        self.backend.drop_region(&self.metadata_region)?;
        Ok(())
    }
}

fn field(key: &str, suffix: &str) -> String {
    format!("{key}{suffix}")
}
