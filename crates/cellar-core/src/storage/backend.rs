use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by durable storage backends.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Underlying storage failure (I/O, serialization).
    #[error("storage failure: {reason}")]
    Storage { reason: String },
    /// A region exists but its contents could not be decoded.
    #[error("region {region} is corrupt: {reason}")]
    Corrupt { region: String, reason: String },
}

/// A value as it sits in a backend region.
///
/// Encrypted records and metadata are always `Text`. The other variants only
/// show up in entries written by older, unencrypted generations of a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StoredValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    TextSet(BTreeSet<String>),
}

impl StoredValue {
    pub fn text(value: impl Into<String>) -> Self {
        StoredValue::Text(value.into())
    }

    /// Borrow the string contents when this is a `Text` value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            StoredValue::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StoredValue::Text(_) => "text",
            StoredValue::Integer(_) => "integer",
            StoredValue::Float(_) => "float",
            StoredValue::Boolean(_) => "boolean",
            StoredValue::TextSet(_) => "text_set",
        }
    }
}

impl fmt::Display for StoredValue {
    // Never prints contents; values may be secrets.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.kind())
    }
}

/// One change inside an atomic commit.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Put { key: String, value: StoredValue },
    Remove { key: String },
}

impl Mutation {
    pub fn put(key: impl Into<String>, value: StoredValue) -> Self {
        Mutation::Put {
            key: key.into(),
            value,
        }
    }

    pub fn remove(key: impl Into<String>) -> Self {
        Mutation::Remove { key: key.into() }
    }
}

/// Namespaced string-keyed persistent dictionary.
///
/// A region is an isolated keyspace (one per namespace, plus one metadata
/// region per namespace). Implementations must apply every mutation of a
/// single `commit` call atomically: readers observe all of them or none.
pub trait StorageBackend: Send + Sync {
    /// Load every entry of a region. Missing regions are empty.
    fn load(&self, region: &str) -> Result<BTreeMap<String, StoredValue>, BackendError>;

    /// Fetch a single entry.
    fn get(&self, region: &str, key: &str) -> Result<Option<StoredValue>, BackendError> {
        Ok(self.load(region)?.remove(key))
    }

    /// Apply a batch of mutations atomically.
    fn commit(&self, region: &str, mutations: &[Mutation]) -> Result<(), BackendError>;

    /// Remove a region and all of its entries (idempotent).
    fn drop_region(&self, region: &str) -> Result<(), BackendError>;
}

/// Apply mutations to an in-memory copy of a region.
pub fn apply_mutations(entries: &mut BTreeMap<String, StoredValue>, mutations: &[Mutation]) {
    for mutation in mutations {
        match mutation {
            Mutation::Put { key, value } => {
                entries.insert(key.clone(), value.clone());
            }
            Mutation::Remove { key } => {
                entries.remove(key);
            }
        }
    }
}

/// In-memory backend for tests and ephemeral sessions.
/// Nothing survives the process; clones share the same regions.
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackend {
    inner: Arc<Mutex<HashMap<String, BTreeMap<String, StoredValue>>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a single raw entry, bypassing any record conventions.
    pub fn insert_raw(
        &self,
        region: &str,
        key: impl Into<String>,
        value: StoredValue,
    ) -> Result<(), BackendError> {
        self.commit(region, &[Mutation::put(key, value)])
    }
}

impl StorageBackend for InMemoryBackend {
    fn load(&self, region: &str) -> Result<BTreeMap<String, StoredValue>, BackendError> {
        let map = self.inner.lock().map_err(|err| BackendError::Storage {
            reason: format!("lock poisoned: {err}"),
        })?;
        Ok(map.get(region).cloned().unwrap_or_default())
    }

    fn get(&self, region: &str, key: &str) -> Result<Option<StoredValue>, BackendError> {
        let map = self.inner.lock().map_err(|err| BackendError::Storage {
            reason: format!("lock poisoned: {err}"),
        })?;
        Ok(map.get(region).and_then(|entries| entries.get(key)).cloned())
    }

    fn commit(&self, region: &str, mutations: &[Mutation]) -> Result<(), BackendError> {
        let mut map = self.inner.lock().map_err(|err| BackendError::Storage {
            reason: format!("lock poisoned: {err}"),
        })?;
        let entries = map.entry(region.to_string()).or_default();
        apply_mutations(entries, mutations);
        if entries.is_empty() {
            map.remove(region);
        }
        Ok(())
    }

    fn drop_region(&self, region: &str) -> Result<(), BackendError> {
        let mut map = self.inner.lock().map_err(|err| BackendError::Storage {
            reason: format!("lock poisoned: {err}"),
        })?;
        map.remove(region);
        Ok(())
    }
}
