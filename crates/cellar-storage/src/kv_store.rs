use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use cellar_core::{storage::StorageBackend, vault::PlatformKeyVault};
use thiserror::Error;
use tracing::{debug, instrument, warn};
use zeroize::Zeroizing;

use crate::{
    cipher::{CipherEngine, CipherError},
    key_provider::{provider_for, EncryptionKey, KeyError, KeyTier},
    record_store::{EncryptedRecord, RecordStore, RecordStoreError, RECORD_SUFFIXES},
    upgrade::{
        rekey_records, MigrationContext, MigrationError, UpgradeCoordinator, RECORD_FORMAT_VERSION,
    },
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid key: {reason}")]
    InvalidKey { reason: String },
    #[error("invalid namespace: {reason}")]
    InvalidNamespace { reason: String },
    #[error("namespace key unavailable: {reason}")]
    KeyUnavailable { reason: String },
    #[error(transparent)]
    Storage(#[from] RecordStoreError),
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error(transparent)]
    Migration(#[from] MigrationError),
    #[error("lock poisoned")]
    LockPoisoned,
}

impl From<KeyError> for StoreError {
    fn from(err: KeyError) -> Self {
        StoreError::KeyUnavailable {
            reason: err.to_string(),
        }
    }
}

/// Where a namespace is in its lifecycle.
///
/// `Uninitialized -> KeyReady -> Migrated -> Operational` on a persisted open.
/// Memory-only namespaces stay `Uninitialized` until persistence is enabled.
/// `PersistenceDisabled` is terminal for the process: the key could not be
/// obtained and the namespace serves from memory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespacePhase {
    Uninitialized,
    KeyReady,
    Migrated,
    Operational,
    PersistenceDisabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TierPreference {
    /// Highest tier the vault supports.
    #[default]
    Auto,
    /// This tier or nothing.
    Force(KeyTier),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceOptions {
    pub persistence_enabled: bool,
    pub tier: TierPreference,
}

impl Default for NamespaceOptions {
    fn default() -> Self {
        Self {
            persistence_enabled: true,
            tier: TierPreference::Auto,
        }
    }
}

impl NamespaceOptions {
    pub fn memory_only() -> Self {
        Self {
            persistence_enabled: false,
            ..Self::default()
        }
    }

    pub fn with_tier(mut self, tier: KeyTier) -> Self {
        self.tier = TierPreference::Force(tier);
        self
    }
}

/// Owns the namespace registry.
///
/// The first `open` of a namespace creates its state (mirror, key, phase) and
/// registers it; every later `open` of the same name gets a handle onto that
/// state, options ignored. Entries live as long as the manager.
pub struct StoreManager {
    backend: Arc<dyn StorageBackend>,
    vault: Option<Arc<dyn PlatformKeyVault>>,
    coordinator: Arc<UpgradeCoordinator>,
    registry: Mutex<HashMap<String, Arc<Mutex<NamespaceState>>>>,
}

impl StoreManager {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        vault: Option<Arc<dyn PlatformKeyVault>>,
    ) -> Self {
        Self {
            backend,
            vault,
            coordinator: Arc::new(UpgradeCoordinator::default()),
            registry: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_coordinator(mut self, coordinator: UpgradeCoordinator) -> Self {
        self.coordinator = Arc::new(coordinator);
        self
    }

    /// Open a namespace, degrading to memory-only if its key is unavailable.
    #[instrument(skip_all, fields(namespace = %namespace))]
    pub fn open(
        &self,
        namespace: &str,
        options: NamespaceOptions,
    ) -> Result<KeyValueStore, StoreError> {
        validate_namespace(namespace)?;
        let mut registry = self.registry.lock().map_err(|_| StoreError::LockPoisoned)?;
        if let Some(state) = registry.get(namespace) {
            let state = Arc::clone(state);
            drop(registry);
            debug!("namespace already open, sharing its state");
            return Ok(KeyValueStore::new(namespace, state));
        }

        let state = Arc::new(Mutex::new(NamespaceState::new(
            RecordStore::new(Arc::clone(&self.backend), namespace),
            self.vault.clone(),
            Arc::clone(&self.coordinator),
            options,
        )));
        // Hold the namespace lock across registration so nobody sees it
        // before initialization finishes.
        let mut guard = state.lock().map_err(|_| StoreError::LockPoisoned)?;
        registry.insert(namespace.to_string(), Arc::clone(&state));
        drop(registry);

        if options.persistence_enabled {
            if let Err(err) = guard.initialize() {
                guard.degrade(&err);
            }
        }
        drop(guard);
        Ok(KeyValueStore::new(namespace, state))
    }

    /// Like [`open`](Self::open), but reports an unavailable key instead of
    /// degrading silently. The degraded namespace is still registered.
    pub fn open_strict(
        &self,
        namespace: &str,
        options: NamespaceOptions,
    ) -> Result<KeyValueStore, StoreError> {
        let store = self.open(namespace, options)?;
        let state = store.lock()?;
        if state.phase == NamespacePhase::PersistenceDisabled {
            return Err(StoreError::KeyUnavailable {
                reason: state
                    .degraded_reason
                    .clone()
                    .unwrap_or_else(|| "key acquisition failed".to_string()),
            });
        }
        drop(state);
        Ok(store)
    }

    /// Names of every namespace opened so far.
    pub fn namespaces(&self) -> Result<Vec<String>, StoreError> {
        let registry = self.registry.lock().map_err(|_| StoreError::LockPoisoned)?;
        let mut names: Vec<String> = registry.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// Handle onto one namespace. Clones, and handles from repeated `open`
/// calls, share the same mirror and lock.
///
/// Reads never fail: undecryptable, tampered, or version-mismatched records
/// read as absent.
#[derive(Clone)]
pub struct KeyValueStore {
    namespace: Arc<str>,
    state: Arc<Mutex<NamespaceState>>,
}

impl fmt::Debug for KeyValueStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyValueStore")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl KeyValueStore {
    fn new(namespace: &str, state: Arc<Mutex<NamespaceState>>) -> Self {
        Self {
            namespace: Arc::from(namespace),
            state,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, NamespaceState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::LockPoisoned)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[instrument(skip_all, fields(namespace = %self.namespace, key = %key))]
    pub fn get(&self, key: &str) -> Option<String> {
        if validate_key(key).is_err() {
            return None;
        }
        match self.lock() {
            Ok(mut state) => state.get(key),
            Err(err) => {
                warn!(error = %err, "read failed");
                None
            }
        }
    }

    /// Store `value` under `key`; `None` removes the key.
    #[instrument(skip_all, fields(namespace = %self.namespace, key = %key))]
    pub fn put(&self, key: &str, value: Option<&str>) -> Result<(), StoreError> {
        validate_key(key)?;
        let mut state = self.lock()?;
        match value {
            Some(value) => state.put(key, value),
            None => state.remove(key),
        }
    }

    #[instrument(skip_all, fields(namespace = %self.namespace, key = %key))]
    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        self.lock()?.remove(key)
    }

    /// Drop every value. Key material stays; see [`wipe`](Self::wipe).
    #[instrument(skip_all, fields(namespace = %self.namespace))]
    pub fn clear(&self) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.mirror.clear();
        if state.persists() {
            state.records.clear()?;
        }
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Turning persistence off erases every durable record of the namespace;
    /// values written in this process stay readable from memory. Turning it on
    /// again writes the in-memory values back to durable storage.
    #[instrument(skip_all, fields(namespace = %self.namespace, enabled = enabled))]
    pub fn set_persistence_enabled(&self, enabled: bool) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if enabled {
            state.enable_persistence()
        } else {
            state.persistence_enabled = false;
            state.records.clear()?;
            debug!("persistence disabled, durable records erased");
            Ok(())
        }
    }

    /// Erase records, mirror and key material, then start over with a new key.
    ///
    /// Vault-held keys are not deleted; a vault-symmetric namespace comes back
    /// under the same vault alias.
    #[instrument(skip_all, fields(namespace = %self.namespace))]
    pub fn wipe(&self) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.mirror.clear();
        state.records.clear()?;
        state.records.wipe_metadata()?;
        state.key = None;
        state.tier = None;
        state.degraded_reason = None;
        state.phase = NamespacePhase::Uninitialized;
        debug!("namespace wiped");

        if state.persistence_enabled {
            if let Err(err) = state.initialize() {
                state.degrade(&err);
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn phase(&self) -> NamespacePhase {
        self.lock()
            .map(|state| state.phase)
            .unwrap_or(NamespacePhase::PersistenceDisabled)
    }

    /// Key custody tier, once a key has been obtained.
    pub fn tier(&self) -> Option<KeyTier> {
        self.lock().ok().and_then(|state| state.tier)
    }

    pub fn is_persistence_enabled(&self) -> bool {
        self.lock().map(|state| state.persists()).unwrap_or(false)
    }
}

struct NamespaceState {
    records: RecordStore,
    vault: Option<Arc<dyn PlatformKeyVault>>,
    coordinator: Arc<UpgradeCoordinator>,
    preference: TierPreference,
    persistence_enabled: bool,
    phase: NamespacePhase,
    tier: Option<KeyTier>,
    engine: Option<CipherEngine>,
    key: Option<EncryptionKey>,
    degraded_reason: Option<String>,
    mirror: HashMap<String, Zeroizing<String>>,
}

impl NamespaceState {
    fn new(
        records: RecordStore,
        vault: Option<Arc<dyn PlatformKeyVault>>,
        coordinator: Arc<UpgradeCoordinator>,
        options: NamespaceOptions,
    ) -> Self {
        Self {
            records,
            vault,
            coordinator,
            preference: options.tier,
            persistence_enabled: options.persistence_enabled,
            phase: NamespacePhase::Uninitialized,
            tier: None,
            engine: None,
            key: None,
            degraded_reason: None,
            mirror: HashMap::new(),
        }
    }

    fn persists(&self) -> bool {
        self.persistence_enabled && self.phase == NamespacePhase::Operational
    }

    /// Key, then migration, then ready to serve.
    fn initialize(&mut self) -> Result<(), StoreError> {
        let tier = match self.preference {
            TierPreference::Auto => KeyTier::probe(self.vault.as_deref()),
            TierPreference::Force(tier) => tier,
        };
        let provider = provider_for(tier, self.vault.clone())?;
        let engine = CipherEngine::new(provider.cipher_suite());
        let grant = provider.obtain_key(&self.records)?;
        debug!(tier = tier.name(), suite = engine.suite().name(), "namespace key ready");
        self.phase = NamespacePhase::KeyReady;

        if let Some(old_key) = &grant.superseded {
            let old_engine = CipherEngine::new(grant.superseded_suite());
            let report = rekey_records(&self.records, &old_engine, old_key, &engine, &grant.key)?;
            grant.finish(&self.records)?;
            debug!(
                migrated = report.migrated,
                failed = report.failed,
                "moved records to stronger key custody"
            );
        }
        let key = grant.key;

        self.migrate(&engine, &key);
        self.phase = NamespacePhase::Migrated;

        self.tier = Some(tier);
        self.engine = Some(engine);
        self.key = Some(key);
        self.phase = NamespacePhase::Operational;
        Ok(())
    }

    fn migrate(&self, engine: &CipherEngine, key: &EncryptionKey) {
        let records = &self.records;
        let mut ingest = |raw_key: &str, value: &str| -> Result<(), MigrationError> {
            seal_record(records, engine, key, raw_key, value).map_err(|e| {
                MigrationError::Ingest {
                    key: raw_key.to_string(),
                    reason: e.to_string(),
                }
            })
        };
        let mut ctx = MigrationContext {
            records,
            ingest: &mut ingest,
        };
        match self.coordinator.run(&mut ctx) {
            Ok(report) if report.steps_applied > 0 => debug!(
                migrated = report.migrated,
                failed = report.failed,
                steps = report.steps_applied,
                "namespace migrated"
            ),
            Ok(_) => {}
            // Already-encrypted records stay readable; the next open retries.
            Err(err) => warn!(error = %err, "namespace migration failed"),
        }
    }

    fn degrade(&mut self, err: &StoreError) {
        warn!(
            namespace = self.records.namespace(),
            error = %err,
            "namespace key unavailable, continuing in memory only"
        );
        self.phase = NamespacePhase::PersistenceDisabled;
        self.tier = None;
        self.engine = None;
        self.key = None;
        self.degraded_reason = Some(err.to_string());
    }

    fn get(&mut self, key: &str) -> Option<String> {
        if !self.persists() {
            return self.mirror.get(key).map(|value| value.as_str().to_owned());
        }
        match self.read_durable(key) {
            Ok(Some(value)) => {
                let out = value.as_str().to_owned();
                self.mirror.insert(key.to_string(), value);
                Some(out)
            }
            Ok(None) => {
                self.mirror.remove(key);
                None
            }
            Err(StoreError::Storage(RecordStoreError::Backend(err))) => {
                warn!(error = %err, "durable read failed, serving from memory");
                self.mirror.get(key).map(|value| value.as_str().to_owned())
            }
            Err(err) => {
                warn!(error = %err, "record is unreadable, treating as absent");
                self.mirror.remove(key);
                None
            }
        }
    }

    fn read_durable(&self, key: &str) -> Result<Option<Zeroizing<String>>, StoreError> {
        let (Some(engine), Some(secret)) = (self.engine.as_ref(), self.key.as_ref()) else {
            return Ok(None);
        };
        let Some(record) = self.records.read(key)? else {
            return Ok(None);
        };
        if record.format_version != RECORD_FORMAT_VERSION {
            debug!(
                found = record.format_version,
                expected = RECORD_FORMAT_VERSION,
                "record version mismatch, treating as absent"
            );
            return Ok(None);
        }
        let malformed = |reason: String| RecordStoreError::Malformed {
            key: key.to_string(),
            reason,
        };
        let iv = record.iv_bytes().map_err(|e| malformed(e.to_string()))?;
        let ciphertext = record
            .ciphertext_bytes()
            .map_err(|e| malformed(e.to_string()))?;
        let plaintext = engine.decrypt(secret, &iv, &ciphertext)?;
        Ok(Some(Zeroizing::new(plaintext)))
    }

    fn put(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.mirror
            .insert(key.to_string(), Zeroizing::new(value.to_string()));
        if !self.persists() {
            return Ok(());
        }
        let (Some(engine), Some(secret)) = (self.engine.as_ref(), self.key.as_ref()) else {
            return Ok(());
        };
        seal_record(&self.records, engine, secret, key, value)
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.mirror.remove(key);
        if self.persists() {
            self.records.delete(key)?;
        }
        Ok(())
    }

    fn enable_persistence(&mut self) -> Result<(), StoreError> {
        match self.phase {
            NamespacePhase::PersistenceDisabled => {
                return Err(StoreError::KeyUnavailable {
                    reason: self
                        .degraded_reason
                        .clone()
                        .unwrap_or_else(|| "key acquisition failed".to_string()),
                })
            }
            NamespacePhase::Operational if self.persistence_enabled => return Ok(()),
            NamespacePhase::Operational => {}
            _ => {
                if let Err(err) = self.initialize() {
                    self.degrade(&err);
                    return Err(err);
                }
            }
        }
        self.persistence_enabled = true;

        let (Some(engine), Some(secret)) = (self.engine.as_ref(), self.key.as_ref()) else {
            return Ok(());
        };
        for (key, value) in &self.mirror {
            seal_record(&self.records, engine, secret, key, value)?;
        }
        debug!(flushed = self.mirror.len(), "persistence enabled");
        Ok(())
    }
}

/// Encrypt `value` under a fresh IV and write it as the record for `key`.
fn seal_record(
    records: &RecordStore,
    engine: &CipherEngine,
    secret: &EncryptionKey,
    key: &str,
    value: &str,
) -> Result<(), StoreError> {
    let iv = engine.generate_iv();
    let ciphertext = engine.encrypt(secret, &iv, value)?;
    records.write(
        key,
        &EncryptedRecord::new(&ciphertext, &iv, RECORD_FORMAT_VERSION),
    )?;
    Ok(())
}

fn validate_namespace(namespace: &str) -> Result<(), StoreError> {
    let invalid = |reason: &str| StoreError::InvalidNamespace {
        reason: reason.to_string(),
    };
    if namespace.is_empty() {
        return Err(invalid("namespace is empty"));
    }
    // '#' separates a namespace from its metadata region.
    if namespace.contains(['/', '\\', '#']) {
        return Err(invalid("namespace contains '/', '\\' or '#'"));
    }
    Ok(())
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey {
            reason: "key is empty".to_string(),
        });
    }
    if let Some(suffix) = RECORD_SUFFIXES.iter().find(|suffix| key.ends_with(**suffix)) {
        return Err(StoreError::InvalidKey {
            reason: format!("key ends with reserved suffix {suffix}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, thread};

    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use cellar_core::{
        storage::{InMemoryBackend, StoredValue},
        vault::VaultCapabilities,
    };

    use super::*;
    use crate::{
        file_backend::FileBackend, key_provider::KEY_MATERIAL_METADATA_KEY,
        upgrade::{
            migrate_legacy_plaintext, MigrationReport, MigrationStep, STORE_VERSION_METADATA_KEY,
        },
        vault::InMemoryVault,
    };

    fn manager(backend: &InMemoryBackend, vault: Option<&InMemoryVault>) -> StoreManager {
        StoreManager::new(
            Arc::new(backend.clone()),
            vault.map(|vault| Arc::new(vault.clone()) as Arc<dyn PlatformKeyVault>),
        )
    }

    fn raw_text(backend: &InMemoryBackend, region: &str, key: &str) -> Option<String> {
        backend
            .get(region, key)
            .expect("raw get")
            .and_then(|value| value.as_text().map(str::to_string))
    }

    fn flip_first_bit(backend: &InMemoryBackend, raw_key: &str) {
        let encoded = raw_text(backend, "creds", raw_key).expect("field present");
        let mut bytes = STANDARD.decode(encoded).expect("base64");
        bytes[0] ^= 0x01;
        backend
            .insert_raw("creds", raw_key, StoredValue::text(STANDARD.encode(bytes)))
            .expect("overwrite");
    }

    #[test]
    fn creds_token_scenario() {
        let backend = InMemoryBackend::new();
        let vault = InMemoryVault::new();
        let store = manager(&backend, Some(&vault))
            .open("creds", NamespaceOptions::default())
            .expect("open");
        assert_eq!(store.phase(), NamespacePhase::Operational);
        assert_eq!(store.tier(), Some(KeyTier::VaultSymmetric));

        store.put("token", Some("abc123")).expect("put");
        let ciphertext = raw_text(&backend, "creds", "token.encrypted").expect("ciphertext");
        let iv = raw_text(&backend, "creds", "token.iv").expect("iv");
        assert!(!ciphertext.is_empty());
        assert!(!iv.is_empty());
        assert_ne!(ciphertext, "abc123");
        assert_eq!(
            raw_text(&backend, "creds", "token.keyvaluestoreversion"),
            Some("1".to_string())
        );
        assert_eq!(store.get("token"), Some("abc123".to_string()));

        store.remove("token").expect("remove");
        assert!(!store.contains("token"));
        assert!(backend.load("creds").expect("load").is_empty());
    }

    #[test]
    fn memory_only_round_trip_never_touches_storage() {
        let backend = InMemoryBackend::new();
        let store = manager(&backend, None)
            .open("session", NamespaceOptions::memory_only())
            .expect("open");

        store.put("greeting", Some("héllo, wörld")).expect("put");
        assert_eq!(store.get("greeting"), Some("héllo, wörld".to_string()));
        assert!(store.contains("greeting"));
        assert_eq!(store.phase(), NamespacePhase::Uninitialized);
        assert!(!store.is_persistence_enabled());
        assert!(backend.load("session").expect("load").is_empty());
        assert!(backend.load("session#meta").expect("load").is_empty());
    }

    #[test]
    fn every_put_uses_a_fresh_iv() {
        let backend = InMemoryBackend::new();
        let store = manager(&backend, None)
            .open("creds", NamespaceOptions::default())
            .expect("open");

        store.put("token", Some("same")).expect("put");
        let first = (
            raw_text(&backend, "creds", "token.iv"),
            raw_text(&backend, "creds", "token.encrypted"),
        );
        store.put("token", Some("same")).expect("put");
        let second = (
            raw_text(&backend, "creds", "token.iv"),
            raw_text(&backend, "creds", "token.encrypted"),
        );

        assert_ne!(first.0, second.0);
        assert_ne!(first.1, second.1);
        assert_eq!(store.get("token"), Some("same".to_string()));
    }

    #[test]
    fn tampered_records_read_as_absent() {
        let backend = InMemoryBackend::new();
        let store = manager(&backend, Some(&InMemoryVault::new()))
            .open("creds", NamespaceOptions::default())
            .expect("open");
        store.put("token", Some("abc123")).expect("put");
        store.put("refresh", Some("xyz789")).expect("put");

        flip_first_bit(&backend, "token.encrypted");
        flip_first_bit(&backend, "refresh.iv");

        assert_eq!(store.get("token"), None);
        assert_eq!(store.get("refresh"), None);
        assert!(!store.contains("token"));
    }

    #[test]
    fn older_record_version_reads_as_absent() {
        let backend = InMemoryBackend::new();
        let store = manager(&backend, None)
            .open("creds", NamespaceOptions::default())
            .expect("open");
        store.put("token", Some("abc123")).expect("put");

        backend
            .insert_raw("creds", "token.keyvaluestoreversion", StoredValue::text("0"))
            .expect("overwrite");

        assert_eq!(store.get("token"), None);
        assert!(!store.contains("token"));
    }

    #[test]
    fn put_none_is_remove() {
        let backend = InMemoryBackend::new();
        let store = manager(&backend, None)
            .open("creds", NamespaceOptions::default())
            .expect("open");
        store.put("token", Some("abc123")).expect("put");

        store.put("token", None).expect("put none");
        assert!(!store.contains("token"));
        for suffix in RECORD_SUFFIXES {
            assert_eq!(backend.get("creds", &format!("token{suffix}")).expect("get"), None);
        }
    }

    #[test]
    fn disabling_persistence_erases_records_but_keeps_memory() {
        let backend = InMemoryBackend::new();
        let manager = manager(&backend, None);
        let store = manager
            .open("creds", NamespaceOptions::default())
            .expect("open");
        store.put("token", Some("abc123")).expect("put");

        store.set_persistence_enabled(false).expect("disable");
        assert!(backend.load("creds").expect("load").is_empty());
        assert_eq!(store.get("token"), Some("abc123".to_string()));
        assert!(!store.is_persistence_enabled());

        store.put("later", Some("memory")).expect("put");
        assert!(backend.load("creds").expect("load").is_empty());

        store.set_persistence_enabled(true).expect("enable");
        assert!(raw_text(&backend, "creds", "token.encrypted").is_some());
        assert!(raw_text(&backend, "creds", "later.encrypted").is_some());

        let reopened = StoreManager::new(Arc::new(backend.clone()), None)
            .open("creds", NamespaceOptions::default())
            .expect("reopen");
        assert_eq!(reopened.get("later"), Some("memory".to_string()));
    }

    #[test]
    fn enabling_persistence_on_memory_only_namespace_initializes_it() {
        let backend = InMemoryBackend::new();
        let store = manager(&backend, None)
            .open("creds", NamespaceOptions::memory_only())
            .expect("open");
        store.put("token", Some("abc123")).expect("put");

        store.set_persistence_enabled(true).expect("enable");
        assert_eq!(store.phase(), NamespacePhase::Operational);
        assert_eq!(store.tier(), Some(KeyTier::SoftwareOnly));
        assert!(store.is_persistence_enabled());
        assert!(raw_text(&backend, "creds", "token.encrypted").is_some());
    }

    #[test]
    fn handles_share_one_mirror() {
        let backend = InMemoryBackend::new();
        let manager = manager(&backend, None);
        let first = manager
            .open("session", NamespaceOptions::memory_only())
            .expect("open");
        let second = manager
            .open("session", NamespaceOptions::default())
            .expect("open again");

        first.put("token", Some("abc123")).expect("put");
        assert_eq!(second.get("token"), Some("abc123".to_string()));
        assert!(!second.is_persistence_enabled(), "first open's options win");
        assert_eq!(manager.namespaces().expect("names"), vec!["session".to_string()]);
    }

    #[test]
    fn concurrent_writers_through_cloned_handles() {
        let backend = InMemoryBackend::new();
        let store = manager(&backend, None)
            .open("creds", NamespaceOptions::default())
            .expect("open");

        thread::scope(|scope| {
            for worker in 0..4 {
                let store = store.clone();
                scope.spawn(move || {
                    for i in 0..10 {
                        store
                            .put(&format!("w{worker}-{i}"), Some(format!("v{i}").as_str()))
                            .expect("put");
                    }
                });
            }
        });

        for worker in 0..4 {
            for i in 0..10 {
                assert_eq!(store.get(&format!("w{worker}-{i}")), Some(format!("v{i}")));
            }
        }
    }

    #[test]
    fn unavailable_key_degrades_to_memory_only() {
        let backend = InMemoryBackend::new();
        let vault = InMemoryVault::with_capabilities(VaultCapabilities::none());
        let store = manager(&backend, Some(&vault))
            .open(
                "creds",
                NamespaceOptions::default().with_tier(KeyTier::VaultSymmetric),
            )
            .expect("open degrades instead of failing");

        assert_eq!(store.phase(), NamespacePhase::PersistenceDisabled);
        assert_eq!(store.tier(), None);
        store.put("token", Some("abc123")).expect("put");
        assert_eq!(store.get("token"), Some("abc123".to_string()));
        assert!(backend.load("creds").expect("load").is_empty());

        let err = store
            .set_persistence_enabled(true)
            .expect_err("no key, no persistence");
        assert!(matches!(err, StoreError::KeyUnavailable { .. }));
    }

    #[test]
    fn strict_open_reports_unavailable_key() {
        let backend = InMemoryBackend::new();
        let vault = InMemoryVault::with_capabilities(VaultCapabilities::none());
        let manager = manager(&backend, Some(&vault));

        let err = manager
            .open_strict(
                "creds",
                NamespaceOptions::default().with_tier(KeyTier::VaultWrapped),
            )
            .expect_err("strict open must fail");
        assert!(matches!(err, StoreError::KeyUnavailable { .. }));
        assert_eq!(manager.namespaces().expect("names"), vec!["creds".to_string()]);
    }

    #[test]
    fn stronger_stored_tier_is_not_downgraded() {
        let backend = InMemoryBackend::new();
        let vault = InMemoryVault::new();
        manager(&backend, Some(&vault))
            .open("creds", NamespaceOptions::default())
            .expect("open")
            .put("token", Some("abc123"))
            .expect("put");

        let store = manager(&backend, None)
            .open("creds", NamespaceOptions::default())
            .expect("open");
        assert_eq!(store.phase(), NamespacePhase::PersistenceDisabled);
        assert_eq!(store.get("token"), None);
        assert!(raw_text(&backend, "creds", "token.encrypted").is_some());
    }

    #[test]
    fn legacy_entries_migrate_on_open() {
        let backend = InMemoryBackend::new();
        backend
            .insert_raw("creds", "name", StoredValue::text("alice"))
            .expect("insert");
        backend
            .insert_raw("creds", "count", StoredValue::Integer(3))
            .expect("insert");
        backend
            .insert_raw("creds", "enabled", StoredValue::Boolean(true))
            .expect("insert");
        backend
            .insert_raw(
                "creds",
                "scopes",
                StoredValue::TextSet(BTreeSet::from(["read,write".to_string(), "admin".to_string()])),
            )
            .expect("insert");
        backend
            .insert_raw("creds", "ratio", StoredValue::Float(f64::INFINITY))
            .expect("insert");
        let vault = InMemoryVault::new();

        let store = manager(&backend, Some(&vault))
            .open("creds", NamespaceOptions::default())
            .expect("open");
        assert_eq!(store.get("name"), Some("alice".to_string()));
        assert_eq!(store.get("count"), Some("3".to_string()));
        assert_eq!(store.get("enabled"), Some("true".to_string()));
        assert_eq!(
            store.get("scopes"),
            Some(r#"["admin","read,write"]"#.to_string())
        );
        assert_eq!(store.get("ratio"), None);
        assert_eq!(backend.get("creds", "name").expect("raw"), None);
        assert!(backend.get("creds", "ratio").expect("raw").is_some());
        assert_eq!(
            raw_text(&backend, "creds#meta", STORE_VERSION_METADATA_KEY),
            Some("1".to_string())
        );

        let snapshot = backend.load("creds").expect("load");
        let again = manager(&backend, Some(&vault))
            .open("creds", NamespaceOptions::default())
            .expect("reopen");
        assert_eq!(backend.load("creds").expect("load"), snapshot);
        assert_eq!(again.get("count"), Some("3".to_string()));
    }

    #[test]
    fn software_records_move_to_vault_custody() {
        let backend = InMemoryBackend::new();
        manager(&backend, None)
            .open("creds", NamespaceOptions::default())
            .expect("open")
            .put("token", Some("abc123"))
            .expect("put");

        let store = manager(&backend, Some(&InMemoryVault::new()))
            .open("creds", NamespaceOptions::default())
            .expect("open with vault");
        assert_eq!(store.tier(), Some(KeyTier::VaultSymmetric));
        assert_eq!(store.get("token"), Some("abc123".to_string()));

        let material =
            raw_text(&backend, "creds#meta", KEY_MATERIAL_METADATA_KEY).expect("material");
        assert!(material.contains("vault-symmetric"));
    }

    #[test]
    fn wrapped_and_ctr_tiers_round_trip() {
        let backend = InMemoryBackend::new();
        let wrapped = manager(&backend, Some(&InMemoryVault::new()))
            .open("wrapped", NamespaceOptions::default().with_tier(KeyTier::VaultWrapped))
            .expect("open");
        wrapped.put("token", Some("abc123")).expect("put");
        assert_eq!(wrapped.tier(), Some(KeyTier::VaultWrapped));
        assert_eq!(wrapped.get("token"), Some("abc123".to_string()));

        let no_aead = InMemoryVault::with_capabilities(VaultCapabilities {
            symmetric_keys: true,
            key_wrapping: false,
            aead: false,
        });
        let ctr = manager(&backend, Some(&no_aead))
            .open("ctr", NamespaceOptions::default())
            .expect("open");
        ctr.put("token", Some("abc123")).expect("put");
        assert_eq!(ctr.get("token"), Some("abc123".to_string()));
        let iv = raw_text(&backend, "ctr", "token.iv").expect("iv");
        assert_eq!(STANDARD.decode(iv).expect("base64").len(), 16);
    }

    #[test]
    fn values_survive_restart_with_file_backend() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vault: Arc<dyn PlatformKeyVault> = Arc::new(InMemoryVault::new());
        let open = || {
            StoreManager::new(
                Arc::new(FileBackend::new(dir.path())),
                Some(Arc::clone(&vault)),
            )
            .open("creds", NamespaceOptions::default().with_tier(KeyTier::VaultWrapped))
            .expect("open")
        };

        open().put("token", Some("abc123")).expect("put");
        let reopened = open();
        assert_eq!(reopened.get("token"), Some("abc123".to_string()));
        assert!(reopened.contains("token"));
    }

    #[test]
    fn clear_keeps_key_and_wipe_replaces_it() {
        let backend = InMemoryBackend::new();
        let store = manager(&backend, None)
            .open("creds", NamespaceOptions::default())
            .expect("open");
        store.put("a", Some("1")).expect("put");
        store.put("b", Some("2")).expect("put");
        let material = raw_text(&backend, "creds#meta", KEY_MATERIAL_METADATA_KEY);
        assert!(material.is_some());

        store.clear().expect("clear");
        assert!(!store.contains("a"));
        assert!(backend.load("creds").expect("load").is_empty());
        assert_eq!(raw_text(&backend, "creds#meta", KEY_MATERIAL_METADATA_KEY), material);

        store.put("c", Some("3")).expect("put");
        store.wipe().expect("wipe");
        assert_eq!(store.get("c"), None);
        assert_eq!(store.phase(), NamespacePhase::Operational);
        let fresh = raw_text(&backend, "creds#meta", KEY_MATERIAL_METADATA_KEY);
        assert!(fresh.is_some());
        assert_ne!(fresh, material);

        store.put("d", Some("4")).expect("put after wipe");
        assert_eq!(store.get("d"), Some("4".to_string()));
    }

    #[test]
    fn invalid_names_are_rejected() {
        let backend = InMemoryBackend::new();
        let manager = manager(&backend, None);
        for name in ["", "a/b", "a\\b", "a#meta"] {
            let err = manager
                .open(name, NamespaceOptions::default())
                .expect_err("invalid namespace");
            assert!(matches!(err, StoreError::InvalidNamespace { .. }));
        }

        let store = manager
            .open("creds", NamespaceOptions::default())
            .expect("open");
        for key in ["", "token.iv", "token.encrypted", "token.keyvaluestoreversion"] {
            let err = store.put(key, Some("x")).expect_err("invalid key");
            assert!(matches!(err, StoreError::InvalidKey { .. }));
        }
        assert_eq!(store.get(""), None);
    }

    fn seed_defaults(ctx: &mut MigrationContext<'_>) -> Result<MigrationReport, MigrationError> {
        (ctx.ingest)("theme", "dark")?;
        Ok(MigrationReport {
            migrated: 1,
            ..MigrationReport::default()
        })
    }

    #[test]
    fn custom_migration_chain_runs_on_open() {
        let backend = InMemoryBackend::new();
        backend
            .insert_raw("creds", "count", StoredValue::Integer(3))
            .expect("insert");
        let coordinator = UpgradeCoordinator::new(vec![
            MigrationStep {
                from: 0,
                to: 1,
                name: "encrypt-legacy-plaintext",
                apply: migrate_legacy_plaintext,
            },
            MigrationStep {
                from: 1,
                to: 2,
                name: "seed-defaults",
                apply: seed_defaults,
            },
        ]);
        let manager = manager(&backend, None).with_coordinator(coordinator);

        let store = manager
            .open("creds", NamespaceOptions::default())
            .expect("open");
        assert_eq!(store.phase(), NamespacePhase::Operational);
        assert_eq!(store.get("count"), Some("3".to_string()));
        assert_eq!(store.get("theme"), Some("dark".to_string()));
        assert_eq!(
            raw_text(&backend, "creds#meta", STORE_VERSION_METADATA_KEY),
            Some("2".to_string())
        );
    }

    #[test]
    fn stalled_migration_chain_does_not_block_open() {
        let backend = InMemoryBackend::new();
        let coordinator = UpgradeCoordinator::new(vec![MigrationStep {
            from: 0,
            to: 0,
            name: "stalled",
            apply: seed_defaults,
        }]);
        let manager = manager(&backend, None).with_coordinator(coordinator);

        let store = manager
            .open("creds", NamespaceOptions::default())
            .expect("open");
        assert_eq!(store.phase(), NamespacePhase::Operational);
        store.put("token", Some("abc123")).expect("put");
        assert_eq!(store.get("token"), Some("abc123".to_string()));
        assert_eq!(raw_text(&backend, "creds#meta", STORE_VERSION_METADATA_KEY), None);
    }
}
