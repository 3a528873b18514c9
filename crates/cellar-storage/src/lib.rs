//! Encrypted key-value persistence with tiered key custody.
//!
//! Values are sealed with AES-256-GCM (or AES-256-CTR where the key custody
//! cannot do AEAD) under a per-namespace key obtained from a [`KeyProvider`],
//! stored through a [`RecordStore`], and mirrored in memory by the
//! [`KeyValueStore`] façade. Legacy plaintext entries are migrated forward by
//! the [`UpgradeCoordinator`] the first time a namespace is opened.

pub mod cipher;
pub mod file_backend;
pub mod key_provider;
pub mod kv_store;
pub mod legacy;
pub mod record_store;
pub mod upgrade;
pub mod vault;

pub use cipher::CipherEngine;
pub use file_backend::FileBackend;
pub use key_provider::{KeyError, KeyProvider, KeyTier};
pub use kv_store::{
    KeyValueStore, NamespaceOptions, NamespacePhase, StoreError, StoreManager, TierPreference,
};
pub use record_store::{EncryptedRecord, RecordStore, RecordStoreError};
pub use upgrade::UpgradeCoordinator;
pub use vault::{InMemoryVault, KeyringVault};
