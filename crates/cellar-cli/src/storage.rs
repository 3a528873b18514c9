use std::{path::PathBuf, sync::Arc};

use crate::config::{Config, TierSetting};
use cellar_core::vault::PlatformKeyVault;
use cellar_storage::{FileBackend, KeyringVault, StoreManager};
use color_eyre::Result;
use dirs::data_dir;
use tracing::debug;

/// Resolve the default data directory for Cellar.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = data_dir().ok_or_else(|| color_eyre::eyre::eyre!("no data dir available"))?;
    Ok(base.join("cellar"))
}

/// Build a store manager over the file backend, with the OS keyring as vault.
pub fn manager_from_config(config: &Config) -> Result<StoreManager> {
    let root = match &config.data_dir {
        Some(root) => root.clone(),
        None => default_data_dir()?,
    };
    debug!(?root, tier = ?config.tier, "initializing store manager");
    Ok(StoreManager::new(
        Arc::new(FileBackend::new(root)),
        vault_for(config),
    ))
}

/// The software tier never needs a vault; leave the keyring untouched.
fn vault_for(config: &Config) -> Option<Arc<dyn PlatformKeyVault>> {
    if config.tier == TierSetting::Software {
        return None;
    }
    let vault: Arc<dyn PlatformKeyVault> =
        Arc::new(KeyringVault::new(config.keyring_service.clone()));
    Some(vault)
}

/// Helper for tests to construct a manager rooted at a temp dir with an in-memory vault.
#[cfg(test)]
pub fn test_manager(root: impl Into<PathBuf>) -> StoreManager {
    let vault: Arc<dyn PlatformKeyVault> = Arc::new(cellar_storage::InMemoryVault::new());
    StoreManager::new(Arc::new(FileBackend::new(root)), Some(vault))
}
