use std::{
    fs,
    path::{Path, PathBuf},
};

use cellar_storage::{KeyTier, NamespaceOptions, TierPreference};
use color_eyre::Result;
use dirs::config_dir;
use serde::{Deserialize, Serialize};

/// User-level configuration loaded from `~/.config/cellar/config.toml` (platform-specific).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Override for the data directory (encrypted records).
    pub data_dir: Option<PathBuf>,
    /// OS keyring service name vault keys are stored under.
    pub keyring_service: String,
    pub tier: TierSetting,
    /// `false` keeps values in memory for the life of the process only.
    pub persistence: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            keyring_service: "cellar".to_string(),
            tier: TierSetting::Auto,
            persistence: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TierSetting {
    #[default]
    Auto,
    VaultSymmetric,
    VaultWrapped,
    Software,
}

impl Config {
    pub fn namespace_options(&self) -> NamespaceOptions {
        let tier = match self.tier {
            TierSetting::Auto => TierPreference::Auto,
            TierSetting::VaultSymmetric => TierPreference::Force(KeyTier::VaultSymmetric),
            TierSetting::VaultWrapped => TierPreference::Force(KeyTier::VaultWrapped),
            TierSetting::Software => TierPreference::Force(KeyTier::SoftwareOnly),
        };
        NamespaceOptions {
            persistence_enabled: self.persistence,
            tier,
        }
    }
}

/// Load config from the default path; if missing, return defaults.
pub fn load() -> Result<Config> {
    let path = default_path()?;
    load_from_path(path)
}

/// Load config from a given path; if missing or empty, return defaults.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let cfg: Config = toml::from_str(&contents)?;
    Ok(cfg)
}

/// Resolve the default config path (platform aware).
pub fn default_path() -> Result<PathBuf> {
    let base = config_dir().ok_or_else(|| color_eyre::eyre::eyre!("no config dir available"))?;
    Ok(base.join("cellar").join("config.toml"))
}

/// Write the config to the default path unless a file is already there.
pub fn write_default_if_missing(config: &Config) -> Result<PathBuf> {
    write_to_path_if_missing(config, &default_path()?)
}

fn write_to_path_if_missing(config: &Config, path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(config)?;
    fs::write(path, body)?;
    Ok(path.to_path_buf())
}
