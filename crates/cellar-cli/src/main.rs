mod cli;
mod config;
mod storage;

use crate::cli::{Command, ConfigCommand, Target};
use cellar_storage::{KeyValueStore, NamespaceOptions, StoreManager};
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const HEALTH_NAMESPACE: &str = "cellar-health";

fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config = config::load()?;
    match cli.command {
        Command::Version => print_version(),
        Command::Config(ConfigCommand::Init) => init_config(&config)?,
        Command::Health => run_health_check(&config)?,
        command => run_store_command(command, &config)?,
    }

    Ok(())
}

fn init_tracing() {
    // Respect user-provided filters, default to info to avoid noisy stdout.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("cellar {}", env!("CARGO_PKG_VERSION"));
}

fn init_config(config: &config::Config) -> Result<()> {
    let path = config::write_default_if_missing(config)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}

fn run_store_command(command: Command, config: &config::Config) -> Result<()> {
    let manager = storage::manager_from_config(config)?;
    let options = config.namespace_options();
    match command {
        Command::Put { target, value } => {
            open(&manager, &target.namespace, options)?
                .put(&target.key, Some(value.as_str()))
                .map_err(|e| eyre!(e))?;
        }
        Command::Get(Target { namespace, key }) => {
            let value = open(&manager, &namespace, options)?
                .get(&key)
                .ok_or_else(|| eyre!("{key}: not found in {namespace}"))?;
            println!("{value}");
        }
        Command::Remove(Target { namespace, key }) => {
            open(&manager, &namespace, options)?
                .remove(&key)
                .map_err(|e| eyre!(e))?;
        }
        Command::Contains(Target { namespace, key }) => {
            println!("{}", open(&manager, &namespace, options)?.contains(&key));
        }
        Command::Clear { namespace } => {
            open(&manager, &namespace, options)?
                .clear()
                .map_err(|e| eyre!(e))?;
        }
        Command::Version | Command::Health | Command::Config(_) => {}
    }
    Ok(())
}

/// A one-shot process gains nothing from a memory-only fallback, so a
/// persisted namespace whose key is unavailable is an error here.
fn open(manager: &StoreManager, namespace: &str, options: NamespaceOptions) -> Result<KeyValueStore> {
    let store = if options.persistence_enabled {
        manager.open_strict(namespace, options)
    } else {
        manager.open(namespace, options)
    };
    store.map_err(|e| eyre!(e))
}

/// Runs a quick health check of the encrypted storage path.
fn run_health_check(config: &config::Config) -> Result<()> {
    let manager = storage::manager_from_config(config)?;
    let store = open(&manager, HEALTH_NAMESPACE, config.namespace_options())?;
    run_store_health(&store)?;
    println!(
        "Storage: ok (tier: {})",
        store.tier().map(|tier| tier.name()).unwrap_or("memory-only")
    );
    Ok(())
}

fn run_store_health(store: &KeyValueStore) -> Result<()> {
    let probe_key = "probe";
    let payload = "ok";
    store
        .put(probe_key, Some(payload))
        .map_err(|e| eyre!(e))?;
    let round_trip = store.get(probe_key);
    store.remove(probe_key).map_err(|e| eyre!(e))?;

    if round_trip.as_deref() != Some(payload) {
        color_eyre::eyre::bail!("storage round-trip failed");
    }
    if store.contains(probe_key) {
        color_eyre::eyre::bail!("probe value survived removal");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage;

    #[test]
    fn health_check_with_test_manager_succeeds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = storage::test_manager(dir.path());
        let store = open(&manager, HEALTH_NAMESPACE, NamespaceOptions::default())
            .expect("open should succeed");
        run_store_health(&store).expect("health check should succeed");
    }

    #[test]
    fn values_persist_between_managers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let options = NamespaceOptions::default().with_tier(cellar_storage::KeyTier::SoftwareOnly);

        let first = storage::test_manager(dir.path());
        open(&first, "creds", options)
            .expect("open")
            .put("token", Some("abc123"))
            .expect("put");

        let second = storage::test_manager(dir.path());
        let store = open(&second, "creds", options).expect("reopen");
        assert_eq!(store.get("token"), Some("abc123".to_string()));
    }
}
