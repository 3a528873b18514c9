use clap::{Args, Parser, Subcommand};

/// CLI surface definition.
#[derive(Parser, Debug)]
#[command(
    name = "cellar",
    about = "Encrypted local key-value store",
    version,
    propagate_version = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Store a value.
    Put {
        #[command(flatten)]
        target: Target,
        value: String,
    },
    /// Print a value; exits non-zero when absent.
    Get(Target),
    /// Delete a value.
    Remove(Target),
    /// Report whether a value is present.
    Contains(Target),
    /// Delete every value in a namespace. Key material is kept.
    Clear { namespace: String },
    /// Print version and exit.
    Version,
    /// Round-trip a probe value through the configured store.
    Health,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub namespace: String,
    pub key: String,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}
