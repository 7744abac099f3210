//! Command-line interface for the `teststudio` binary.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};

use studio_domain::config::{Config, ConfigSeverity};

/// TestStudio — orchestration backend for the test-generation agent
/// platform.
#[derive(Debug, Parser)]
#[command(name = "teststudio", version, about)]
pub struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "config.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the gateway server (default when no subcommand is given).
    Serve,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    Config::load(path).with_context(|| format!("loading config from {}", path.display()))
}

/// Print validation issues; returns false when any error-severity issue
/// exists.
pub fn validate(config: &Config, path: &Path) -> bool {
    let issues = config.validate();
    if issues.is_empty() {
        println!("{}: OK", path.display());
        return true;
    }
    for issue in &issues {
        println!("{issue}");
    }
    !issues
        .iter()
        .any(|i| i.severity == ConfigSeverity::Error)
}

/// Dump the resolved config (defaults filled in) as TOML.
pub fn show(config: &Config) {
    match toml::to_string_pretty(config) {
        Ok(rendered) => println!("{rendered}"),
        Err(e) => eprintln!("failed to render config: {e}"),
    }
}
