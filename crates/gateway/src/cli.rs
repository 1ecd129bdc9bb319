//! Command-line interface for the gateway binary.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use pg_domain::config::Config;

#[derive(Parser)]
#[command(name = "pulsegate", about = "Medical-simulation voice gateway")]
pub struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = "pulsegate.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the gateway server (default).
    Serve,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Validate the config file and report issues.
    Validate,
    /// Print the effective configuration.
    Show,
}

/// Load the config file; a missing file yields the defaults.
pub fn load_config(path: &PathBuf) -> anyhow::Result<Config> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "no config file, using defaults");
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

pub mod config_cmd {
    use pg_domain::config::{Config, ConfigSeverity};

    /// Returns false when any error-severity issue exists.
    pub fn validate(config: &Config) -> bool {
        let issues = config.validate();
        for issue in &issues {
            match issue.severity {
                ConfigSeverity::Warning => eprintln!("warning: {issue}"),
                ConfigSeverity::Error => eprintln!("error: {issue}"),
            }
        }
        let errors = issues
            .iter()
            .filter(|i| i.severity == ConfigSeverity::Error)
            .count();
        if errors == 0 {
            eprintln!("config ok ({} warning(s))", issues.len());
            true
        } else {
            false
        }
    }

    pub fn show(config: &Config) {
        match toml::to_string_pretty(config) {
            Ok(rendered) => println!("{rendered}"),
            Err(e) => eprintln!("cannot render config: {e}"),
        }
    }
}
