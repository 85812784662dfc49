//! Command-line interface for the plugin host.
//!
//! Every subcommand builds a [`PluginSystem`] from the host configuration,
//! loads the enabled plugins and reports on, or acts upon, the result.

use crate::config::{HostConfig, DEFAULT_CONFIG_FILE};
use crate::plugins::{builtin, PluginSystem};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

pub mod conflicts;
pub mod exec;
pub mod list;
pub mod resolve;
pub mod status;

/// plugin-sandbox - sandboxed, dependency-aware plugin host
#[derive(Parser)]
#[command(name = "plugin-sandbox")]
#[command(about = "Inspect, load and sandbox statistics plugins")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Print the command conflict report
    #[arg(long)]
    pub conflicts: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Options shared by every subcommand
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Host configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Extra directory to discover plugin manifests in
    #[arg(long = "plugin-dir", global = true)]
    pub plugin_dirs: Vec<PathBuf>,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// List registered and discovered plugins
    List(list::ListArgs),
    /// Show command conflicts between loaded plugins
    Conflicts,
    /// Settle the command conflicts of one plugin
    Resolve(resolve::ResolveArgs),
    /// Show the plugin system health report
    Status(status::StatusArgs),
    /// Run a script file through the sandbox
    Exec(exec::ExecArgs),
}

/// Read the configuration, applying command-line overrides
pub async fn load_config(global: &GlobalArgs) -> HostConfig {
    let mut config = HostConfig::load(&global.config).await;
    for dir in &global.plugin_dirs {
        if !config.plugins.directories.contains(dir) {
            config.plugins.directories.push(dir.clone());
        }
    }
    config
}

/// Build the plugin system and load plugins.
///
/// Loads the configured `plugins.enabled` list. With an empty list (also the
/// result of a missing or broken configuration) only the core plugins are
/// loaded; discovered plugins stay listed but unloaded.
pub async fn load_host(global: &GlobalArgs) -> Result<(HostConfig, PluginSystem)> {
    let config = load_config(global).await;
    let mut system = PluginSystem::from_config(&config).context("Failed to initialise plugin system")?;

    let loaded = if config.plugins.enabled.is_empty() {
        system
            .load_many(&builtin::CORE_PLUGINS[..])
            .into_iter()
            .filter(|(_, outcome)| outcome.is_success())
            .count()
    } else {
        system.load_enabled(&config)
    };
    tracing::debug!("Loaded {} plugin(s)", loaded);

    Ok((config, system))
}

/// Registered plugin ids followed by discovered-only ones
pub fn known_plugins(system: &PluginSystem) -> Vec<String> {
    let registry = system.registry();
    let mut ids = registry.ids();
    for name in registry.discovered().keys() {
        if !ids.contains(name) {
            ids.push(name.clone());
        }
    }
    ids
}
