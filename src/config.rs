//! Host configuration (`plugins.yml`).
//!
//! An environment overlay next to the base file (`plugins.<env>.yml`, the
//! environment taken from `PLUGIN_SANDBOX_ENV`) is deep-merged over it.

use crate::error::{Error, Result};
use crate::plugins::error_handler::RecoveryStrategy;
use crate::sandbox::{ResourceLimits, SecurityLevel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "plugins.yml";
pub const ENVIRONMENT_VAR: &str = "PLUGIN_SANDBOX_ENV";
pub const DEFAULT_ENVIRONMENT: &str = "development";

/// Environment named by `PLUGIN_SANDBOX_ENV`, `development` when unset
pub fn current_environment() -> String {
    std::env::var(ENVIRONMENT_VAR)
        .ok()
        .filter(|env| !env.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string())
}

/// `plugins.yml` -> `plugins.<environment>.yml`
pub fn overlay_path(path: &Path, environment: &str) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("plugins");
    let name = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}.{}.{}", stem, environment, ext),
        None => format!("{}.{}", stem, environment),
    };
    path.with_file_name(name)
}

fn merge_yaml(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(base), serde_yaml::Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

async fn read_yaml(path: &Path) -> Result<serde_yaml::Value> {
    let content = tokio::fs::read_to_string(path).await?;
    if content.trim().is_empty() {
        return Ok(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
    }
    Ok(serde_yaml::from_str(&content)?)
}

fn check_limits(limits: &ResourceLimits) -> std::result::Result<(), String> {
    if !(limits.cpu_time.is_finite() && limits.cpu_time > 0.0) {
        return Err(format!("cpu_time_secs must be positive, got {}", limits.cpu_time));
    }
    if limits.memory == 0 {
        return Err("memory_bytes must be positive".to_string());
    }
    if limits.output_size == 0 {
        return Err("output_size_bytes must be positive".to_string());
    }
    if limits.stack_depth == 0 {
        return Err("stack_depth must be positive".to_string());
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub plugins: PluginSettings,
    pub security: SecuritySettings,
    pub limits: ResourceLimits,
    /// Custom priority tiers by origin name
    pub priorities: BTreeMap<String, i32>,
    /// Settings for individual plugins, by plugin name
    pub plugin_config: BTreeMap<String, PluginOverrides>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginOverrides {
    /// `false` keeps the plugin out of startup loading
    pub enabled: bool,
    /// Replaces the sandbox limits for this plugin's scripts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceLimits>,
    /// Free-form plugin settings
    pub settings: BTreeMap<String, serde_yaml::Value>,
}

impl Default for PluginOverrides {
    fn default() -> Self {
        Self {
            enabled: true,
            limits: None,
            settings: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginSettings {
    /// Plugins loaded at startup
    pub enabled: Vec<String>,
    pub directories: Vec<PathBuf>,
    /// Plugin to the plugin substituted for it when it cannot load
    pub fallbacks: BTreeMap<String, String>,
    pub recovery_strategy: RecoveryStrategy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySettings {
    pub level: SecurityLevel,
    pub allow_network_access: bool,
    pub allow_file_read: bool,
    pub allow_file_write: bool,
    pub allow_external_command: bool,
    pub allow_system_info: bool,
    pub trusted_plugins: Vec<String>,
    pub trusted_authors: Vec<String>,
    pub log_violations: bool,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            level: SecurityLevel::default(),
            allow_network_access: false,
            allow_file_read: false,
            allow_file_write: false,
            allow_external_command: false,
            allow_system_info: false,
            trusted_plugins: Vec::new(),
            trusted_authors: Vec::new(),
            log_violations: true,
        }
    }
}

impl SecuritySettings {
    /// Capabilities the configuration allows without approval
    pub fn approval_overrides(&self) -> Vec<&'static str> {
        [
            (self.allow_network_access, "network_access"),
            (self.allow_file_read, "file_read"),
            (self.allow_file_write, "file_write"),
            (self.allow_external_command, "external_command"),
            (self.allow_system_info, "system_info"),
        ]
        .into_iter()
        .filter_map(|(allowed, capability)| allowed.then_some(capability))
        .collect()
    }
}

impl HostConfig {
    /// Load the configuration at `path` for the current environment.
    ///
    /// A missing or unreadable file yields the defaults, so startup never
    /// fails on configuration.
    pub async fn load(path: &Path) -> Self {
        Self::load_for_environment(path, &current_environment()).await
    }

    pub async fn load_for_environment(path: &Path, environment: &str) -> Self {
        if !path.exists() && !overlay_path(path, environment).exists() {
            tracing::debug!("No configuration at {}, using defaults", path.display());
            return Self::default();
        }

        match Self::load_layered(path, environment).await {
            Ok(config) => {
                tracing::info!("Loaded host configuration from {} ({})", path.display(), environment);
                config
            }
            Err(e) => {
                tracing::warn!("Ignoring configuration {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Base file only, validated
    pub async fn load_strict(path: &Path) -> Result<Self> {
        let config: Self = serde_yaml::from_value(read_yaml(path).await?)?;
        config.validate()?;
        Ok(config)
    }

    /// Base file with the environment overlay merged over it.
    ///
    /// A broken overlay is skipped with a warning; a broken base is an error.
    pub async fn load_layered(path: &Path, environment: &str) -> Result<Self> {
        let mut value = if path.exists() {
            read_yaml(path).await?
        } else {
            serde_yaml::Value::Mapping(serde_yaml::Mapping::new())
        };

        let overlay = overlay_path(path, environment);
        if overlay.exists() {
            match read_yaml(&overlay).await {
                Ok(layer) => {
                    tracing::debug!("Merging {} configuration from {}", environment, overlay.display());
                    merge_yaml(&mut value, layer);
                }
                Err(e) => tracing::warn!("Skipping configuration overlay {}: {}", overlay.display(), e),
            }
        }

        let config: Self = serde_yaml::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Limits must be positive, globally and per plugin
    pub fn validate(&self) -> Result<()> {
        check_limits(&self.limits).map_err(|reason| Error::Configuration {
            reason: format!("limits: {}", reason),
        })?;
        for (plugin, overrides) in &self.plugin_config {
            if let Some(limits) = &overrides.limits {
                check_limits(limits).map_err(|reason| Error::Configuration {
                    reason: format!("plugin '{}': {}", plugin, reason),
                })?;
            }
        }
        Ok(())
    }

    /// Plugins are enabled unless their `plugin_config` entry says otherwise
    pub fn is_plugin_enabled(&self, id: &str) -> bool {
        self.plugin_config.get(id).map_or(true, |overrides| overrides.enabled)
    }

    pub fn plugin_limits(&self, id: &str) -> Option<ResourceLimits> {
        self.plugin_config.get(id).and_then(|overrides| overrides.limits)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_yaml::to_string(self)?;
        tokio::fs::write(path, content).await?;
        tracing::info!("Saved host configuration to {}", path.display());
        Ok(())
    }

    /// Configured directories followed by the standard ones
    pub fn plugin_directories(&self) -> Vec<PathBuf> {
        let mut directories = self.plugins.directories.clone();
        for standard in Self::standard_plugin_dirs() {
            if !directories.contains(&standard) {
                directories.push(standard);
            }
        }
        directories
    }

    fn standard_plugin_dirs() -> Vec<PathBuf> {
        let mut dirs = vec![PathBuf::from("plugins")];
        if let Some(config_dir) = dirs::config_dir() {
            dirs.push(config_dir.join("plugin-sandbox").join("plugins"));
        }
        dirs
    }
}
