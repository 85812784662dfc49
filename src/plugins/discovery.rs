//! On-disk plugin discovery.
//!
//! Plugin manifests are TOML files named `<name>_plugin.toml`. Scanning only
//! reads the declared metadata; nothing is registered or executed here.

use crate::error::{RegistryError, Result};
use crate::plugins::descriptor::{Handler, Operation, Plugin, PluginManifest};
use serde::Serialize;
use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const MANIFEST_SUFFIX: &str = "_plugin.toml";

/// Default category for plugins found on disk that don't declare one
pub const EXTERNAL_CATEGORY: &str = "external";

/// A manifest found on disk
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredPlugin {
    pub name: String,
    pub path: PathBuf,
    pub manifest: PluginManifest,
}

fn plugin_name(path: &Path) -> Option<&str> {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.strip_suffix(MANIFEST_SUFFIX))
        .filter(|name| !name.is_empty())
}

/// Read the metadata of one manifest file
pub fn analyze(path: &Path) -> Result<DiscoveredPlugin> {
    let name = plugin_name(path)
        .ok_or_else(|| RegistryError::invalid(format!("{} is not a plugin manifest", path.display())))?
        .to_string();

    let content = std::fs::read_to_string(path)?;
    let table: toml::Table = toml::from_str(&content)?;
    let mut manifest: PluginManifest = toml::from_str(&content)?;

    if !table.contains_key("name") {
        manifest.name = name.clone();
    }
    if !table.contains_key("category") {
        manifest.category = EXTERNAL_CATEGORY.to_string();
    }
    manifest.validate()?;

    Ok(DiscoveredPlugin {
        name,
        path: path.to_path_buf(),
        manifest,
    })
}

/// Scan `directories` for plugin manifests.
///
/// Missing directories are skipped; a manifest that fails to parse is logged
/// and skipped.
pub fn scan(directories: &[PathBuf]) -> Vec<DiscoveredPlugin> {
    let mut found = Vec::new();

    for directory in directories {
        if !directory.is_dir() {
            debug!("Skipping missing plugin directory: {}", directory.display());
            continue;
        }

        let mut paths: Vec<PathBuf> = WalkDir::new(directory)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|entry| entry.file_type().is_file() && plugin_name(entry.path()).is_some())
            .map(|entry| entry.into_path())
            .collect();
        paths.sort();

        for path in paths {
            match analyze(&path) {
                Ok(plugin) => {
                    debug!("Discovered plugin {} at {}", plugin.name, path.display());
                    found.push(plugin);
                }
                Err(e) => warn!("Failed to analyze plugin file {}: {}", path.display(), e),
            }
        }
    }

    found
}

/// Plugin backed by a discovered manifest.
///
/// When the manifest embeds a script, the plugin exposes one sandboxed
/// operation named after the plugin.
#[derive(Debug, Clone)]
pub struct ScriptPlugin {
    manifest: PluginManifest,
}

impl ScriptPlugin {
    pub fn new(manifest: PluginManifest) -> Self {
        Self { manifest }
    }
}

impl From<DiscoveredPlugin> for ScriptPlugin {
    fn from(discovered: DiscoveredPlugin) -> Self {
        Self::new(discovered.manifest)
    }
}

impl Plugin for ScriptPlugin {
    fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    fn operations(&self) -> Vec<Operation> {
        match &self.manifest.script {
            Some(script) => vec![Operation {
                name: self.manifest.name.clone(),
                handler: Handler::Sandboxed {
                    script: Arc::from(script.as_str()),
                    capabilities: self.manifest.capabilities.clone(),
                },
            }],
            None => Vec::new(),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_scan_finds_manifests_and_skips_broken_ones() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("trend_plugin.toml"),
            "version = \"0.3.1\"\nscript = \"data.mean\"\n",
        )
        .unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(
            dir.path().join("nested").join("histogram_plugin.toml"),
            "name = \"histogram\"\ncategory = \"charts\"\n",
        )
        .unwrap();
        fs::write(dir.path().join("broken_plugin.toml"), "name = [").unwrap();
        fs::write(dir.path().join("notes.toml"), "name = \"ignored\"").unwrap();

        let found = scan(&[dir.path().to_path_buf(), dir.path().join("missing")]);
        let names: Vec<&str> = found.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["histogram", "trend"]);

        let trend = found.iter().find(|p| p.name == "trend").unwrap();
        assert_eq!(trend.manifest.name, "trend");
        assert_eq!(trend.manifest.category, EXTERNAL_CATEGORY);
        assert_eq!(found[0].manifest.category, "charts");
    }

    #[test]
    fn test_script_plugin_exposes_one_sandboxed_operation() {
        let mut manifest = PluginManifest::new("trend", "1.0.0");
        manifest.script = Some("data.mean".into());
        manifest.capabilities = vec!["read_data".into()];

        let operations = ScriptPlugin::new(manifest).operations();
        assert_eq!(operations.len(), 1);
        assert_eq!(operations[0].name, "trend");
        assert!(matches!(
            &operations[0].handler,
            Handler::Sandboxed { capabilities, .. } if capabilities == &vec!["read_data".to_string()]
        ));
    }
}
