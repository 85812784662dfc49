use crate::error::RegistryError;
use crate::plugins::descriptor::{
    DependencySpec, ExtensionPoint, Plugin, PluginDescriptor, PluginState, HOST_API_VERSION,
};
use crate::plugins::discovery::{self, DiscoveredPlugin, ScriptPlugin};
use crate::plugins::priority::PluginOrigin;
use chrono::Utc;
use semver::Version;
use serde::Serialize;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

/// Options accepted by [`PluginRegistry::register`]
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    /// Replace an existing plugin of a different type under the same id
    pub override_existing: bool,
    /// Overrides the manifest's extension point
    pub extension_point: Option<ExtensionPoint>,
    /// Overrides the manifest's (or detected) origin
    pub origin: Option<PluginOrigin>,
    /// Manifest file a discovered plugin came from
    pub discovered_from: Option<PathBuf>,
}

impl RegisterOptions {
    pub fn overriding() -> Self {
        Self {
            override_existing: true,
            ..Self::default()
        }
    }

    pub fn with_origin(mut self, origin: PluginOrigin) -> Self {
        self.origin = Some(origin);
        self
    }
}

struct Entry {
    plugin: Arc<dyn Plugin>,
    descriptor: PluginDescriptor,
}

/// Counts and per-state breakdown of everything the registry knows about
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistryStatus {
    pub total: usize,
    pub loaded: usize,
    pub loaded_plugins: Vec<String>,
    pub registered_not_loaded: Vec<String>,
    pub disabled: Vec<String>,
    pub discovered_not_registered: Vec<String>,
}

/// Store of plugin descriptors.
///
/// One registry is created per host (or per test) and passed by reference to
/// the resolver and loader; callers serialise registration and loading.
#[derive(Default)]
pub struct PluginRegistry {
    order: Vec<String>,
    entries: HashMap<String, Entry>,
    discovered: BTreeMap<String, DiscoveredPlugin>,
    directories: Vec<PathBuf>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_directories(directories: Vec<PathBuf>) -> Self {
        Self {
            directories,
            ..Self::default()
        }
    }

    pub fn add_directory(&mut self, directory: impl Into<PathBuf>) {
        let directory = directory.into();
        if !self.directories.contains(&directory) {
            self.directories.push(directory);
        }
    }

    pub fn directories(&self) -> &[PathBuf] {
        &self.directories
    }

    /// Register `plugin` under `id`.
    ///
    /// Returns `Ok(false)` when the same plugin is already registered under
    /// that id. A different plugin under a taken id is rejected unless
    /// `override_existing` is set.
    pub fn register(
        &mut self,
        id: &str,
        plugin: Arc<dyn Plugin>,
        options: RegisterOptions,
    ) -> Result<bool, RegistryError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(RegistryError::invalid("plugin identifier cannot be empty"));
        }

        let manifest = plugin.manifest().clone();
        manifest.validate()?;

        if let Some(existing) = self.entries.get(id) {
            let same_type = Any::type_id(existing.plugin.as_any()) == Any::type_id(plugin.as_any());
            if same_type && existing.descriptor.manifest == manifest {
                tracing::debug!("Plugin {} already registered, skipping", id);
                return Ok(false);
            }
            if !options.override_existing {
                return Err(RegistryError::DuplicatePlugin { id: id.to_string() });
            }
            tracing::warn!("Overriding registered plugin: {}", id);
        }

        if let Ok(host) = Version::parse(HOST_API_VERSION) {
            if !manifest.is_compatible_with(&host) {
                tracing::warn!(
                    "Plugin {} declares compatibility {:?}, host API is {}",
                    id,
                    manifest.compatibility,
                    HOST_API_VERSION
                );
            }
        }

        let extension_point = options.extension_point.unwrap_or(manifest.extension_point);
        let origin = options
            .origin
            .unwrap_or_else(|| PluginOrigin::detect(id, manifest.origin.as_ref()));
        let version = manifest.version.clone();
        let mut descriptor = PluginDescriptor::new(id, manifest, extension_point, origin);
        descriptor.discovered_from = options.discovered_from;

        if !self.entries.contains_key(id) {
            self.order.push(id.to_string());
        }
        self.entries.insert(id.to_string(), Entry { plugin, descriptor });

        tracing::info!("Registered plugin: {} v{}", id, version);
        Ok(true)
    }

    /// Register a plugin previously found by [`discover`](Self::discover)
    pub fn register_discovered(&mut self, name: &str) -> Result<bool, RegistryError> {
        let discovered = self
            .discovered
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::invalid(format!("plugin '{}' was not discovered", name)))?;
        let options = RegisterOptions {
            discovered_from: Some(discovered.path.clone()),
            ..RegisterOptions::default()
        };
        let plugin: Arc<dyn Plugin> = Arc::new(ScriptPlugin::from(discovered));
        self.register(name, plugin, options)
    }

    pub fn unregister(&mut self, id: &str) -> bool {
        if self.entries.remove(id).is_some() {
            self.order.retain(|existing| existing != id);
            tracing::info!("Unregistered plugin: {}", id);
            true
        } else {
            false
        }
    }

    pub fn get(&self, id: &str) -> Option<&PluginDescriptor> {
        self.entries.get(id).map(|entry| &entry.descriptor)
    }

    pub fn plugin(&self, id: &str) -> Option<Arc<dyn Plugin>> {
        self.entries.get(id).map(|entry| Arc::clone(&entry.plugin))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn is_discovered(&self, id: &str) -> bool {
        self.discovered.contains_key(id)
    }

    /// Registered, or at least discovered on disk
    pub fn knows(&self, id: &str) -> bool {
        self.contains(id) || self.is_discovered(id)
    }

    /// Descriptors in registration order
    pub fn descriptors(&self) -> impl Iterator<Item = &PluginDescriptor> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id).map(|entry| &entry.descriptor))
    }

    pub fn ids(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Move a plugin to `state`; returns false for unknown ids
    pub fn set_state(&mut self, id: &str, state: PluginState) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) => {
                entry.descriptor.state = state;
                entry.descriptor.loaded_at = match state {
                    PluginState::Loaded => Some(Utc::now()),
                    _ => None,
                };
                true
            }
            None => false,
        }
    }

    /// Declared dependencies of a registered or discovered plugin
    pub fn dependencies_of(&self, id: &str) -> Option<Vec<DependencySpec>> {
        let manifest = self
            .get(id)
            .map(|descriptor| &descriptor.manifest)
            .or_else(|| self.discovered.get(id).map(|found| &found.manifest))?;
        Some(manifest.dependency_specs().unwrap_or_default())
    }

    pub fn version_of(&self, id: &str) -> Option<Version> {
        self.get(id)
            .map(|descriptor| &descriptor.manifest)
            .or_else(|| self.discovered.get(id).map(|found| &found.manifest))
            .and_then(|manifest| manifest.semver())
    }

    /// Scan the configured directories, refreshing the discovery cache.
    ///
    /// Returns the number of manifests found.
    pub fn discover(&mut self) -> usize {
        let found = discovery::scan(&self.directories);
        let count = found.len();
        for plugin in found {
            self.discovered.insert(plugin.name.clone(), plugin);
        }
        tracing::info!("Discovered {} plugin manifest(s)", count);
        count
    }

    pub fn discovered(&self) -> &BTreeMap<String, DiscoveredPlugin> {
        &self.discovered
    }

    /// Forget every registered and discovered plugin
    pub fn clear(&mut self) {
        self.order.clear();
        self.entries.clear();
        self.discovered.clear();
    }

    pub fn status(&self) -> RegistryStatus {
        let mut status = RegistryStatus {
            total: self.entries.len(),
            ..RegistryStatus::default()
        };

        for descriptor in self.descriptors() {
            match descriptor.state {
                PluginState::Loaded => status.loaded_plugins.push(descriptor.id.clone()),
                PluginState::Registered => status.registered_not_loaded.push(descriptor.id.clone()),
                PluginState::Disabled => status.disabled.push(descriptor.id.clone()),
            }
        }
        status.loaded = status.loaded_plugins.len();
        status.discovered_not_registered = self
            .discovered
            .keys()
            .filter(|name| !self.contains(name))
            .cloned()
            .collect();

        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::descriptor::PluginManifest;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    struct TestPlugin {
        manifest: PluginManifest,
    }

    impl Plugin for TestPlugin {
        fn manifest(&self) -> &PluginManifest {
            &self.manifest
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct OtherPlugin {
        manifest: PluginManifest,
    }

    impl Plugin for OtherPlugin {
        fn manifest(&self) -> &PluginManifest {
            &self.manifest
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn create_test_plugin(name: &str) -> Arc<dyn Plugin> {
        Arc::new(TestPlugin {
            manifest: PluginManifest::new(name, "1.0.0"),
        })
    }

    #[test]
    fn test_plugin_registration() {
        let mut registry = PluginRegistry::new();
        assert!(registry.register("test1", create_test_plugin("test1"), RegisterOptions::default()).unwrap());
        assert_eq!(registry.len(), 1);

        let descriptor = registry.get("test1").unwrap();
        assert_eq!(descriptor.state, PluginState::Registered);
        assert_eq!(descriptor.origin, PluginOrigin::Local);
        assert_eq!(descriptor.manifest.author, "Unknown");
    }

    #[test]
    fn test_duplicate_registration_rules() {
        let mut registry = PluginRegistry::new();
        registry.register("dup", create_test_plugin("dup"), RegisterOptions::default()).unwrap();

        // same plugin again is a silent no-op
        assert!(!registry.register("dup", create_test_plugin("dup"), RegisterOptions::default()).unwrap());

        let other: Arc<dyn Plugin> = Arc::new(OtherPlugin {
            manifest: PluginManifest::new("dup", "2.0.0"),
        });
        let err = registry
            .register("dup", Arc::clone(&other), RegisterOptions::default())
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicatePlugin { id: "dup".into() });

        assert!(registry.register("dup", other, RegisterOptions::overriding()).unwrap());
        assert_eq!(registry.version_of("dup"), Some(Version::new(2, 0, 0)));
        assert_eq!(registry.ids(), vec!["dup".to_string()]);
    }

    #[test]
    fn test_invalid_registrations_are_rejected() {
        let mut registry = PluginRegistry::new();
        assert!(matches!(
            registry.register("  ", create_test_plugin("x"), RegisterOptions::default()),
            Err(RegistryError::InvalidPlugin { .. })
        ));

        let bad_version: Arc<dyn Plugin> = Arc::new(TestPlugin {
            manifest: PluginManifest::new("bad", "latest"),
        });
        assert!(registry.register("bad", bad_version, RegisterOptions::default()).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_status_breakdown_includes_discovered_plugins() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("extra_plugin.toml"), "version = \"1.0.0\"").unwrap();

        let mut registry = PluginRegistry::with_directories(vec![dir.path().to_path_buf()]);
        registry.register("a", create_test_plugin("a"), RegisterOptions::default()).unwrap();
        registry.register("b", create_test_plugin("b"), RegisterOptions::default()).unwrap();
        registry.set_state("a", PluginState::Loaded);
        assert_eq!(registry.discover(), 1);

        let status = registry.status();
        assert_eq!(status.total, 2);
        assert_eq!(status.loaded, 1);
        assert_eq!(status.registered_not_loaded, vec!["b".to_string()]);
        assert_eq!(status.discovered_not_registered, vec!["extra".to_string()]);
        assert!(registry.knows("extra"));

        assert!(registry.register_discovered("extra").unwrap());
        assert!(registry.status().discovered_not_registered.is_empty());
        assert_eq!(
            registry.get("extra").unwrap().discovered_from,
            Some(dir.path().join("extra_plugin.toml"))
        );
        assert!(!registry.get("a").unwrap().is_discovered());

        registry.clear();
        assert!(registry.is_empty());
        assert!(!registry.knows("extra"));
    }
}
