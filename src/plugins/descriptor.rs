use crate::error::{RegistryError, Result, SandboxError};
use crate::plugins::priority::{PluginOrigin, Ranked};
use crate::plugins::version::{parse_version, VersionConstraint};
use crate::sandbox::Value;
use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Host API version plugins declare compatibility against
pub const HOST_API_VERSION: &str = "1.0.0";

/// Host surface a plugin attaches to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionPoint {
    #[default]
    StatisticsModule,
    CliCommand,
    FileFormat,
    OutputFormat,
    Validator,
}

impl ExtensionPoint {
    pub const ALL: [ExtensionPoint; 5] = [
        ExtensionPoint::StatisticsModule,
        ExtensionPoint::CliCommand,
        ExtensionPoint::FileFormat,
        ExtensionPoint::OutputFormat,
        ExtensionPoint::Validator,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ExtensionPoint::StatisticsModule => "statistics_module",
            ExtensionPoint::CliCommand => "cli_command",
            ExtensionPoint::FileFormat => "file_format",
            ExtensionPoint::OutputFormat => "output_format",
            ExtensionPoint::Validator => "validator",
        }
    }
}

impl fmt::Display for ExtensionPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ExtensionPoint {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ExtensionPoint::ALL
            .into_iter()
            .find(|point| point.as_str() == s)
            .ok_or_else(|| format!("unknown extension point '{}'", s))
    }
}

/// Lifecycle state of a registered plugin
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    #[default]
    Registered,
    Loaded,
    Disabled,
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PluginState::Registered => "registered",
            PluginState::Loaded => "loaded",
            PluginState::Disabled => "disabled",
        };
        f.pad(label)
    }
}

/// One entry of a manifest's dependency list: `name` or `name <constraint>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencySpec {
    pub name: String,
    pub constraint: Option<VersionConstraint>,
}

impl FromStr for DependencySpec {
    type Err = RegistryError;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        let raw = raw.trim();
        let (name, rest) = match raw.find(char::is_whitespace) {
            Some(split) => (&raw[..split], raw[split..].trim()),
            None => (raw, ""),
        };
        if name.is_empty() {
            return Err(RegistryError::invalid("dependency name cannot be empty"));
        }

        let constraint = if rest.is_empty() {
            None
        } else {
            Some(
                rest.parse::<VersionConstraint>()
                    .map_err(|e| RegistryError::invalid(format!("dependency '{}': {}", name, e)))?,
            )
        };

        Ok(Self {
            name: name.to_string(),
            constraint,
        })
    }
}

/// Metadata declared by a plugin, either in code or in a `<name>_plugin.toml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub dependencies: Vec<String>,
    /// CLI command name to the operation it runs
    pub commands: BTreeMap<String, String>,
    pub category: String,
    pub compatibility: Vec<String>,
    pub extension_point: ExtensionPoint,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<PluginOrigin>,
    pub capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    /// Hex sha256 the script must hash to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl Default for PluginManifest {
    fn default() -> Self {
        Self {
            name: String::new(),
            version: "1.0.0".to_string(),
            description: String::new(),
            author: "Unknown".to_string(),
            dependencies: Vec::new(),
            commands: BTreeMap::new(),
            category: "general".to_string(),
            compatibility: vec![HOST_API_VERSION.to_string()],
            extension_point: ExtensionPoint::default(),
            origin: None,
            capabilities: Vec::new(),
            script: None,
            checksum: None,
        }
    }
}

impl PluginManifest {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Self::default()
        }
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_command(mut self, command: impl Into<String>, operation: impl Into<String>) -> Self {
        self.commands.insert(command.into(), operation.into());
        self
    }

    pub fn with_origin(mut self, origin: PluginOrigin) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Validate required fields and the shape of the version and dependency list
    pub fn validate(&self) -> std::result::Result<(), RegistryError> {
        if self.name.trim().is_empty() {
            return Err(RegistryError::invalid("plugin name cannot be empty"));
        }
        if self.version.trim().is_empty() {
            return Err(RegistryError::invalid(format!("plugin '{}' has no version", self.name)));
        }
        if Version::parse(self.version.trim()).is_err() {
            return Err(RegistryError::invalid(format!(
                "plugin '{}' has non-semantic version '{}' (expected x.y.z)",
                self.name, self.version
            )));
        }
        self.dependency_specs()?;
        Ok(())
    }

    pub fn dependency_specs(&self) -> std::result::Result<Vec<DependencySpec>, RegistryError> {
        self.dependencies.iter().map(|raw| raw.parse()).collect()
    }

    pub fn semver(&self) -> Option<Version> {
        parse_version(&self.version)
    }

    /// True when any declared compatibility entry admits `host`
    pub fn is_compatible_with(&self, host: &Version) -> bool {
        self.compatibility.is_empty()
            || self.compatibility.iter().any(|entry| {
                entry
                    .parse::<VersionConstraint>()
                    .map(|constraint| {
                        constraint.matches(host)
                            || parse_version(entry).is_some_and(|v| v.major == host.major)
                    })
                    .unwrap_or(false)
            })
    }
}

/// Parse a plugin manifest from TOML content
pub fn parse_manifest(toml_content: &str) -> Result<PluginManifest> {
    let manifest: PluginManifest = toml::from_str(toml_content)?;
    manifest.validate()?;
    Ok(manifest)
}

pub type OperationFn = fn(&Value) -> std::result::Result<Value, SandboxError>;

/// How an operation runs
#[derive(Clone)]
pub enum Handler {
    /// Host-compiled code, trusted
    Native(OperationFn),
    /// Script executed through the sandbox on behalf of the owning plugin
    Sandboxed {
        script: Arc<str>,
        capabilities: Vec<String>,
    },
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Native(_) => f.write_str("Native"),
            Handler::Sandboxed { capabilities, .. } => f
                .debug_struct("Sandboxed")
                .field("capabilities", capabilities)
                .finish_non_exhaustive(),
        }
    }
}

/// Named operation a statistics-module plugin contributes to the analysis surface
#[derive(Debug, Clone)]
pub struct Operation {
    pub name: String,
    pub handler: Handler,
}

impl Operation {
    pub fn native(name: impl Into<String>, handler: OperationFn) -> Self {
        Self {
            name: name.into(),
            handler: Handler::Native(handler),
        }
    }
}

/// Interface every plugin implements
pub trait Plugin: Send + Sync {
    fn manifest(&self) -> &PluginManifest;

    fn operations(&self) -> Vec<Operation> {
        Vec::new()
    }

    fn as_any(&self) -> &dyn Any;
}

/// Registry record for one plugin
#[derive(Debug, Clone, Serialize)]
pub struct PluginDescriptor {
    pub id: String,
    pub manifest: PluginManifest,
    pub extension_point: ExtensionPoint,
    pub origin: PluginOrigin,
    pub state: PluginState,
    pub registered_at: DateTime<Utc>,
    pub loaded_at: Option<DateTime<Utc>>,
    /// Manifest file the plugin was discovered from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovered_from: Option<PathBuf>,
}

impl PluginDescriptor {
    pub fn new(id: impl Into<String>, manifest: PluginManifest, extension_point: ExtensionPoint, origin: PluginOrigin) -> Self {
        Self {
            id: id.into(),
            manifest,
            extension_point,
            origin,
            state: PluginState::Registered,
            registered_at: Utc::now(),
            loaded_at: None,
            discovered_from: None,
        }
    }

    pub fn is_discovered(&self) -> bool {
        self.discovered_from.is_some()
    }

    pub fn is_loaded(&self) -> bool {
        self.state == PluginState::Loaded
    }

    pub fn is_disabled(&self) -> bool {
        self.state == PluginState::Disabled
    }
}

impl Ranked for PluginDescriptor {
    fn origin(&self) -> &PluginOrigin {
        &self.origin
    }
}
