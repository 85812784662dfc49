//! Error types for the plugin sandbox and loader

use crate::sandbox::RiskLevel;
use thiserror::Error;

/// Errors raised while registering or discovering plugins
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Invalid plugin: {reason}")]
    InvalidPlugin { reason: String },

    #[error("Plugin '{id}' is already registered")]
    DuplicatePlugin { id: String },

    #[error("Failed to load dependency '{dependency}' required by '{plugin}'")]
    MissingDependency { plugin: String, dependency: String },
}

impl RegistryError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidPlugin {
            reason: reason.into(),
        }
    }
}

/// Errors raised by the dependency resolver
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Plugin '{0}' not found in registry")]
    UnknownPlugin(String),

    #[error("Circular dependency detected: {}", .cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },

    #[error("Plugin '{plugin}' has unresolved dependencies: {}", .missing.join(", "))]
    UnresolvedDependency { plugin: String, missing: Vec<String> },

    #[error("Version conflict: '{plugin}' requires {dependency} {required}, but {available} is available")]
    VersionConflict {
        plugin: String,
        dependency: String,
        required: String,
        available: String,
    },
}

/// Errors raised by the static check of plugin scripts
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Plugin '{plugin}' failed integrity check: expected sha256 {expected}, got {actual}")]
    Integrity {
        plugin: String,
        expected: String,
        actual: String,
    },

    #[error("Plugin '{plugin}' rejected with {risk} risk: {}", .issues.join("; "))]
    Rejected {
        plugin: String,
        risk: RiskLevel,
        issues: Vec<String>,
    },
}

/// Errors surfaced by a sandboxed execution.
///
/// `Runtime` is what the script evaluator produces for plain failures
/// (type mismatches, division by zero); the [`crate::sandbox::Sandbox`]
/// rewraps it as `Execution` with the plugin name attached.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SandboxError {
    #[error("{0}")]
    Capability(String),

    #[error("{0}")]
    Security(String),

    #[error("{0}")]
    Resource(String),

    #[error("CPU time limit exceeded: {elapsed:.2}s (limit: {limit}s)")]
    Timeout { elapsed: f64, limit: f64 },

    #[error("Plugin syntax error at line {line}, column {column}: {message}")]
    Syntax {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("{0}")]
    Runtime(String),

    #[error("Plugin '{plugin}' execution failed: {message}")]
    Execution { plugin: String, message: String },
}

impl SandboxError {
    /// True for every limit breach, including CPU-time timeouts
    pub fn is_resource_breach(&self) -> bool {
        matches!(self, Self::Resource(_) | Self::Timeout { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub(crate) fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }
}

/// Main error type for plugin host operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Invalid configuration: {reason}")]
    Configuration { reason: String },

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),
}

/// Result type alias for plugin host operations
pub type Result<T> = std::result::Result<T, Error>;
