//! Plugin registry, dependency resolution and the loader.
//!
//! Plugins are registered into a [`PluginRegistry`] (directly or through
//! manifest discovery), ordered by [`DependencyResolver`] and attached to the
//! host by [`PluginSystem`]. Sandboxed plugin code runs through
//! [`crate::sandbox::Sandbox`].

pub mod builtin;
pub mod conflicts;
pub mod descriptor;
pub mod discovery;
pub mod error_handler;
pub mod health;
pub mod loader;
pub mod priority;
pub mod registry;
pub mod resolver;
pub mod validator;
pub mod version;

// Re-export main types
pub use conflicts::{ConflictStrategy, CommandConflict, CommandTable};
pub use descriptor::{ExtensionPoint, Operation, Plugin, PluginDescriptor, PluginManifest, PluginState};
pub use error_handler::{ErrorHandler, RecoveryAction, RecoveryStrategy};
pub use health::HealthReport;
pub use loader::{ConflictResolution, LoadOutcome, PluginSystem};
pub use priority::{PluginOrigin, PluginPriority};
pub use registry::{PluginRegistry, RegisterOptions};
pub use resolver::DependencyResolver;
pub use validator::ValidationReport;
pub use version::VersionConstraint;
