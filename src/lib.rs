//! # plugin_sandbox
//!
//! Security sandbox and dependency-aware loader for statistics plugins.
//!
//! ## Features
//!
//! - **Capability Manager**: risk-rated capabilities, approval and per-plugin grants
//! - **Method Gate**: allow/deny classification of every call a plugin makes
//! - **Resource Monitor**: CPU time, memory, output size and stack depth limits
//! - **Plugin Registry**: manifest discovery, validation and lifecycle state
//! - **Dependency Resolver**: ordered loading with cycle and version checks
//! - **Plugin Priority**: origin tiers and command conflict resolution
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use plugin_sandbox::config::HostConfig;
//! use plugin_sandbox::plugins::PluginSystem;
//! use plugin_sandbox::sandbox::Value;
//!
//! # fn main() -> plugin_sandbox::Result<()> {
//! let mut system = PluginSystem::from_config(&HostConfig::default())?;
//! system.load("core_distribution");
//!
//! let data = Value::from(vec![1.0, 2.0, 3.0, 40.0]);
//! let summary = system.run_command("summary", data)?;
//! println!("{}", summary);
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod plugins;
pub mod sandbox;

// Re-export commonly used types
pub use error::{Error, Result};
pub use plugins::{PluginRegistry, PluginSystem};
pub use sandbox::{Sandbox, SecurityLevel};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
