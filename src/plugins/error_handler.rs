//! Plugin load error log and recovery policy.

use crate::error::{Error, RegistryError, ResolveError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use tracing::{error, warn};
use uuid::Uuid;

/// Retries allowed per plugin before it is disabled
pub const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Retry,
    Fallback,
    Disable,
    #[default]
    #[serde(alias = "fail_fast")]
    Fail,
    LogContinue,
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecoveryStrategy::Retry => "retry",
            RecoveryStrategy::Fallback => "fallback",
            RecoveryStrategy::Disable => "disable",
            RecoveryStrategy::Fail => "fail",
            RecoveryStrategy::LogContinue => "log_continue",
        };
        f.write_str(name)
    }
}

impl FromStr for RecoveryStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retry" => Ok(RecoveryStrategy::Retry),
            "fallback" => Ok(RecoveryStrategy::Fallback),
            "disable" => Ok(RecoveryStrategy::Disable),
            "fail" | "fail_fast" => Ok(RecoveryStrategy::Fail),
            "log_continue" => Ok(RecoveryStrategy::LogContinue),
            other => Err(format!("unknown recovery strategy '{}'", other)),
        }
    }
}

/// What the loader should do after an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Try again later; the caller owns the retry
    Retry { attempt: u32, delay_secs: u64 },
    /// Load this plugin instead
    Fallback { plugin: String },
    Disable,
    Fail,
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CircularDependency,
    MissingDependency,
    VersionConflict,
    UnknownPlugin,
    InvalidPlugin,
    DuplicatePlugin,
    Sandbox,
    Validation,
    Load,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::CircularDependency => "CircularDependency",
            ErrorKind::MissingDependency => "MissingDependency",
            ErrorKind::VersionConflict => "VersionConflict",
            ErrorKind::UnknownPlugin => "UnknownPlugin",
            ErrorKind::InvalidPlugin => "InvalidPlugin",
            ErrorKind::DuplicatePlugin => "DuplicatePlugin",
            ErrorKind::Sandbox => "Sandbox",
            ErrorKind::Validation => "Validation",
            ErrorKind::Load => "Load",
        }
    }

    /// Kind of a host error; unresolved dependencies count as missing ones
    pub fn of(err: &Error) -> Self {
        match err {
            Error::Resolve(ResolveError::CircularDependency { .. }) => ErrorKind::CircularDependency,
            Error::Resolve(ResolveError::UnresolvedDependency { .. })
            | Error::Registry(RegistryError::MissingDependency { .. }) => ErrorKind::MissingDependency,
            Error::Resolve(ResolveError::VersionConflict { .. }) => ErrorKind::VersionConflict,
            Error::Resolve(ResolveError::UnknownPlugin(_)) => ErrorKind::UnknownPlugin,
            Error::Registry(RegistryError::InvalidPlugin { .. }) => ErrorKind::InvalidPlugin,
            Error::Registry(RegistryError::DuplicatePlugin { .. }) => ErrorKind::DuplicatePlugin,
            Error::Sandbox(_) => ErrorKind::Sandbox,
            Error::Validation(_) => ErrorKind::Validation,
            _ => ErrorKind::Load,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logged plugin error
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorContext {
    pub id: Uuid,
    pub plugin: String,
    pub operation: String,
    pub kind: ErrorKind,
    pub strategy: RecoveryStrategy,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorStatistics {
    pub total_errors: usize,
    pub errors_by_plugin: BTreeMap<String, usize>,
    pub errors_by_kind: BTreeMap<String, usize>,
    pub disabled_plugins: Vec<String>,
    pub recovery_attempts: BTreeMap<String, u32>,
}

type ErrorCallback = Box<dyn Fn(&ErrorContext) + Send + Sync>;

pub struct ErrorHandler {
    default_strategy: RecoveryStrategy,
    log: Vec<ErrorContext>,
    disabled: BTreeSet<String>,
    fallbacks: HashMap<String, String>,
    attempts: HashMap<String, u32>,
    callbacks: Vec<ErrorCallback>,
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new(RecoveryStrategy::default())
    }
}

impl fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorHandler")
            .field("default_strategy", &self.default_strategy)
            .field("errors", &self.log.len())
            .field("disabled", &self.disabled)
            .finish_non_exhaustive()
    }
}

impl ErrorHandler {
    /// `default_strategy` applies to errors that have no kind-specific policy
    pub fn new(default_strategy: RecoveryStrategy) -> Self {
        Self {
            default_strategy,
            log: Vec::new(),
            disabled: BTreeSet::new(),
            fallbacks: HashMap::new(),
            attempts: HashMap::new(),
            callbacks: Vec::new(),
        }
    }

    pub fn default_strategy(&self) -> RecoveryStrategy {
        self.default_strategy
    }

    pub fn set_default_strategy(&mut self, strategy: RecoveryStrategy) {
        self.default_strategy = strategy;
    }

    /// Dependency errors disable, version conflicts fall back, the rest use the default
    pub fn strategy_for(&self, kind: ErrorKind) -> RecoveryStrategy {
        match kind {
            ErrorKind::CircularDependency | ErrorKind::MissingDependency | ErrorKind::Validation => {
                RecoveryStrategy::Disable
            }
            ErrorKind::VersionConflict => RecoveryStrategy::Fallback,
            _ => self.default_strategy,
        }
    }

    pub fn register_fallback(&mut self, plugin: impl Into<String>, fallback: impl Into<String>) {
        self.fallbacks.insert(plugin.into(), fallback.into());
    }

    pub fn fallback_for(&self, plugin: &str) -> Option<&str> {
        self.fallbacks.get(plugin).map(String::as_str)
    }

    pub fn on_error<F>(&mut self, callback: F)
    where
        F: Fn(&ErrorContext) + Send + Sync + 'static,
    {
        self.callbacks.push(Box::new(callback));
    }

    /// Log an error and decide the recovery action
    pub fn handle(
        &mut self,
        plugin: &str,
        operation: &str,
        kind: ErrorKind,
        message: impl Into<String>,
        strategy: RecoveryStrategy,
    ) -> RecoveryAction {
        let context = ErrorContext {
            id: Uuid::new_v4(),
            plugin: plugin.to_string(),
            operation: operation.to_string(),
            kind,
            strategy,
            message: message.into(),
            timestamp: Utc::now(),
        };
        error!(
            plugin = %context.plugin,
            operation = %context.operation,
            kind = %context.kind,
            strategy = %context.strategy,
            "Plugin error: {}",
            context.message
        );

        for callback in &self.callbacks {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(&context))).is_err() {
                warn!(plugin = %context.plugin, "Error callback failed");
            }
        }
        self.log.push(context);

        match strategy {
            RecoveryStrategy::Retry => self.retry(plugin),
            RecoveryStrategy::Fallback => match self.fallbacks.get(plugin) {
                Some(fallback) if !self.disabled.contains(fallback) => RecoveryAction::Fallback {
                    plugin: fallback.clone(),
                },
                _ => RecoveryAction::Fail,
            },
            RecoveryStrategy::Disable => {
                self.disable(plugin);
                RecoveryAction::Disable
            }
            RecoveryStrategy::Fail => RecoveryAction::Fail,
            RecoveryStrategy::LogContinue => {
                warn!(plugin, "Continuing despite error");
                RecoveryAction::Continue
            }
        }
    }

    fn retry(&mut self, plugin: &str) -> RecoveryAction {
        let attempt = self.attempts.entry(plugin.to_string()).or_insert(0);
        *attempt += 1;
        if *attempt > MAX_RETRIES {
            warn!(plugin, "Giving up after {} retries", MAX_RETRIES);
            self.disable(plugin);
            return RecoveryAction::Disable;
        }
        RecoveryAction::Retry {
            attempt: *attempt,
            delay_secs: 1 << (*attempt - 1),
        }
    }

    pub fn disable(&mut self, plugin: &str) {
        if self.disabled.insert(plugin.to_string()) {
            warn!(plugin, "Plugin disabled");
        }
    }

    pub fn is_disabled(&self, plugin: &str) -> bool {
        self.disabled.contains(plugin)
    }

    /// Clear the disabled flag and retry counter for `plugin`
    pub fn enable_plugin(&mut self, plugin: &str) {
        self.disabled.remove(plugin);
        self.attempts.remove(plugin);
    }

    pub fn clear_errors(&mut self) {
        self.log.clear();
        self.disabled.clear();
        self.attempts.clear();
    }

    pub fn errors(&self) -> &[ErrorContext] {
        &self.log
    }

    pub fn errors_for<'a>(&'a self, plugin: &'a str) -> impl Iterator<Item = &'a ErrorContext> + 'a {
        self.log.iter().filter(move |context| context.plugin == plugin)
    }

    pub fn statistics(&self) -> ErrorStatistics {
        let mut stats = ErrorStatistics {
            total_errors: self.log.len(),
            disabled_plugins: self.disabled.iter().cloned().collect(),
            recovery_attempts: self.attempts.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            ..ErrorStatistics::default()
        };
        for context in &self.log {
            *stats.errors_by_plugin.entry(context.plugin.clone()).or_default() += 1;
            *stats.errors_by_kind.entry(context.kind.to_string()).or_default() += 1;
        }
        stats
    }
}

impl fmt::Display for ErrorStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Plugin Error Report")?;
        writeln!(f, "===================")?;
        writeln!(f, "Total Errors: {}", self.total_errors)?;

        if !self.errors_by_plugin.is_empty() {
            writeln!(f, "\nErrors by Plugin:")?;
            for (plugin, count) in &self.errors_by_plugin {
                writeln!(f, "  {}: {} errors", plugin, count)?;
            }
        }
        if !self.errors_by_kind.is_empty() {
            writeln!(f, "\nErrors by Type:")?;
            for (kind, count) in &self.errors_by_kind {
                writeln!(f, "  {}: {} occurrences", kind, count)?;
            }
        }
        if !self.disabled_plugins.is_empty() {
            writeln!(f, "\nDisabled Plugins:")?;
            for plugin in &self.disabled_plugins {
                writeln!(f, "  - {}", plugin)?;
            }
        }
        Ok(())
    }
}
