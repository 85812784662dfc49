//! The plugin system: dependency-aware loading on top of the registry.
//!
//! Per-plugin lifecycle is `registered -> loaded`, with `disabled` reachable
//! from either state. Loading a plugin resolves its dependencies, loads
//! each one first, then attaches the plugin to its extension point.
//! Resolver failures never escape [`PluginSystem::load`]; they are logged
//! with the [`ErrorHandler`] and turned into a [`LoadOutcome`].

use crate::config::HostConfig;
use crate::error::{Error, RegistryError, ResolveError, Result, SandboxError};
use crate::plugins::builtin;
use crate::plugins::conflicts::{
    detect_naming_conflicts, name_similarity, namespace_for, CommandClaim, CommandConflict, CommandTable,
    ConflictStrategy, NamingConflict, SIMILARITY_THRESHOLD,
};
use crate::plugins::descriptor::{ExtensionPoint, Handler, Operation, PluginState};
use crate::plugins::error_handler::{ErrorHandler, ErrorKind, RecoveryAction, RecoveryStrategy};
use crate::plugins::health::{HealthReport, PluginHealth};
use crate::plugins::priority::PluginPriority;
use crate::plugins::registry::PluginRegistry;
use crate::plugins::resolver::DependencyResolver;
use crate::plugins::validator::{self, ValidationReport};
use crate::sandbox::{CapabilityManager, ResourceLimits, RiskLevel, Sandbox, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use tracing::{debug, info, warn};

/// Result of one [`PluginSystem::load`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    AlreadyLoaded,
    /// The plugin could not load and `fallback` was loaded in its place
    Substituted { fallback: String },
    Disabled { reason: String },
    Failed { reason: String },
    /// The retry strategy asked for another attempt after `delay_secs`
    RetryDeferred { attempt: u32, delay_secs: u64 },
}

impl LoadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            LoadOutcome::Loaded | LoadOutcome::AlreadyLoaded | LoadOutcome::Substituted { .. }
        )
    }
}

impl fmt::Display for LoadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadOutcome::Loaded => write!(f, "loaded"),
            LoadOutcome::AlreadyLoaded => write!(f, "already loaded"),
            LoadOutcome::Substituted { fallback } => write!(f, "replaced by fallback '{}'", fallback),
            LoadOutcome::Disabled { reason } => write!(f, "disabled: {}", reason),
            LoadOutcome::Failed { reason } => write!(f, "failed: {}", reason),
            LoadOutcome::RetryDeferred { attempt, delay_secs } => {
                write!(f, "retry #{} deferred by {}s", attempt, delay_secs)
            }
        }
    }
}

/// What a conflict resolution changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictResolution {
    NoConflicts,
    /// Contested commands now live under these qualified names
    Namespaced { commands: Vec<String> },
    /// Command to the plugin that now owns it
    Prioritized { winners: BTreeMap<String, String> },
    Disabled { plugins: Vec<String> },
}

struct RegisteredOperation {
    plugin: String,
    handler: Handler,
}

/// Dependency-aware plugin host
pub struct PluginSystem {
    registry: PluginRegistry,
    priority: PluginPriority,
    sandbox: Sandbox,
    errors: ErrorHandler,
    operations: BTreeMap<String, RegisteredOperation>,
    commands: CommandTable,
    extensions: BTreeMap<ExtensionPoint, Vec<String>>,
    trusted_authors: BTreeSet<String>,
    plugin_limits: BTreeMap<String, ResourceLimits>,
    validations: BTreeMap<String, ValidationReport>,
    loading: HashSet<String>,
}

impl Default for PluginSystem {
    fn default() -> Self {
        Self::new(PluginRegistry::new(), Sandbox::default())
    }
}

impl PluginSystem {
    pub fn new(registry: PluginRegistry, sandbox: Sandbox) -> Self {
        Self {
            registry,
            priority: PluginPriority::new(),
            sandbox,
            errors: ErrorHandler::default(),
            operations: BTreeMap::new(),
            commands: CommandTable::new(),
            extensions: BTreeMap::new(),
            trusted_authors: BTreeSet::new(),
            plugin_limits: BTreeMap::new(),
            validations: BTreeMap::new(),
            loading: HashSet::new(),
        }
    }

    /// Build a host from configuration: sandbox policy, priorities, recovery,
    /// built-in plugins and a discovery pass over the plugin directories.
    ///
    /// Nothing is loaded yet; see [`load_enabled`](Self::load_enabled).
    pub fn from_config(config: &HostConfig) -> Result<Self> {
        let mut capabilities = CapabilityManager::new(config.security.trusted_plugins.iter().cloned());
        for capability in config.security.approval_overrides() {
            capabilities.allow_without_approval(capability);
        }
        let sandbox = Sandbox::new(config.security.level, capabilities)
            .with_limits(config.limits)
            .with_event_logging(config.security.log_violations);

        let mut registry = PluginRegistry::with_directories(config.plugin_directories());
        builtin::register_builtins(&mut registry)?;
        registry.discover();

        let mut system = Self::new(registry, sandbox);
        for (origin, tier) in &config.priorities {
            system.priority.set(origin.as_str(), *tier);
        }
        system.errors.set_default_strategy(config.plugins.recovery_strategy);
        for (plugin, fallback) in &config.plugins.fallbacks {
            system.errors.register_fallback(plugin, fallback);
        }
        system.trusted_authors = config.security.trusted_authors.iter().cloned().collect();
        for plugin in config.plugin_config.keys() {
            if let Some(limits) = config.plugin_limits(plugin) {
                system.plugin_limits.insert(plugin.clone(), limits);
            }
        }
        Ok(system)
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut PluginRegistry {
        &mut self.registry
    }

    pub fn priority(&self) -> &PluginPriority {
        &self.priority
    }

    pub fn priority_mut(&mut self) -> &mut PluginPriority {
        &mut self.priority
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn sandbox_mut(&mut self) -> &mut Sandbox {
        &mut self.sandbox
    }

    pub fn errors(&self) -> &ErrorHandler {
        &self.errors
    }

    pub fn errors_mut(&mut self) -> &mut ErrorHandler {
        &mut self.errors
    }

    pub fn commands(&self) -> &CommandTable {
        &self.commands
    }

    pub fn operation_names(&self) -> Vec<&str> {
        self.operations.keys().map(String::as_str).collect()
    }

    /// Plugins attached to a file-format, output-format or validator registry
    pub fn extensions(&self, point: ExtensionPoint) -> &[String] {
        self.extensions.get(&point).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Script scan of a loaded sandboxed plugin
    pub fn validation_report(&self, id: &str) -> Option<&ValidationReport> {
        self.validations.get(id)
    }

    /// Authors whose registered plugins are trusted
    pub fn trust_author(&mut self, author: impl Into<String>) {
        self.trusted_authors.insert(author.into());
    }

    /// Limits replacing the sandbox defaults for `plugin`'s scripts
    pub fn set_plugin_limits(&mut self, plugin: impl Into<String>, limits: ResourceLimits) {
        self.plugin_limits.insert(plugin.into(), limits);
    }

    pub fn is_loaded(&self, id: &str) -> bool {
        self.registry.get(id).is_some_and(|d| d.is_loaded())
    }

    /// Load `id` and everything it depends on
    pub fn load(&mut self, id: &str) -> LoadOutcome {
        if !self.registry.contains(id) {
            if !self.registry.is_discovered(id) {
                return LoadOutcome::Failed {
                    reason: ResolveError::UnknownPlugin(id.to_string()).to_string(),
                };
            }
            if let Err(e) = self.registry.register_discovered(id) {
                return self.handle_error(id, Error::Registry(e));
            }
        }

        let Some(descriptor) = self.registry.get(id) else {
            return LoadOutcome::Failed {
                reason: ResolveError::UnknownPlugin(id.to_string()).to_string(),
            };
        };
        if descriptor.is_loaded() {
            return LoadOutcome::AlreadyLoaded;
        }
        if descriptor.is_disabled() || self.errors.is_disabled(id) {
            return LoadOutcome::Disabled {
                reason: format!("plugin '{}' is disabled", id),
            };
        }
        if !self.loading.insert(id.to_string()) {
            return LoadOutcome::Failed {
                reason: format!("plugin '{}' is already being loaded", id),
            };
        }

        let outcome = self.load_resolved(id);
        self.loading.remove(id);
        outcome
    }

    fn load_resolved(&mut self, id: &str) -> LoadOutcome {
        let order = match DependencyResolver::new(&self.registry).resolve(id, true) {
            Ok(order) => order,
            Err(e) => return self.handle_error(id, Error::Resolve(e)),
        };

        for dependency in order.iter().filter(|dep| dep.as_str() != id) {
            if self.is_loaded(dependency) {
                continue;
            }
            match self.load(dependency) {
                outcome if outcome.is_success() => {}
                // retried by the caller
                outcome @ LoadOutcome::RetryDeferred { .. } => {
                    debug!("Dependency {} of {} deferred: {}", dependency, id, outcome);
                    return outcome;
                }
                LoadOutcome::Failed { reason } => {
                    debug!("Dependency {} of {} failed: {}", dependency, id, reason);
                    return LoadOutcome::Failed {
                        reason: format!("dependency '{}' of '{}' failed: {}", dependency, id, reason),
                    };
                }
                outcome => {
                    debug!("Dependency {} of {} unavailable: {}", dependency, id, outcome);
                    let err = RegistryError::MissingDependency {
                        plugin: id.to_string(),
                        dependency: dependency.clone(),
                    };
                    return self.handle_error(id, Error::Registry(err));
                }
            }
        }

        match self.attach(id) {
            Ok(()) => LoadOutcome::Loaded,
            Err(e) => self.handle_error(id, e),
        }
    }

    /// Attach a resolved plugin to its extension point and mark it loaded
    fn attach(&mut self, id: &str) -> Result<()> {
        let (plugin, descriptor) = match (self.registry.plugin(id), self.registry.get(id)) {
            (Some(plugin), Some(descriptor)) => (plugin, descriptor.clone()),
            _ => return Err(ResolveError::UnknownPlugin(id.to_string()).into()),
        };

        let operations = plugin.operations();
        let mut report: Option<ValidationReport> = None;
        for operation in &operations {
            if let Handler::Sandboxed { script, .. } = &operation.handler {
                self.sandbox.validate(script)?;
                let scanned = validator::validate_script(id, script, descriptor.manifest.checksum.as_deref())?;
                if report.as_ref().map_or(true, |current| scanned.risk > current.risk) {
                    report = Some(scanned);
                }
            }
        }
        if let Some(report) = report {
            if report.risk >= RiskLevel::High {
                warn!(plugin = id, risk = %report.risk, issues = report.issues.len(), "Loading risky plugin script");
            }
            for warning in &report.warnings {
                warn!(plugin = id, "{}", warning);
            }
            self.validations.insert(id.to_string(), report);
        }

        if descriptor.is_discovered() {
            debug!("Plugin {} was discovered, author trust not applied", id);
        } else if validator::is_trusted_author(&descriptor.manifest.author, &self.trusted_authors) {
            self.sandbox.capabilities_mut().add_trusted(id);
        }

        for loaded in self.registry.descriptors().filter(|d| d.is_loaded() && d.id != id) {
            let similarity = name_similarity(id, &loaded.id);
            if similarity > SIMILARITY_THRESHOLD {
                warn!(
                    "Plugin name '{}' is {:.0}% similar to loaded plugin '{}'",
                    id,
                    similarity * 100.0,
                    loaded.id
                );
            }
        }

        match descriptor.extension_point {
            ExtensionPoint::StatisticsModule => {
                self.add_operations(id, operations);
                self.claim_commands(id);
            }
            ExtensionPoint::CliCommand => self.claim_commands(id),
            point => {
                debug!("Registering {} with the {} registry", id, point);
                self.extensions.entry(point).or_default().push(id.to_string());
            }
        }

        self.registry.set_state(id, PluginState::Loaded);
        self.errors.enable_plugin(id);
        info!("Loaded plugin: {} v{}", id, descriptor.manifest.version);
        Ok(())
    }

    fn add_operations(&mut self, id: &str, operations: Vec<Operation>) {
        for operation in operations {
            if let Some(existing) = self.operations.get(&operation.name) {
                let keep_existing = match (self.registry.get(&existing.plugin), self.registry.get(id)) {
                    (Some(current), Some(new)) => !self.priority.can_override(new, current),
                    _ => false,
                };
                if existing.plugin != id && keep_existing {
                    warn!(
                        "Operation '{}' from {} shadowed by {}",
                        operation.name, id, existing.plugin
                    );
                    continue;
                }
            }
            self.operations.insert(
                operation.name,
                RegisteredOperation {
                    plugin: id.to_string(),
                    handler: operation.handler,
                },
            );
        }
    }

    fn claim_commands(&mut self, id: &str) {
        let Some(descriptor) = self.registry.get(id) else {
            return;
        };
        let claims: Vec<(String, CommandClaim)> = descriptor
            .manifest
            .commands
            .iter()
            .map(|(command, operation)| {
                (
                    command.clone(),
                    CommandClaim {
                        plugin: id.to_string(),
                        origin: descriptor.origin.clone(),
                        operation: operation.clone(),
                    },
                )
            })
            .collect();
        for (command, claim) in claims {
            self.commands.claim(&command, claim, &self.priority);
        }
    }

    fn handle_error(&mut self, id: &str, err: Error) -> LoadOutcome {
        let kind = ErrorKind::of(&err);
        let strategy = self.errors.strategy_for(kind);
        let reason = err.to_string();

        match self.errors.handle(id, "load", kind, reason.clone(), strategy) {
            RecoveryAction::Disable => {
                self.disable_plugin(id);
                LoadOutcome::Disabled { reason }
            }
            RecoveryAction::Fallback { plugin } => {
                info!("Substituting fallback {} for {}", plugin, id);
                if self.load(&plugin).is_success() {
                    LoadOutcome::Substituted { fallback: plugin }
                } else {
                    LoadOutcome::Failed { reason }
                }
            }
            RecoveryAction::Retry { attempt, delay_secs } => LoadOutcome::RetryDeferred { attempt, delay_secs },
            RecoveryAction::Fail | RecoveryAction::Continue => LoadOutcome::Failed { reason },
        }
    }

    /// Load several plugins, in the given order
    pub fn load_many<S: AsRef<str>>(&mut self, ids: &[S]) -> Vec<(String, LoadOutcome)> {
        ids.iter()
            .map(|id| (id.as_ref().to_string(), self.load(id.as_ref())))
            .collect()
    }

    /// Load the plugins enabled in `config`; returns how many succeeded.
    ///
    /// Plugins switched off in `plugin_config` are skipped.
    pub fn load_enabled(&mut self, config: &HostConfig) -> usize {
        let enabled: Vec<&String> = config
            .plugins
            .enabled
            .iter()
            .filter(|id| {
                let on = config.is_plugin_enabled(id);
                if !on {
                    info!("Skipping plugin {}: disabled in plugin_config", id);
                }
                on
            })
            .collect();
        self.load_many(&enabled)
            .into_iter()
            .filter(|(id, outcome)| {
                if !outcome.is_success() {
                    warn!("Enabled plugin {} not loaded: {}", id, outcome);
                }
                outcome.is_success()
            })
            .count()
    }

    /// Disable `id`: drop its operations and command claims
    pub fn disable_plugin(&mut self, id: &str) {
        self.errors.disable(id);
        self.registry.set_state(id, PluginState::Disabled);
        self.operations.retain(|_, operation| operation.plugin != id);
        self.commands.release(id, &self.priority);
        for plugins in self.extensions.values_mut() {
            plugins.retain(|plugin| plugin != id);
        }
    }

    /// Allow a disabled plugin to be loaded again
    pub fn enable_plugin(&mut self, id: &str) {
        self.errors.enable_plugin(id);
        if self.registry.get(id).is_some_and(|d| d.is_disabled()) {
            self.registry.set_state(id, PluginState::Registered);
        }
    }

    pub fn set_recovery_strategy(&mut self, strategy: RecoveryStrategy) {
        self.errors.set_default_strategy(strategy);
    }

    /// Run an operation from the analysis surface
    pub fn run_operation(&mut self, name: &str, input: Value) -> Result<Value> {
        let (plugin, handler) = match self.operations.get(name) {
            Some(operation) => (operation.plugin.clone(), operation.handler.clone()),
            None => return Err(Error::UnknownOperation(name.to_string())),
        };
        Ok(self.execute(&plugin, &handler, input)?)
    }

    /// Run a CLI command contributed by a loaded plugin
    pub fn run_command(&mut self, command: &str, input: Value) -> Result<Value> {
        let claim = self
            .commands
            .owner(command)
            .cloned()
            .ok_or_else(|| Error::UnknownCommand(command.to_string()))?;
        let plugin = self
            .registry
            .plugin(&claim.plugin)
            .ok_or_else(|| ResolveError::UnknownPlugin(claim.plugin.clone()))?;
        let operation = plugin
            .operations()
            .into_iter()
            .find(|operation| operation.name == claim.operation)
            .ok_or_else(|| Error::UnknownOperation(format!("{} (command '{}')", claim.operation, command)))?;
        Ok(self.execute(&claim.plugin, &operation.handler, input)?)
    }

    fn execute(&mut self, plugin: &str, handler: &Handler, input: Value) -> std::result::Result<Value, SandboxError> {
        match handler {
            Handler::Native(operation) => operation(&input).map_err(|err| match err {
                SandboxError::Runtime(message) => SandboxError::Execution {
                    plugin: plugin.to_string(),
                    message,
                },
                other => other,
            }),
            Handler::Sandboxed { script, capabilities } => {
                let limits = self.plugin_limits.get(plugin).copied();
                let result = self.sandbox.execute_with(script, plugin, capabilities, input, limits)?;
                if !result.output.is_empty() {
                    debug!(plugin, "Plugin output: {}", result.output.trim_end());
                }
                Ok(result.value)
            }
        }
    }

    pub fn conflicts(&self) -> Vec<CommandConflict> {
        self.commands.conflicts()
    }

    /// Registered plugins with confusingly similar names
    pub fn naming_conflicts(&self) -> Vec<NamingConflict> {
        let plugins: Vec<_> = self
            .registry
            .descriptors()
            .map(|descriptor| (descriptor.id.clone(), descriptor.origin.clone()))
            .collect();
        detect_naming_conflicts(&plugins)
    }

    /// Settle the command conflicts `plugin` is involved in.
    ///
    /// `Interactive` is settled like `Priority`; prompting is up to the caller.
    pub fn resolve_conflicts(&mut self, plugin: &str, strategy: ConflictStrategy) -> Result<ConflictResolution> {
        let origin = self
            .registry
            .get(plugin)
            .map(|d| d.origin.clone())
            .ok_or_else(|| ResolveError::UnknownPlugin(plugin.to_string()))?;

        let conflicts = self.commands.conflicts_for(plugin);
        if conflicts.is_empty() {
            return Ok(ConflictResolution::NoConflicts);
        }

        let resolution = match strategy {
            ConflictStrategy::Namespace => {
                let namespace = namespace_for(plugin, &origin);
                ConflictResolution::Namespaced {
                    commands: self.commands.namespace(plugin, &namespace, &self.priority),
                }
            }
            ConflictStrategy::Priority | ConflictStrategy::Interactive => {
                let mut winners = BTreeMap::new();
                for conflict in &conflicts {
                    if let Some(winner) = self.commands.prioritize(&conflict.command, &self.priority) {
                        winners.insert(conflict.command.clone(), winner);
                    }
                }
                ConflictResolution::Prioritized { winners }
            }
            ConflictStrategy::Disable => {
                let mut losers = BTreeSet::new();
                for conflict in &conflicts {
                    let ranked = self.priority.sort_by_priority(self.commands.claimants(&conflict.command));
                    losers.extend(ranked.into_iter().skip(1).map(|claim| claim.plugin));
                }
                for loser in &losers {
                    self.disable_plugin(loser);
                }
                ConflictResolution::Disabled {
                    plugins: losers.into_iter().collect(),
                }
            }
        };

        info!("Resolved conflicts for {} using {} strategy", plugin, strategy);
        Ok(resolution)
    }

    pub fn health_report(&self) -> HealthReport {
        let errors = self.errors.statistics();
        let plugins = self
            .registry
            .descriptors()
            .map(|descriptor| PluginHealth {
                id: descriptor.id.clone(),
                version: descriptor.manifest.version.clone(),
                origin: descriptor.origin.clone(),
                priority: self.priority.tier(&descriptor.origin),
                extension_point: descriptor.extension_point,
                state: descriptor.state,
                errors: errors.errors_by_plugin.get(&descriptor.id).copied().unwrap_or(0),
            })
            .collect();

        HealthReport::new(
            self.registry.status(),
            plugins,
            errors,
            self.sandbox.capabilities().security_stats(),
            self.sandbox.violation_count(),
            self.commands.conflicts(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PluginOverrides;
    use crate::plugins::descriptor::{Plugin, PluginManifest};
    use crate::plugins::discovery::ScriptPlugin;
    use crate::plugins::priority::PluginOrigin;
    use crate::plugins::registry::RegisterOptions;
    use crate::sandbox::SecurityLevel;
    use pretty_assertions::assert_eq;
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    static ATTACH_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn double(input: &Value) -> std::result::Result<Value, SandboxError> {
        input
            .as_number()
            .map(|n| Value::Number(n * 2.0))
            .ok_or_else(|| SandboxError::runtime("expected a number"))
    }

    struct TestPlugin {
        manifest: PluginManifest,
        counts_attach: bool,
    }

    impl Plugin for TestPlugin {
        fn manifest(&self) -> &PluginManifest {
            &self.manifest
        }

        fn operations(&self) -> Vec<Operation> {
            if self.counts_attach {
                ATTACH_CALLS.fetch_add(1, Ordering::SeqCst);
            }
            vec![Operation::native(format!("{}_double", self.manifest.name), double)]
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn plugin(name: &str, deps: &[&str]) -> Arc<dyn Plugin> {
        Arc::new(TestPlugin {
            manifest: PluginManifest::new(name, "1.0.0").with_dependencies(deps.iter().copied()),
            counts_attach: false,
        })
    }

    fn system_with(plugins: &[(&str, &[&str])]) -> PluginSystem {
        let mut system = PluginSystem::default();
        for (name, deps) in plugins {
            system
                .registry_mut()
                .register(name, plugin(name, deps), RegisterOptions::default())
                .unwrap();
        }
        system
    }

    #[test]
    fn test_missing_dependency_disables_plugin() {
        let mut system = system_with(&[("X", &["Y"])]);

        let outcome = system.load("X");
        assert!(matches!(outcome, LoadOutcome::Disabled { .. }));
        assert_eq!(system.registry().get("X").unwrap().state, PluginState::Disabled);
        assert!(!system.is_loaded("X"));

        let logged = system.errors().errors();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].kind, ErrorKind::MissingDependency);
        assert_eq!(logged[0].plugin, "X");

        // disabled plugins fail fast afterwards
        assert!(matches!(system.load("X"), LoadOutcome::Disabled { .. }));
        assert_eq!(system.errors().errors().len(), 1);
    }

    #[test]
    fn test_dependencies_load_first() {
        let mut system = system_with(&[("A", &["B"]), ("B", &["C"]), ("C", &[])]);
        assert_eq!(system.load("A"), LoadOutcome::Loaded);
        for id in ["A", "B", "C"] {
            assert!(system.is_loaded(id), "{} should be loaded", id);
        }
        assert_eq!(system.operation_names(), vec!["A_double", "B_double", "C_double"]);
        assert_eq!(system.run_operation("C_double", Value::Number(4.0)).unwrap(), Value::Number(8.0));
    }

    #[test]
    fn test_second_load_is_idempotent() {
        let mut system = PluginSystem::default();
        let counted: Arc<dyn Plugin> = Arc::new(TestPlugin {
            manifest: PluginManifest::new("counted", "1.0.0"),
            counts_attach: true,
        });
        system
            .registry_mut()
            .register("counted", counted, RegisterOptions::default())
            .unwrap();

        let before = ATTACH_CALLS.load(Ordering::SeqCst);
        assert_eq!(system.load("counted"), LoadOutcome::Loaded);
        assert_eq!(system.load("counted"), LoadOutcome::AlreadyLoaded);
        assert_eq!(ATTACH_CALLS.load(Ordering::SeqCst) - before, 1);
    }

    #[test]
    fn test_cycle_disables_plugin() {
        let mut system = system_with(&[("A", &["B"]), ("B", &["A"])]);
        match system.load("A") {
            LoadOutcome::Disabled { reason } => assert!(reason.contains("A -> B -> A")),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(system.errors().errors()[0].kind, ErrorKind::CircularDependency);
    }

    #[test]
    fn test_version_conflict_uses_fallback() {
        let mut system = system_with(&[("fancy", &["lib ~> 2.0"]), ("lib", &[]), ("plain", &[])]);
        assert!(matches!(system.load("fancy"), LoadOutcome::Failed { .. }));

        system.errors_mut().register_fallback("fancy", "plain");
        assert_eq!(
            system.load("fancy"),
            LoadOutcome::Substituted {
                fallback: "plain".into()
            }
        );
        assert!(system.is_loaded("plain"));
        assert!(!system.is_loaded("fancy"));
    }

    #[test]
    fn test_unknown_plugin_fails_without_logging() {
        let mut system = PluginSystem::default();
        assert!(matches!(system.load("ghost"), LoadOutcome::Failed { .. }));
        assert!(system.errors().errors().is_empty());
    }

    #[test]
    fn test_script_plugin_with_bad_syntax_uses_recovery_strategy() {
        let mut system = PluginSystem::default();
        system.set_recovery_strategy(RecoveryStrategy::Retry);
        let mut manifest = PluginManifest::new("broken", "1.0.0");
        manifest.script = Some("let = ;".into());
        system
            .registry_mut()
            .register("broken", Arc::new(ScriptPlugin::new(manifest)), RegisterOptions::default())
            .unwrap();

        assert_eq!(
            system.load("broken"),
            LoadOutcome::RetryDeferred {
                attempt: 1,
                delay_secs: 1
            }
        );
        assert_eq!(system.errors().errors()[0].kind, ErrorKind::Sandbox);
        assert!(!system.is_loaded("broken"));
    }

    #[test]
    fn test_deferred_dependency_leaves_parent_loadable() {
        let mut system = PluginSystem::default();
        system.set_recovery_strategy(RecoveryStrategy::Retry);
        let mut flaky = PluginManifest::new("flaky", "1.0.0");
        flaky.script = Some("let = ;".into());
        system
            .registry_mut()
            .register("flaky", Arc::new(ScriptPlugin::new(flaky.clone())), RegisterOptions::default())
            .unwrap();
        system
            .registry_mut()
            .register("parent", plugin("parent", &["flaky"]), RegisterOptions::default())
            .unwrap();

        assert_eq!(
            system.load("parent"),
            LoadOutcome::RetryDeferred {
                attempt: 1,
                delay_secs: 1
            }
        );
        assert_eq!(system.registry().get("parent").unwrap().state, PluginState::Registered);
        assert!(!system.errors().is_disabled("parent"));

        flaky.script = Some("sum(data)".into());
        system
            .registry_mut()
            .register("flaky", Arc::new(ScriptPlugin::new(flaky)), RegisterOptions::overriding())
            .unwrap();
        assert_eq!(system.load("parent"), LoadOutcome::Loaded);
        assert!(system.is_loaded("flaky"));
    }

    #[test]
    fn test_failed_dependency_fails_parent_without_disabling() {
        let mut system = PluginSystem::default();
        let mut broken = PluginManifest::new("broken", "1.0.0");
        broken.script = Some("let = ;".into());
        system
            .registry_mut()
            .register("broken", Arc::new(ScriptPlugin::new(broken)), RegisterOptions::default())
            .unwrap();
        system
            .registry_mut()
            .register("parent", plugin("parent", &["broken"]), RegisterOptions::default())
            .unwrap();

        match system.load("parent") {
            LoadOutcome::Failed { reason } => assert!(reason.contains("dependency 'broken' of 'parent'")),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(system.registry().get("parent").unwrap().state, PluginState::Registered);
    }

    #[test]
    fn test_discovered_script_plugin_runs_in_sandbox() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("spread_plugin.toml"),
            r#"
version = "1.0.0"
dependencies = ["core_basic_stats"]
capabilities = ["read_data"]
script = "let d = data; max(d) - min(d)"
"#,
        )
        .unwrap();

        let mut config = HostConfig::default();
        config.plugins.directories = vec![dir.path().to_path_buf()];
        config.plugins.enabled = vec!["spread".into()];
        config.security.log_violations = false;

        let mut system = PluginSystem::from_config(&config).unwrap();
        assert_eq!(system.load_enabled(&config), 1);
        assert!(system.is_loaded(builtin::BASIC_STATS));

        let result = system
            .run_operation("spread", Value::from(vec![3.0, 9.0, 4.0]))
            .unwrap();
        assert_eq!(result, Value::Number(6.0));
        let summary = system.run_command("summary", Value::from(vec![1.0, 3.0])).unwrap();
        assert!(matches!(summary, Value::Map(ref fields) if fields["mean"] == Value::Number(2.0)));
    }

    #[test]
    fn test_sandboxed_operation_surfaces_security_errors() {
        let sandbox = Sandbox::new(SecurityLevel::Production, CapabilityManager::default()).with_event_logging(false);
        let mut system = PluginSystem::new(PluginRegistry::new(), sandbox);
        let mut manifest = PluginManifest::new("sneaky", "1.0.0");
        manifest.script = Some("eval(\"1\")".into());
        system
            .registry_mut()
            .register("sneaky", Arc::new(ScriptPlugin::new(manifest)), RegisterOptions::default())
            .unwrap();

        assert_eq!(system.load("sneaky"), LoadOutcome::Loaded);
        assert_eq!(system.validation_report("sneaky").unwrap().risk, RiskLevel::High);
        let err = system.run_operation("sneaky", Value::Nil).unwrap_err();
        assert!(matches!(err, Error::Sandbox(SandboxError::Security(_))));
    }

    fn script_plugin(name: &str, script: &str) -> Arc<dyn Plugin> {
        let mut manifest = PluginManifest::new(name, "1.0.0");
        manifest.script = Some(script.into());
        Arc::new(ScriptPlugin::new(manifest))
    }

    #[test]
    fn test_critical_script_is_disabled_before_attach() {
        let mut system = PluginSystem::default();
        system
            .registry_mut()
            .register("shell", script_plugin("shell", "exec(\"ls\")"), RegisterOptions::default())
            .unwrap();

        assert!(matches!(system.load("shell"), LoadOutcome::Disabled { .. }));
        assert_eq!(system.errors().errors()[0].kind, ErrorKind::Validation);
        assert!(system.operation_names().is_empty());
        assert!(system.validation_report("shell").is_none());
    }

    #[test]
    fn test_declared_checksum_must_match_script() {
        let mut system = PluginSystem::default();
        let mut tampered = PluginManifest::new("tampered", "1.0.0");
        tampered.script = Some("sum(data)".into());
        tampered.checksum = Some("deadbeef".into());
        let mut intact = tampered.clone();
        intact.name = "intact".into();
        intact.checksum = Some(validator::checksum("sum(data)"));
        for manifest in [tampered, intact] {
            let name = manifest.name.clone();
            system
                .registry_mut()
                .register(&name, Arc::new(ScriptPlugin::new(manifest)), RegisterOptions::default())
                .unwrap();
        }

        match system.load("tampered") {
            LoadOutcome::Disabled { reason } => assert!(reason.contains("integrity"), "{}", reason),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(system.load("intact"), LoadOutcome::Loaded);
        assert_eq!(
            system.validation_report("intact").unwrap().checksum,
            validator::checksum("sum(data)")
        );
    }

    #[test]
    fn test_discovered_manifest_cannot_claim_trusted_author() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("impostor_plugin.toml"),
            "version = \"1.0.0\"\nauthor = \"Statistics Core Team\"\nscript = \"sum(data)\"\n",
        )
        .unwrap();

        let mut config = HostConfig::default();
        config.plugins.directories = vec![dir.path().to_path_buf()];
        config.security.trusted_authors = vec!["Statistics Core Team".into()];
        config.security.log_violations = false;
        let mut system = PluginSystem::from_config(&config).unwrap();

        let mut manifest = PluginManifest::new("vetted", "1.0.0");
        manifest.author = "Statistics Core Team".into();
        system
            .registry_mut()
            .register(
                "vetted",
                Arc::new(TestPlugin {
                    manifest,
                    counts_attach: false,
                }),
                RegisterOptions::default(),
            )
            .unwrap();

        assert_eq!(system.load("impostor"), LoadOutcome::Loaded);
        assert_eq!(system.load("vetted"), LoadOutcome::Loaded);
        assert!(!system.sandbox().capabilities().is_trusted("impostor"));
        assert!(system.sandbox().capabilities().is_trusted("vetted"));
    }

    #[test]
    fn test_plugin_config_overrides() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("echo_plugin.toml"), "version = \"1.0.0\"\nscript = \"data\"\n").unwrap();
        std::fs::write(
            dir.path().join("range_plugin.toml"),
            "version = \"1.0.0\"\nscript = \"max(data) - min(data)\"\n",
        )
        .unwrap();

        let mut config = HostConfig::default();
        config.plugins.directories = vec![dir.path().to_path_buf()];
        config.plugins.enabled = vec!["echo".into(), "range".into()];
        config.security.log_violations = false;
        config.plugin_config.insert(
            "range".into(),
            PluginOverrides {
                enabled: false,
                ..PluginOverrides::default()
            },
        );
        config.plugin_config.insert(
            "echo".into(),
            PluginOverrides {
                limits: Some(ResourceLimits {
                    output_size: 4,
                    ..ResourceLimits::default()
                }),
                ..PluginOverrides::default()
            },
        );

        let mut system = PluginSystem::from_config(&config).unwrap();
        assert_eq!(system.load_enabled(&config), 1);
        assert!(!system.is_loaded("range"));
        let err = system
            .run_operation("echo", Value::from(vec![1.0, 2.0, 3.0]))
            .unwrap_err();
        assert!(matches!(err, Error::Sandbox(SandboxError::Resource(_))), "{:?}", err);
    }

    #[test]
    fn test_similar_names_are_reported() {
        let mut system = system_with(&[("stats_plot", &[]), ("stats_plots", &[]), ("regression", &[])]);
        assert!(system.load("stats_plot").is_success());
        assert!(system.load("stats_plots").is_success());

        let conflicts = system.naming_conflicts();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].plugins, ["stats_plot".to_string(), "stats_plots".to_string()]);
    }

    fn command_plugin(name: &str, origin: PluginOrigin) -> Arc<dyn Plugin> {
        Arc::new(TestPlugin {
            manifest: PluginManifest::new(name, "1.0.0")
                .with_origin(origin)
                .with_command("summary", format!("{}_double", name)),
            counts_attach: false,
        })
    }

    fn conflicted_system() -> PluginSystem {
        let mut system = PluginSystem::default();
        system
            .registry_mut()
            .register("core_sum", command_plugin("core_sum", PluginOrigin::Core), RegisterOptions::default())
            .unwrap();
        system
            .registry_mut()
            .register("my_sum", command_plugin("my_sum", PluginOrigin::Local), RegisterOptions::default())
            .unwrap();
        assert!(system.load("core_sum").is_success());
        assert!(system.load("my_sum").is_success());
        system
    }

    #[test]
    fn test_conflicting_commands_keep_higher_priority_owner() {
        let mut system = conflicted_system();
        assert_eq!(system.conflicts().len(), 1);
        assert_eq!(system.run_command("summary", Value::Number(2.0)).unwrap(), Value::Number(4.0));
        assert_eq!(system.commands().owner("summary").unwrap().plugin, "core_sum");
    }

    #[test]
    fn test_namespace_resolution() {
        let mut system = conflicted_system();
        let resolution = system.resolve_conflicts("my_sum", ConflictStrategy::Namespace).unwrap();
        assert_eq!(
            resolution,
            ConflictResolution::Namespaced {
                commands: vec!["lo_my_sum:summary".into()]
            }
        );
        assert!(system.conflicts().is_empty());
        assert_eq!(system.run_command("lo_my_sum:summary", Value::Number(1.0)).unwrap(), Value::Number(2.0));
        assert_eq!(
            system.resolve_conflicts("my_sum", ConflictStrategy::Namespace).unwrap(),
            ConflictResolution::NoConflicts
        );
    }

    #[test]
    fn test_disable_resolution_disables_lower_priority_claimants() {
        let mut system = conflicted_system();
        let resolution = system.resolve_conflicts("core_sum", ConflictStrategy::Disable).unwrap();
        assert_eq!(
            resolution,
            ConflictResolution::Disabled {
                plugins: vec!["my_sum".into()]
            }
        );
        assert_eq!(system.registry().get("my_sum").unwrap().state, PluginState::Disabled);
        assert!(system.resolve_conflicts("ghost", ConflictStrategy::Disable).is_err());

        let report = system.health_report();
        assert_eq!(report.status.disabled, vec!["my_sum".to_string()]);
        assert!(report.conflicts.is_empty());
    }
}
