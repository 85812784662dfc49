//! Sandboxed execution of plugin scripts.
//!
//! [`Sandbox::execute`] is the only path untrusted plugin code runs
//! through: syntax validation, capability verification, then evaluation
//! under the [`ResourceMonitor`] with every operation classified by the
//! [`MethodGate`].

pub mod capability;
mod dispatch;
pub mod method_gate;
pub mod resource_monitor;
pub mod script;
pub mod stats;
pub mod value;

pub use capability::{CapabilityManager, RiskLevel};
pub use method_gate::{Classification, MethodGate, Posture};
pub use resource_monitor::{ResourceLimits, ResourceMonitor, ResourceUsage};
pub use value::Value;

use crate::error::SandboxError;
use script::Interpreter;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use tracing::{error, info, warn};

/// How strictly plugin code is confined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    /// No gate, monitor or capability checks; for local plugin iteration
    Development,
    Test,
    #[default]
    Production,
}

impl SecurityLevel {
    /// Gate posture for this level, `None` when unsandboxed
    pub fn posture(self) -> Option<Posture> {
        match self {
            SecurityLevel::Development => None,
            SecurityLevel::Test => Some(Posture::Standard),
            SecurityLevel::Production => Some(Posture::Minimal),
        }
    }

    pub fn is_sandboxed(self) -> bool {
        self != SecurityLevel::Development
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SecurityLevel::Development => "development",
            SecurityLevel::Test => "test",
            SecurityLevel::Production => "production",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for SecurityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "development" => Ok(SecurityLevel::Development),
            "test" => Ok(SecurityLevel::Test),
            "production" => Ok(SecurityLevel::Production),
            other => Err(format!("unknown security level '{other}'")),
        }
    }
}

/// Successful result of one execution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub value: Value,
    /// Text written with `print`/`puts`/`warn`
    pub output: String,
    pub usage: ResourceUsage,
}

#[derive(Serialize)]
struct ScriptOutcome {
    value: Value,
    output: String,
}

#[derive(Debug)]
pub struct Sandbox {
    level: SecurityLevel,
    capabilities: CapabilityManager,
    gate: Option<MethodGate>,
    monitor: ResourceMonitor,
    limits: ResourceLimits,
    log_events: bool,
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new(SecurityLevel::default(), CapabilityManager::default())
    }
}

impl Sandbox {
    pub fn new(level: SecurityLevel, capabilities: CapabilityManager) -> Self {
        Self {
            level,
            capabilities,
            gate: level.posture().map(MethodGate::new),
            monitor: ResourceMonitor::default(),
            limits: ResourceLimits::default(),
            log_events: true,
        }
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_monitor(mut self, monitor: ResourceMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_event_logging(mut self, enabled: bool) -> Self {
        self.log_events = enabled;
        self
    }

    pub fn security_level(&self) -> SecurityLevel {
        self.level
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn capabilities(&self) -> &CapabilityManager {
        &self.capabilities
    }

    pub fn capabilities_mut(&mut self) -> &mut CapabilityManager {
        &mut self.capabilities
    }

    pub fn gate(&self) -> Option<&MethodGate> {
        self.gate.as_ref()
    }

    /// Method gate violations across every execution so far
    pub fn violation_count(&self) -> usize {
        self.gate.as_ref().map_or(0, MethodGate::violation_count)
    }

    /// Authorize host-side access to `resource` on behalf of `plugin_id`.
    ///
    /// Host code that reads files, contacts hosts or runs commands for a
    /// plugin calls this first. Unsandboxed levels allow everything.
    pub fn authorize_resource(&self, plugin_id: &str, capability: &str, resource: &str) -> Result<(), SandboxError> {
        if !self.level.is_sandboxed() || self.capabilities.validate_resource_access(plugin_id, capability, resource) {
            return Ok(());
        }
        if self.log_events {
            warn!(
                event = "RESOURCE_DENIED",
                plugin = plugin_id,
                capability,
                resource,
                "resource access denied"
            );
        }
        Err(SandboxError::Capability(format!(
            "Plugin '{plugin_id}' may not access '{resource}' through {capability}"
        )))
    }

    /// Check that `code` parses, without running it
    pub fn validate(&self, code: &str) -> Result<(), SandboxError> {
        script::parse(code).map(|_| ())
    }

    pub fn execute<S: AsRef<str>>(
        &mut self,
        code: &str,
        plugin_id: &str,
        capabilities: &[S],
    ) -> Result<ExecutionResult, SandboxError> {
        self.execute_with(code, plugin_id, capabilities, Value::Nil, None)
    }

    /// Execute `code` for `plugin_id` with `data` bound to the `data` variable.
    ///
    /// `limits` replaces the sandbox defaults for this call only.
    pub fn execute_with<S: AsRef<str>>(
        &mut self,
        code: &str,
        plugin_id: &str,
        capabilities: &[S],
        data: Value,
        limits: Option<ResourceLimits>,
    ) -> Result<ExecutionResult, SandboxError> {
        if self.log_events {
            info!(
                event = "PLUGIN_EXECUTION_START",
                plugin = plugin_id,
                level = %self.level,
                "executing plugin code"
            );
        }

        let result = if self.level.is_sandboxed() {
            self.run_sandboxed(code, plugin_id, capabilities, data, limits.unwrap_or(self.limits))
        } else {
            self.run_unsandboxed(code, plugin_id, data)
        };

        match result {
            Ok(execution) => {
                if self.log_events {
                    info!(
                        event = "PLUGIN_EXECUTION_SUCCESS",
                        plugin = plugin_id,
                        elapsed_secs = execution.usage.elapsed_secs,
                        output_bytes = execution.usage.output_bytes,
                        "plugin code finished"
                    );
                }
                Ok(execution)
            }
            Err(err) => {
                let err = Self::attribute(plugin_id, err);
                if self.log_events {
                    error!(
                        event = "PLUGIN_EXECUTION_ERROR",
                        plugin = plugin_id,
                        error = %err,
                        "plugin code failed"
                    );
                }
                Err(err)
            }
        }
    }

    fn run_sandboxed<S: AsRef<str>>(
        &mut self,
        code: &str,
        plugin_id: &str,
        capabilities: &[S],
        data: Value,
        limits: ResourceLimits,
    ) -> Result<ExecutionResult, SandboxError> {
        let script = script::parse(code)?;

        if !self.capabilities.verify(plugin_id, capabilities)? && self.log_events {
            warn!(
                event = "CAPABILITY_DENIED",
                plugin = plugin_id,
                "some requested capabilities were not granted"
            );
        }

        let gate = self.gate.as_ref();
        let monitored = self.monitor.monitor(&limits, |guard| {
            let mut interpreter = Interpreter::new(gate, Some(guard));
            interpreter.bind("data", data);
            let value = interpreter.run(&script)?;
            Ok(ScriptOutcome {
                value,
                output: interpreter.into_output(),
            })
        })?;

        Ok(ExecutionResult {
            value: monitored.value.value,
            output: monitored.value.output,
            usage: monitored.usage,
        })
    }

    fn run_unsandboxed(
        &self,
        code: &str,
        plugin_id: &str,
        data: Value,
    ) -> Result<ExecutionResult, SandboxError> {
        if self.log_events {
            warn!(
                event = "UNSANDBOXED_EXECUTION",
                plugin = plugin_id,
                "running plugin code without sandbox"
            );
        }
        let script = script::parse(code)?;
        let start = Instant::now();
        let mut interpreter = Interpreter::new(None, None);
        interpreter.bind("data", data);
        let value = interpreter.run(&script)?;
        let usage = ResourceUsage {
            elapsed_secs: start.elapsed().as_secs_f64(),
            output_bytes: value.serialized_len(),
            ..ResourceUsage::default()
        };
        Ok(ExecutionResult {
            value,
            output: interpreter.into_output(),
            usage,
        })
    }

    fn attribute(plugin_id: &str, err: SandboxError) -> SandboxError {
        match err {
            SandboxError::Runtime(message) => SandboxError::Execution {
                plugin: plugin_id.to_string(),
                message,
            },
            SandboxError::Security(message) => SandboxError::Security(format!(
                "Security violation in plugin '{plugin_id}': {message}"
            )),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::resource_monitor::TrackedMemoryProbe;
    use std::sync::Arc;

    const NO_CAPS: &[&str] = &[];

    fn sandbox(level: SecurityLevel) -> Sandbox {
        Sandbox::new(level, CapabilityManager::default())
            .with_monitor(ResourceMonitor::with_probe(Arc::new(TrackedMemoryProbe)))
    }

    #[test]
    fn test_production_runs_statistics() {
        let mut sandbox = sandbox(SecurityLevel::Production);
        let result = sandbox
            .execute_with(
                "let m = mean(data); m * 2",
                "doubler",
                &["read_data"],
                Value::from(vec![1.0, 2.0, 3.0]),
                None,
            )
            .unwrap();
        assert_eq!(result.value, Value::Number(4.0));
        assert!(result.usage.output_bytes > 0);
    }

    #[test]
    fn test_syntax_checked_before_capabilities() {
        let mut sandbox = sandbox(SecurityLevel::Production);
        let err = sandbox
            .execute("let = 1", "broken", &["file_write"])
            .unwrap_err();
        assert!(matches!(err, SandboxError::Syntax { .. }));
        assert!(sandbox.capabilities().violation_log(10).is_empty());
    }

    #[test]
    fn test_capability_error_surfaces() {
        let mut sandbox = sandbox(SecurityLevel::Production);
        let err = sandbox.execute("1", "net", &["network_access"]).unwrap_err();
        assert!(matches!(err, SandboxError::Capability(_)));
        assert!(err.to_string().contains("network_access"));
    }

    #[test]
    fn test_trusted_plugin_skips_approval() {
        let mut sandbox = Sandbox::new(
            SecurityLevel::Production,
            CapabilityManager::new(["core_stats"]),
        );
        let result = sandbox.execute("1 + 1", "core_stats", &["external_command"]).unwrap();
        assert_eq!(result.value, Value::Number(2.0));
    }

    #[test]
    fn test_security_violation_names_plugin() {
        let mut sandbox = sandbox(SecurityLevel::Production);
        let err = sandbox.execute("eval('1')", "sneaky", NO_CAPS).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Security violation in plugin 'sneaky': Code evaluation method 'eval' is prohibited in sandbox"
        );
        assert_eq!(sandbox.violation_count(), 1);
    }

    #[test]
    fn test_production_posture_is_minimal() {
        let mut production = sandbox(SecurityLevel::Production);
        assert!(production.execute("upcase('a')", "p", NO_CAPS).is_err());

        let mut test = sandbox(SecurityLevel::Test);
        let result = test.execute("upcase('a')", "p", NO_CAPS).unwrap();
        assert_eq!(result.value, Value::from("A"));
    }

    #[test]
    fn test_runtime_failure_wrapped_as_execution_error() {
        let mut sandbox = sandbox(SecurityLevel::Production);
        let err = sandbox.execute("1 / 0", "divider", NO_CAPS).unwrap_err();
        assert_eq!(
            err,
            SandboxError::Execution {
                plugin: "divider".into(),
                message: "divided by 0".into(),
            }
        );
    }

    #[test]
    fn test_runaway_loop_times_out() {
        let mut sandbox = sandbox(SecurityLevel::Production);
        let limits = ResourceLimits {
            cpu_time: 0.2,
            ..ResourceLimits::default()
        };
        let err = sandbox
            .execute_with(
                "let x = 0; repeat 1000000000000 { x = x + 1; }",
                "spinner",
                NO_CAPS,
                Value::Nil,
                Some(limits),
            )
            .unwrap_err();
        assert!(err.is_timeout(), "{err}");
    }

    #[test]
    fn test_output_limit_applies_to_result() {
        let mut sandbox = sandbox(SecurityLevel::Test).with_limits(ResourceLimits {
            output_size: 50,
            ..ResourceLimits::default()
        });
        let err = sandbox.execute("range(100)", "big", NO_CAPS).unwrap_err();
        assert!(err.to_string().contains("Output size limit exceeded"));
    }

    #[test]
    fn test_stack_depth_limit() {
        let mut sandbox = sandbox(SecurityLevel::Production).with_limits(ResourceLimits {
            stack_depth: 3,
            ..ResourceLimits::default()
        });
        let err = sandbox
            .execute("abs(abs(abs(abs(1))))", "deep", NO_CAPS)
            .unwrap_err();
        assert!(err.to_string().contains("Stack depth limit exceeded"));
    }

    #[test]
    fn test_development_level_is_unsandboxed() {
        let mut sandbox = sandbox(SecurityLevel::Development);
        assert!(sandbox.gate().is_none());
        let result = sandbox
            .execute("puts('debug'); upcase('x')", "dev", &["external_command"])
            .unwrap();
        assert_eq!(result.value, Value::from("X"));
        assert_eq!(result.output, "debug\n");
    }

    #[test]
    fn test_resource_authorization() {
        let mut guarded = sandbox(SecurityLevel::Production).with_event_logging(false);
        assert!(guarded.authorize_resource("reader", "file_read", "./data/in.csv").is_err());

        guarded.capabilities_mut().grant("reader", "file_read").unwrap();
        assert!(guarded.authorize_resource("reader", "file_read", "./data/in.csv").is_ok());
        let err = guarded
            .authorize_resource("reader", "file_read", "/etc/shadow")
            .unwrap_err();
        assert!(matches!(err, SandboxError::Capability(_)));

        let dev = sandbox(SecurityLevel::Development);
        assert!(dev.authorize_resource("reader", "file_read", "/etc/shadow").is_ok());
    }

    #[test]
    fn test_security_level_parsing() {
        assert_eq!("test".parse::<SecurityLevel>(), Ok(SecurityLevel::Test));
        assert!("lenient".parse::<SecurityLevel>().is_err());
    }
}
