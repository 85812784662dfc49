//! Capability-based access control for sandboxed plugins.
//!
//! The catalog of capabilities is fixed per manager; the only runtime state
//! is the per-plugin grant sets, the grant/revoke request log and the
//! violation log.

use crate::error::SandboxError;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Risk tier of a capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        };
        write!(f, "{name}")
    }
}

/// Concrete resources a capability may touch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceRule {
    Unrestricted,
    Paths { allowed: Vec<String>, blocked: Vec<String> },
    Hosts { allowed: Vec<String>, blocked: Vec<String> },
    Commands { allowed: Vec<String>, blocked: Vec<String> },
    Info { allowed: Vec<String> },
}

/// A named permission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub id: String,
    pub description: String,
    pub risk_level: RiskLevel,
    pub auto_grant: bool,
    pub requires_approval: bool,
    pub resources: ResourceRule,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

static DEFAULT_CATALOG: Lazy<BTreeMap<String, Capability>> = Lazy::new(|| {
    let blocked_fs = &["/etc", "/usr", "/bin", "/sbin", "~/.ssh", "~/.aws"];
    let catalog = vec![
        Capability {
            id: "read_data".into(),
            description: "Read the input data handed to the plugin".into(),
            risk_level: RiskLevel::Low,
            auto_grant: true,
            requires_approval: false,
            resources: ResourceRule::Unrestricted,
        },
        Capability {
            id: "write_output".into(),
            description: "Emit analysis results".into(),
            risk_level: RiskLevel::Low,
            auto_grant: true,
            requires_approval: false,
            resources: ResourceRule::Unrestricted,
        },
        Capability {
            id: "file_read".into(),
            description: "Read data from the file system".into(),
            risk_level: RiskLevel::Medium,
            auto_grant: false,
            requires_approval: true,
            resources: ResourceRule::Paths {
                allowed: strings(&["./data", "./input", "./tmp", "/tmp/plugin_sandbox"]),
                blocked: strings(blocked_fs),
            },
        },
        Capability {
            id: "file_write".into(),
            description: "Write data to the file system".into(),
            risk_level: RiskLevel::Medium,
            auto_grant: false,
            requires_approval: true,
            resources: ResourceRule::Paths {
                allowed: strings(&["./output", "./tmp", "/tmp/plugin_sandbox"]),
                blocked: strings(blocked_fs),
            },
        },
        Capability {
            id: "network_access".into(),
            description: "Access external network services (APIs and the like)".into(),
            risk_level: RiskLevel::High,
            auto_grant: false,
            requires_approval: true,
            resources: ResourceRule::Hosts {
                allowed: strings(&["api.example.com", "data.government.gov", "api.census.gov"]),
                blocked: strings(&[
                    "*.suspicious-domain.com",
                    "*.malware.com",
                    "localhost",
                    "127.0.0.1",
                ]),
            },
        },
        Capability {
            id: "external_command".into(),
            description: "Run external commands".into(),
            risk_level: RiskLevel::Critical,
            auto_grant: false,
            requires_approval: true,
            resources: ResourceRule::Commands {
                allowed: strings(&["R", "python3", "julia", "octave"]),
                blocked: strings(&[
                    "rm", "mv", "cp", "chmod", "sudo", "su", "bash", "sh", "curl", "wget",
                ]),
            },
        },
        Capability {
            id: "system_info".into(),
            description: "Query host system information".into(),
            risk_level: RiskLevel::Medium,
            auto_grant: false,
            requires_approval: true,
            resources: ResourceRule::Info {
                allowed: strings(&["cpu_count", "memory_total", "runtime_version", "platform"]),
            },
        },
    ];
    catalog.into_iter().map(|c| (c.id.clone(), c)).collect()
});

/// Why a capability check was recorded as a violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    UnknownCapability,
    CapabilityDenied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub timestamp: DateTime<Utc>,
    pub plugin: String,
    pub kind: ViolationKind,
    pub severity: Severity,
    pub details: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantAction {
    Grant,
    Revoke,
}

/// Entry in the grant/revoke request log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRequest {
    pub timestamp: DateTime<Utc>,
    pub plugin: String,
    pub action: GrantAction,
    pub capability: String,
    pub risk_level: RiskLevel,
}

/// Catalog entry as shown to users
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySummary {
    pub name: String,
    pub description: String,
    pub risk_level: RiskLevel,
    pub requires_approval: bool,
    pub auto_grant: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityStats {
    pub trusted_plugins: usize,
    pub total_granted_capabilities: usize,
    pub capability_requests: usize,
    pub violations: usize,
    pub plugins_with_capabilities: usize,
    pub grants_by_risk: BTreeMap<RiskLevel, usize>,
    pub violations_by_kind: BTreeMap<ViolationKind, usize>,
    pub violations_by_severity: BTreeMap<Severity, usize>,
}

/// Grants, revokes and verifies capabilities per plugin
#[derive(Debug, Clone)]
pub struct CapabilityManager {
    catalog: BTreeMap<String, Capability>,
    trusted: BTreeSet<String>,
    grants: HashMap<String, BTreeSet<String>>,
    requests: Vec<CapabilityRequest>,
    violations: Vec<ViolationRecord>,
}

impl Default for CapabilityManager {
    fn default() -> Self {
        Self::new(Vec::<String>::new())
    }
}

impl CapabilityManager {
    pub fn new<I, S>(trusted_plugins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            catalog: DEFAULT_CATALOG.clone(),
            trusted: trusted_plugins.into_iter().map(Into::into).collect(),
            grants: HashMap::new(),
            requests: Vec::new(),
            violations: Vec::new(),
        }
    }

    /// Loosen a capability so it is granted without approval.
    ///
    /// Returns false when the capability is not in the catalog.
    pub fn allow_without_approval(&mut self, capability: &str) -> bool {
        match self.catalog.get_mut(capability) {
            Some(cap) => {
                cap.auto_grant = true;
                cap.requires_approval = false;
                true
            }
            None => false,
        }
    }

    pub fn add_trusted(&mut self, plugin: impl Into<String>) {
        self.trusted.insert(plugin.into());
    }

    pub fn is_trusted(&self, plugin: &str) -> bool {
        self.trusted.contains(plugin)
    }

    /// Verify that `plugin` may use every requested capability.
    ///
    /// Unknown capabilities and ungranted approval-required capabilities
    /// raise. An ungranted capability that does not require approval is
    /// denied silently: a violation is logged and `Ok(false)` is returned.
    pub fn verify<S: AsRef<str>>(
        &mut self,
        plugin: &str,
        requested: &[S],
    ) -> Result<bool, SandboxError> {
        for capability in requested {
            let capability = capability.as_ref();
            if !self.catalog.contains_key(capability) {
                self.log_violation(plugin, ViolationKind::UnknownCapability, capability);
                return Err(SandboxError::Capability(format!(
                    "Unknown capability requested: {capability}"
                )));
            }
        }

        if self.is_trusted(plugin) {
            for capability in requested {
                self.grant(plugin, capability.as_ref())?;
            }
            return Ok(true);
        }

        let mut all_granted = true;
        for capability in requested {
            let capability = capability.as_ref();
            let Some(config) = self.catalog.get(capability).cloned() else {
                continue;
            };

            if config.auto_grant {
                if !self.is_granted(plugin, capability) {
                    self.grant(plugin, capability)?;
                }
                continue;
            }

            if self.is_granted(plugin, capability) {
                continue;
            }

            self.log_violation(plugin, ViolationKind::CapabilityDenied, capability);

            if config.requires_approval {
                return Err(SandboxError::Capability(format!(
                    "Capability '{}' ({} risk) requires explicit approval. Description: {}",
                    capability, config.risk_level, config.description
                )));
            }
            all_granted = false;
        }

        Ok(all_granted)
    }

    pub fn grant(&mut self, plugin: &str, capability: &str) -> Result<(), SandboxError> {
        let risk_level = self
            .catalog
            .get(capability)
            .map(|c| c.risk_level)
            .ok_or_else(|| SandboxError::Capability(format!("Unknown capability: {capability}")))?;

        self.grants
            .entry(plugin.to_string())
            .or_default()
            .insert(capability.to_string());
        self.requests.push(CapabilityRequest {
            timestamp: Utc::now(),
            plugin: plugin.to_string(),
            action: GrantAction::Grant,
            capability: capability.to_string(),
            risk_level,
        });
        debug!(plugin, capability, "capability granted");
        Ok(())
    }

    pub fn grant_all<S: AsRef<str>>(&mut self, plugin: &str, capabilities: &[S]) -> Result<(), SandboxError> {
        for capability in capabilities {
            self.grant(plugin, capability.as_ref())?;
        }
        Ok(())
    }

    pub fn revoke(&mut self, plugin: &str, capability: &str) {
        let removed = self
            .grants
            .get_mut(plugin)
            .map(|set| set.remove(capability))
            .unwrap_or(false);
        if let Some(cap) = self.catalog.get(capability) {
            self.requests.push(CapabilityRequest {
                timestamp: Utc::now(),
                plugin: plugin.to_string(),
                action: GrantAction::Revoke,
                capability: capability.to_string(),
                risk_level: cap.risk_level,
            });
        }
        debug!(plugin, capability, removed, "capability revoked");
    }

    pub fn is_granted(&self, plugin: &str, capability: &str) -> bool {
        self.is_trusted(plugin)
            || self
                .grants
                .get(plugin)
                .is_some_and(|set| set.contains(capability))
    }

    /// Capabilities held by `plugin`; trusted plugins hold the whole catalog
    pub fn plugin_capabilities(&self, plugin: &str) -> Vec<String> {
        if self.is_trusted(plugin) {
            return self.catalog.keys().cloned().collect();
        }
        self.grants
            .get(plugin)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn capability(&self, id: &str) -> Option<&Capability> {
        self.catalog.get(id)
    }

    pub fn list_capabilities(&self, risk_level: Option<RiskLevel>) -> Vec<CapabilitySummary> {
        self.catalog
            .values()
            .filter(|c| risk_level.map_or(true, |r| c.risk_level == r))
            .map(|c| CapabilitySummary {
                name: c.id.clone(),
                description: c.description.clone(),
                risk_level: c.risk_level,
                requires_approval: c.requires_approval,
                auto_grant: c.auto_grant,
            })
            .collect()
    }

    /// Check a concrete resource (path, host or command) against a granted capability.
    ///
    /// Block-list matches win over allow-list matches; an empty allow-list
    /// restricts nothing beyond the block-list.
    /// Host code reaches this through [`crate::sandbox::Sandbox::authorize_resource`].
    pub fn validate_resource_access(&self, plugin: &str, capability: &str, resource: &str) -> bool {
        let Some(config) = self.catalog.get(capability) else {
            return false;
        };
        if !self.is_granted(plugin, capability) {
            return false;
        }

        match &config.resources {
            ResourceRule::Unrestricted => true,
            ResourceRule::Paths { allowed, blocked } => path_allowed(resource, allowed, blocked),
            ResourceRule::Hosts { allowed, blocked } => {
                if host_matches_any(resource, blocked) {
                    return false;
                }
                allowed.is_empty() || host_matches_any(resource, allowed)
            }
            ResourceRule::Commands { allowed, blocked } => {
                let command = resource.split_whitespace().next().unwrap_or_default();
                if blocked.iter().any(|b| b == command) {
                    return false;
                }
                allowed.is_empty() || allowed.iter().any(|a| a == command)
            }
            ResourceRule::Info { allowed } => allowed.is_empty() || allowed.iter().any(|a| a == resource),
        }
    }

    pub fn security_stats(&self) -> SecurityStats {
        let mut grants_by_risk = BTreeMap::new();
        for capability in self.grants.values().flatten() {
            if let Some(cap) = self.catalog.get(capability) {
                *grants_by_risk.entry(cap.risk_level).or_insert(0) += 1;
            }
        }
        let mut violations_by_kind = BTreeMap::new();
        let mut violations_by_severity = BTreeMap::new();
        for violation in &self.violations {
            *violations_by_kind.entry(violation.kind).or_insert(0) += 1;
            *violations_by_severity.entry(violation.severity).or_insert(0) += 1;
        }

        SecurityStats {
            trusted_plugins: self.trusted.len(),
            total_granted_capabilities: self.grants.values().map(BTreeSet::len).sum(),
            capability_requests: self.requests.len(),
            violations: self.violations.len(),
            plugins_with_capabilities: self.grants.values().filter(|s| !s.is_empty()).count(),
            grants_by_risk,
            violations_by_kind,
            violations_by_severity,
        }
    }

    /// The most recent `limit` violations, oldest first
    pub fn violation_log(&self, limit: usize) -> &[ViolationRecord] {
        let start = self.violations.len().saturating_sub(limit);
        &self.violations[start..]
    }

    pub fn request_log(&self) -> &[CapabilityRequest] {
        &self.requests
    }

    fn log_violation(&mut self, plugin: &str, kind: ViolationKind, capability: &str) {
        let severity = match kind {
            ViolationKind::UnknownCapability => Severity::Medium,
            ViolationKind::CapabilityDenied => match self.catalog.get(capability).map(|c| c.risk_level) {
                Some(RiskLevel::Critical) => Severity::High,
                Some(RiskLevel::High) => Severity::Medium,
                _ => Severity::Low,
            },
        };
        warn!(plugin, capability, ?kind, ?severity, "capability violation");
        self.violations.push(ViolationRecord {
            timestamp: Utc::now(),
            plugin: plugin.to_string(),
            kind,
            severity,
            details: capability.to_string(),
        });
    }
}

/// Expand `~`, anchor relative paths at the working directory and fold `.`/`..`
pub(crate) fn expand_path(path: &str) -> PathBuf {
    let raw = if path == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"))
    } else if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/"))
            .join(rest)
    } else {
        PathBuf::from(path)
    };

    let absolute = if raw.is_absolute() {
        raw
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(raw)
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

fn path_allowed(resource: &str, allowed: &[String], blocked: &[String]) -> bool {
    let target = expand_path(resource);
    let under = |prefix: &String| target.starts_with(Path::new(&expand_path(prefix)));

    if blocked.iter().any(under) {
        return false;
    }
    allowed.is_empty() || allowed.iter().any(under)
}

fn host_matches_any(host: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| {
        if pattern.contains('*') {
            let anchored = format!(
                "^{}$",
                pattern
                    .split('*')
                    .map(regex::escape)
                    .collect::<Vec<_>>()
                    .join(".*")
            );
            Regex::new(&anchored).is_ok_and(|re| re.is_match(host))
        } else {
            host == pattern
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_grant_never_raises() {
        let mut manager = CapabilityManager::default();
        assert!(manager.verify("p", &["read_data", "write_output"]).unwrap());
        assert!(manager.verify("p", &["read_data"]).unwrap());
        assert_eq!(manager.plugin_capabilities("p"), vec!["read_data", "write_output"]);
    }

    #[test]
    fn test_approval_required_until_granted() {
        let mut manager = CapabilityManager::default();
        let err = manager.verify("p", &["file_read"]).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("file_read"));
        assert!(message.contains("medium risk"));

        manager.grant("p", "file_read").unwrap();
        assert!(manager.verify("p", &["file_read"]).unwrap());
    }

    #[test]
    fn test_unknown_capability_is_logged_and_raised() {
        let mut manager = CapabilityManager::default();
        let err = manager.verify("p", &["teleport"]).unwrap_err();
        assert!(err.to_string().contains("Unknown capability requested: teleport"));
        let log = manager.violation_log(10);
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].kind, ViolationKind::UnknownCapability);
        assert_eq!(log[0].severity, Severity::Medium);
    }

    #[test]
    fn test_trusted_plugin_holds_full_catalog() {
        let mut manager = CapabilityManager::new(["core"]);
        assert!(manager.verify("core", &["external_command", "network_access"]).unwrap());
        let all = manager.plugin_capabilities("core");
        assert_eq!(all.len(), manager.list_capabilities(None).len());
        assert!(manager.is_granted("core", "file_write"));
    }

    #[test]
    fn test_denied_critical_capability_is_high_severity() {
        let mut manager = CapabilityManager::default();
        assert!(manager.verify("p", &["external_command"]).is_err());
        assert_eq!(manager.violation_log(1)[0].severity, Severity::High);
        let stats = manager.security_stats();
        assert_eq!(stats.violations, 1);
        assert_eq!(stats.violations_by_kind[&ViolationKind::CapabilityDenied], 1);
    }

    #[test]
    fn test_allow_override_removes_approval() {
        let mut manager = CapabilityManager::default();
        assert!(manager.allow_without_approval("network_access"));
        assert!(manager.verify("p", &["network_access"]).unwrap());
        assert!(!manager.allow_without_approval("nonexistent"));
    }

    #[test]
    fn test_revoke_removes_grant() {
        let mut manager = CapabilityManager::default();
        manager.grant("p", "file_read").unwrap();
        manager.revoke("p", "file_read");
        assert!(!manager.is_granted("p", "file_read"));
        assert_eq!(manager.request_log().len(), 2);
        assert_eq!(manager.request_log()[1].action, GrantAction::Revoke);
    }

    #[test]
    fn test_file_access_block_list_wins() {
        let mut manager = CapabilityManager::default();
        manager.grant("p", "file_read").unwrap();
        assert!(manager.validate_resource_access("p", "file_read", "/tmp/plugin_sandbox/in.csv"));
        assert!(manager.validate_resource_access("p", "file_read", "./data/values.csv"));
        assert!(!manager.validate_resource_access("p", "file_read", "/etc/passwd"));
        assert!(!manager.validate_resource_access("p", "file_read", "./data/../../etc/passwd"));
        assert!(!manager.validate_resource_access("p", "file_read", "/var/log/syslog"));
    }

    #[test]
    fn test_resource_access_requires_grant() {
        let manager = CapabilityManager::default();
        assert!(!manager.validate_resource_access("p", "file_read", "./data/x.csv"));
        assert!(!manager.validate_resource_access("p", "bogus", "./data/x.csv"));
    }

    #[test]
    fn test_host_globs_are_anchored() {
        let mut manager = CapabilityManager::default();
        manager.grant("p", "network_access").unwrap();
        assert!(manager.validate_resource_access("p", "network_access", "api.census.gov"));
        assert!(!manager.validate_resource_access("p", "network_access", "evil.malware.com"));
        assert!(!manager.validate_resource_access("p", "network_access", "localhost"));
        assert!(!manager.validate_resource_access("p", "network_access", "api.census.gov.evil.org"));
    }

    #[test]
    fn test_command_access_is_exact() {
        let mut manager = CapabilityManager::default();
        manager.grant("p", "external_command").unwrap();
        assert!(manager.validate_resource_access("p", "external_command", "python3 analyze.py"));
        assert!(!manager.validate_resource_access("p", "external_command", "rm -rf /"));
        assert!(!manager.validate_resource_access("p", "external_command", "python"));
    }

    #[test]
    fn test_list_capabilities_by_risk() {
        let manager = CapabilityManager::default();
        let low = manager.list_capabilities(Some(RiskLevel::Low));
        assert_eq!(low.len(), 2);
        assert!(low.iter().all(|c| c.auto_grant));
        let critical = manager.list_capabilities(Some(RiskLevel::Critical));
        assert_eq!(critical[0].name, "external_command");
    }
}
