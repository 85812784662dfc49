//! Health and status report for the plugin system.

use crate::plugins::conflicts::CommandConflict;
use crate::plugins::descriptor::{ExtensionPoint, PluginState};
use crate::plugins::error_handler::ErrorStatistics;
use crate::plugins::priority::PluginOrigin;
use crate::plugins::registry::RegistryStatus;
use crate::sandbox::capability::{RiskLevel, SecurityStats, Severity};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginHealth {
    pub id: String,
    pub version: String,
    pub origin: PluginOrigin,
    pub priority: i32,
    pub extension_point: ExtensionPoint,
    pub state: PluginState,
    pub errors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub total_plugins: usize,
    pub loaded_plugins: usize,
    pub status: RegistryStatus,
    pub plugins: Vec<PluginHealth>,
    pub errors: ErrorStatistics,
    pub security: SecurityStats,
    pub method_violations: usize,
    pub conflicts: Vec<CommandConflict>,
    pub recommendations: Vec<String>,
}

impl HealthReport {
    pub fn new(
        status: RegistryStatus,
        plugins: Vec<PluginHealth>,
        errors: ErrorStatistics,
        security: SecurityStats,
        method_violations: usize,
        conflicts: Vec<CommandConflict>,
    ) -> Self {
        let mut report = Self {
            generated_at: Utc::now(),
            total_plugins: status.total,
            loaded_plugins: status.loaded,
            status,
            plugins,
            errors,
            security,
            method_violations,
            conflicts,
            recommendations: Vec::new(),
        };
        report.recommendations = recommendations(&report);
        report
    }

    pub fn is_healthy(&self) -> bool {
        self.recommendations.is_empty()
    }
}

fn recommendations(report: &HealthReport) -> Vec<String> {
    let mut out = Vec::new();

    if let Some(count) = report.security.grants_by_risk.get(&RiskLevel::Critical).filter(|c| **c > 0) {
        out.push(format!(
            "{} critical-risk capability grant(s) active; review external command access",
            count
        ));
    }
    if let Some(count) = report.security.grants_by_risk.get(&RiskLevel::High).filter(|c| **c > 0) {
        out.push(format!(
            "{} high-risk capability grant(s) active; restrict network hosts where possible",
            count
        ));
    }
    if let Some(count) = report
        .security
        .violations_by_severity
        .get(&Severity::High)
        .filter(|c| **c > 0)
    {
        out.push(format!(
            "{} high-severity capability violation(s) recorded; audit the offending plugins",
            count
        ));
    }
    if report.method_violations > 0 {
        out.push(format!(
            "{} blocked method call(s) in sandboxed code; check plugin scripts for forbidden operations",
            report.method_violations
        ));
    }
    for plugin in &report.status.disabled {
        out.push(format!(
            "Plugin '{}' is disabled; fix its errors and re-enable it",
            plugin
        ));
    }
    if !report.conflicts.is_empty() {
        out.push("Consider using namespaced commands for command conflicts".to_string());
    }

    out
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Plugin System Health")?;
        writeln!(f, "====================")?;
        writeln!(f, "Generated: {}", self.generated_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
        writeln!(f, "Plugins: {} total, {} loaded", self.total_plugins, self.loaded_plugins)?;

        if !self.plugins.is_empty() {
            writeln!(f)?;
            for plugin in &self.plugins {
                writeln!(
                    f,
                    "  {:<24} v{:<8} {:<12} {:<18} {}{}",
                    plugin.id,
                    plugin.version,
                    plugin.origin,
                    plugin.extension_point,
                    plugin.state,
                    if plugin.errors > 0 {
                        format!(" ({} errors)", plugin.errors)
                    } else {
                        String::new()
                    }
                )?;
            }
        }
        if !self.status.discovered_not_registered.is_empty() {
            writeln!(
                f,
                "\nDiscovered, not registered: {}",
                self.status.discovered_not_registered.join(", ")
            )?;
        }

        writeln!(f, "\nSecurity")?;
        writeln!(f, "  Trusted plugins: {}", self.security.trusted_plugins)?;
        writeln!(f, "  Granted capabilities: {}", self.security.total_granted_capabilities)?;
        for (risk, count) in &self.security.grants_by_risk {
            writeln!(f, "    {}: {}", risk, count)?;
        }
        writeln!(f, "  Capability violations: {}", self.security.violations)?;
        for (kind, count) in &self.security.violations_by_kind {
            writeln!(f, "    {:?}: {}", kind, count)?;
        }
        writeln!(f, "  Method gate violations: {}", self.method_violations)?;

        if self.errors.total_errors > 0 {
            writeln!(f)?;
            write!(f, "{}", self.errors)?;
        }

        if !self.conflicts.is_empty() {
            writeln!(f, "\nCommand conflicts: {}", self.conflicts.len())?;
            for conflict in &self.conflicts {
                writeln!(f, "  '{}': {}", conflict.command, conflict.claimants.join(", "))?;
            }
        }

        if !self.recommendations.is_empty() {
            writeln!(f, "\nRecommendations:")?;
            for recommendation in &self.recommendations {
                writeln!(f, "  - {}", recommendation)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_clean_report_has_no_recommendations() {
        let report = HealthReport::new(
            RegistryStatus::default(),
            Vec::new(),
            ErrorStatistics::default(),
            SecurityStats::default(),
            0,
            Vec::new(),
        );
        assert!(report.is_healthy());
        assert!(report.to_string().contains("Plugins: 0 total, 0 loaded"));
    }

    #[test]
    fn test_risky_findings_produce_recommendations() {
        let security = SecurityStats {
            grants_by_risk: BTreeMap::from([(RiskLevel::Critical, 1)]),
            violations_by_severity: BTreeMap::from([(Severity::High, 2)]),
            ..SecurityStats::default()
        };
        let status = RegistryStatus {
            total: 1,
            disabled: vec!["broken".into()],
            ..RegistryStatus::default()
        };
        let report = HealthReport::new(status, Vec::new(), ErrorStatistics::default(), security, 3, Vec::new());

        assert_eq!(report.recommendations.len(), 4);
        assert!(report.recommendations[0].contains("critical-risk"));
        assert!(report.recommendations.iter().any(|r| r.contains("'broken' is disabled")));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["security"]["grants_by_risk"]["critical"], 1);
    }
}
