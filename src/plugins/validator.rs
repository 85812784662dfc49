//! Static checks on plugin scripts before they are attached.
//!
//! A script is hashed, compared against the checksum its manifest
//! declares, then scanned for deny-listed calls and obfuscation. The
//! overall risk is the highest risk of any issue found.

use crate::error::ValidationError;
use crate::sandbox::method_gate::{ForbiddenKind, MethodGate};
use crate::sandbox::RiskLevel;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Scripts above this size get a warning
pub const LARGE_SCRIPT_BYTES: usize = 1_048_576;

const BASE64_LIMIT: usize = 3;
const CONCATENATION_LIMIT: usize = 10;

static STRING_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""(?:[^"\\]|\\.)*"|'(?:[^'\\]|\\.)*'"#).expect("valid regex"));
static COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"#[^\n]*").expect("valid regex"));
static CALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*)\s*\(").expect("valid regex"));
static BASE64: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"["'][A-Za-z0-9+/]{20,}={0,2}["']"#).expect("valid regex"));
static CONCATENATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"["'][^"']*["']\s*\+\s*["'][^"']*["']"#).expect("valid regex"));

fn risk_of(kind: ForbiddenKind) -> RiskLevel {
    match kind {
        ForbiddenKind::CommandExecution | ForbiddenKind::ProcessControl => RiskLevel::Critical,
        ForbiddenKind::CodeEvaluation
        | ForbiddenKind::Filesystem
        | ForbiddenKind::Network
        | ForbiddenKind::CodeLoading
        | ForbiddenKind::GlobalMutation => RiskLevel::High,
        ForbiddenKind::DynamicDispatch => RiskLevel::Medium,
        ForbiddenKind::RawOutput => RiskLevel::Low,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    pub risk: RiskLevel,
    pub description: String,
    pub occurrences: usize,
}

/// Outcome of scanning one script
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub plugin: String,
    pub risk: RiskLevel,
    pub issues: Vec<ValidationIssue>,
    pub warnings: Vec<String>,
    /// Hex sha256 of the script
    pub checksum: String,
    pub size: usize,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Hex sha256 of `script`
pub fn checksum(script: &str) -> String {
    hex::encode(Sha256::digest(script.as_bytes()))
}

/// Compare `script` against a declared checksum, returning the actual one
pub fn verify_integrity(
    plugin: &str,
    script: &str,
    expected: Option<&str>,
) -> Result<String, ValidationError> {
    let actual = checksum(script);
    match expected {
        Some(expected) if !expected.trim().eq_ignore_ascii_case(&actual) => {
            Err(ValidationError::Integrity {
                plugin: plugin.to_string(),
                expected: expected.trim().to_string(),
                actual,
            })
        }
        _ => Ok(actual),
    }
}

/// Scan `script` for deny-listed calls and obfuscation
pub fn scan(plugin: &str, script: &str) -> ValidationReport {
    let without_strings = STRING_LITERAL.replace_all(script, "\"\"");
    let code = COMMENT.replace_all(&without_strings, "");

    let mut calls: BTreeMap<&str, (ForbiddenKind, usize)> = BTreeMap::new();
    for captures in CALL.captures_iter(&code) {
        let Some(name) = captures.get(1).map(|m| m.as_str()) else {
            continue;
        };
        if let Some(kind) = MethodGate::forbidden_kind(name) {
            calls.entry(name).or_insert((kind, 0)).1 += 1;
        }
    }

    let mut issues: Vec<ValidationIssue> = calls
        .into_iter()
        .map(|(name, (kind, occurrences))| ValidationIssue {
            risk: risk_of(kind),
            description: format!("call to '{}' ({:?})", name, kind),
            occurrences,
        })
        .collect();

    let base64 = BASE64.find_iter(script).count();
    if base64 > BASE64_LIMIT {
        issues.push(ValidationIssue {
            risk: RiskLevel::Medium,
            description: "possible obfuscation: multiple base64 strings".to_string(),
            occurrences: base64,
        });
    }
    let concatenations = CONCATENATION.find_iter(script).count();
    if concatenations > CONCATENATION_LIMIT {
        issues.push(ValidationIssue {
            risk: RiskLevel::Low,
            description: "possible obfuscation: excessive string concatenation".to_string(),
            occurrences: concatenations,
        });
    }
    issues.sort_by(|a, b| b.risk.cmp(&a.risk));

    let mut warnings = Vec::new();
    if script.len() > LARGE_SCRIPT_BYTES {
        warnings.push(format!(
            "Large plugin script ({} bytes), consider splitting it",
            script.len()
        ));
    }

    let risk = issues.iter().map(|issue| issue.risk).max().unwrap_or(RiskLevel::Low);
    debug!(plugin, %risk, issues = issues.len(), "Scanned plugin script");
    ValidationReport {
        plugin: plugin.to_string(),
        risk,
        issues,
        warnings,
        checksum: checksum(script),
        size: script.len(),
    }
}

/// Integrity check then scan; critical findings reject the script
pub fn validate_script(
    plugin: &str,
    script: &str,
    expected_checksum: Option<&str>,
) -> Result<ValidationReport, ValidationError> {
    verify_integrity(plugin, script, expected_checksum)?;
    let report = scan(plugin, script);
    if report.risk == RiskLevel::Critical {
        return Err(ValidationError::Rejected {
            plugin: plugin.to_string(),
            risk: report.risk,
            issues: report
                .issues
                .iter()
                .filter(|issue| issue.risk == RiskLevel::Critical)
                .map(|issue| issue.description.clone())
                .collect(),
        });
    }
    Ok(report)
}

/// An author is trusted only when named and on the list
pub fn is_trusted_author(author: &str, trusted: &BTreeSet<String>) -> bool {
    let author = author.trim();
    !author.is_empty() && trusted.contains(author)
}
