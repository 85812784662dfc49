//! Dependency version constraints.
//!
//! Constraints are written the way plugin authors know them from gem-style
//! manifests (`~> 1.2`, `>= 2.0`, `= 1.0.0`) and are translated into a
//! [`semver::VersionReq`] for matching.

use semver::{Version, VersionReq};
use std::fmt;
use std::str::FromStr;

/// Parse a version, zero-padding a missing minor or patch part
pub fn parse_version(raw: &str) -> Option<Version> {
    let raw = raw.trim();
    if let Ok(version) = Version::parse(raw) {
        return Some(version);
    }

    let parts: Vec<u64> = raw
        .split('.')
        .map(|part| part.parse::<u64>().ok())
        .collect::<Option<_>>()?;
    match parts.as_slice() {
        [major] => Some(Version::new(*major, 0, 0)),
        [major, minor] => Some(Version::new(*major, *minor, 0)),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConstraint {
    raw: String,
    requirement: VersionReq,
}

impl VersionConstraint {
    pub fn any() -> Self {
        Self {
            raw: "*".to_string(),
            requirement: VersionReq::STAR,
        }
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.requirement.matches(version)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

fn translate(clause: &str) -> Result<String, String> {
    let clause: String = clause.chars().filter(|c| !c.is_whitespace()).collect();
    if clause.is_empty() || clause == "*" {
        return Ok("*".to_string());
    }

    let (op, rest) = ["~>", ">=", "<=", "==", ">", "<", "="]
        .iter()
        .find_map(|op| clause.strip_prefix(op).map(|rest| (*op, rest)))
        .unwrap_or(("=", clause.as_str()));

    let version = parse_version(rest).ok_or_else(|| format!("invalid version '{}'", rest))?;

    Ok(match op {
        "~>" => {
            let upper = if rest.split('.').count() >= 3 {
                version.minor.checked_add(1).map(|minor| Version::new(version.major, minor, 0))
            } else {
                version.major.checked_add(1).map(|major| Version::new(major, 0, 0))
            }
            .ok_or_else(|| format!("invalid version '{}': no upper bound for ~>", rest))?;
            format!(">={}, <{}", version, upper)
        }
        "==" | "=" => format!("={}", version),
        other => format!("{}{}", other, version),
    })
}

impl FromStr for VersionConstraint {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let clauses = raw
            .split(',')
            .map(translate)
            .collect::<Result<Vec<_>, _>>()?;
        let requirement = VersionReq::parse(&clauses.join(", "))
            .map_err(|e| format!("invalid version constraint '{}': {}", raw.trim(), e))?;
        Ok(Self {
            raw: raw.trim().to_string(),
            requirement,
        })
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn v(raw: &str) -> Version {
        parse_version(raw).unwrap()
    }

    #[test]
    fn test_parse_version_pads_missing_parts() {
        assert_eq!(v("2"), Version::new(2, 0, 0));
        assert_eq!(v("1.4"), Version::new(1, 4, 0));
        assert_eq!(v("1.4.2"), Version::new(1, 4, 2));
        assert!(parse_version("one.two").is_none());
    }

    #[rstest]
    #[case("*", "0.0.1", true)]
    #[case("1.2.0", "1.2.0", true)]
    #[case("1.2.0", "1.2.1", false)]
    #[case("== 1.2", "1.2.0", true)]
    #[case(">= 1.0", "2.5.0", true)]
    #[case("> 1.0", "1.0.0", false)]
    #[case("< 2.0", "1.9.9", true)]
    #[case("<= 2.0", "2.0.1", false)]
    #[case("~> 1.2", "1.9.0", true)]
    #[case("~> 1.2", "2.0.0", false)]
    #[case("~> 1.2.3", "1.2.9", true)]
    #[case("~> 1.2.3", "1.3.0", false)]
    #[case(">= 1.0, < 1.5", "1.4.0", true)]
    #[case(">= 1.0, < 1.5", "1.5.0", false)]
    fn test_constraint_matching(#[case] constraint: &str, #[case] version: &str, #[case] expected: bool) {
        let constraint: VersionConstraint = constraint.parse().unwrap();
        assert_eq!(constraint.matches(&v(version)), expected);
    }

    #[rstest]
    #[case("~> banana")]
    #[case("~> 18446744073709551615.0")]
    #[case("~> 1.18446744073709551615.0")]
    fn test_invalid_constraint_is_rejected(#[case] constraint: &str) {
        assert!(constraint.parse::<VersionConstraint>().is_err());
    }
}
