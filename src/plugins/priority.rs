//! Origin-based priority tiers used to settle plugin collisions.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Where a plugin comes from
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PluginOrigin {
    Development,
    Core,
    Official,
    ThirdParty,
    Local,
    /// Any other origin name; tier 0 unless a custom tier is set
    Custom(String),
}

impl PluginOrigin {
    pub const BUILT_IN: [PluginOrigin; 5] = [
        PluginOrigin::Development,
        PluginOrigin::Core,
        PluginOrigin::Official,
        PluginOrigin::ThirdParty,
        PluginOrigin::Local,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            PluginOrigin::Development => "development",
            PluginOrigin::Core => "core",
            PluginOrigin::Official => "official",
            PluginOrigin::ThirdParty => "third_party",
            PluginOrigin::Local => "local",
            PluginOrigin::Custom(name) => name,
        }
    }

    fn default_tier(&self) -> i32 {
        match self {
            PluginOrigin::Development => 100,
            PluginOrigin::Core => 90,
            PluginOrigin::Official => 70,
            PluginOrigin::ThirdParty => 50,
            PluginOrigin::Local => 30,
            PluginOrigin::Custom(_) => 0,
        }
    }

    /// Two-letter prefix used when namespacing a plugin's names
    pub fn namespace_prefix(&self) -> &'static str {
        match self {
            PluginOrigin::Development => "de",
            PluginOrigin::Core => "co",
            PluginOrigin::Official => "of",
            PluginOrigin::ThirdParty => "th",
            PluginOrigin::Local => "lo",
            PluginOrigin::Custom(_) => "xx",
        }
    }

    /// Origin declared by a manifest, or guessed from the plugin id
    pub fn detect(id: &str, declared: Option<&PluginOrigin>) -> PluginOrigin {
        match declared {
            Some(origin) => origin.clone(),
            None if id.to_lowercase().contains("core") => PluginOrigin::Core,
            None => PluginOrigin::Local,
        }
    }
}

impl From<String> for PluginOrigin {
    fn from(name: String) -> Self {
        match name.as_str() {
            "development" => PluginOrigin::Development,
            "core" | "core_plugins" => PluginOrigin::Core,
            "official" | "official_gems" => PluginOrigin::Official,
            "third_party" | "third_party_gems" => PluginOrigin::ThirdParty,
            "local" | "local_plugins" => PluginOrigin::Local,
            _ => PluginOrigin::Custom(name),
        }
    }
}

impl From<&str> for PluginOrigin {
    fn from(name: &str) -> Self {
        PluginOrigin::from(name.to_string())
    }
}

impl From<PluginOrigin> for String {
    fn from(origin: PluginOrigin) -> Self {
        origin.as_str().to_string()
    }
}

impl fmt::Display for PluginOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Anything with an origin can be ranked
pub trait Ranked {
    fn origin(&self) -> &PluginOrigin;
}

impl Ranked for PluginOrigin {
    fn origin(&self) -> &PluginOrigin {
        self
    }
}

/// Tier table: built-in defaults plus custom overrides
#[derive(Debug, Clone, Default)]
pub struct PluginPriority {
    custom: HashMap<PluginOrigin, i32>,
}

impl PluginPriority {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tier(&self, origin: &PluginOrigin) -> i32 {
        self.custom
            .get(origin)
            .copied()
            .unwrap_or_else(|| origin.default_tier())
    }

    pub fn set(&mut self, origin: impl Into<PluginOrigin>, tier: i32) {
        self.custom.insert(origin.into(), tier);
    }

    pub fn reset_custom(&mut self) {
        self.custom.clear();
    }

    /// True only when `new` ranks strictly above `existing`
    pub fn can_override<A: Ranked + ?Sized, B: Ranked + ?Sized>(&self, new: &A, existing: &B) -> bool {
        self.tier(new.origin()) > self.tier(existing.origin())
    }

    /// Highest tier first; equal tiers keep their input order
    pub fn sort_by_priority<T: Ranked + Clone>(&self, items: &[T]) -> Vec<T> {
        let mut sorted = items.to_vec();
        sorted.sort_by_key(|item| std::cmp::Reverse(self.tier(item.origin())));
        sorted
    }

    /// Every known origin with its effective tier
    pub fn all_priorities(&self) -> BTreeMap<String, i32> {
        PluginOrigin::BUILT_IN
            .iter()
            .chain(self.custom.keys())
            .map(|origin| (origin.to_string(), self.tier(origin)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case(PluginOrigin::Development, 100)]
    #[case(PluginOrigin::Core, 90)]
    #[case(PluginOrigin::Official, 70)]
    #[case(PluginOrigin::ThirdParty, 50)]
    #[case(PluginOrigin::Local, 30)]
    #[case(PluginOrigin::Custom("mystery".into()), 0)]
    fn test_default_tiers(#[case] origin: PluginOrigin, #[case] tier: i32) {
        assert_eq!(PluginPriority::new().tier(&origin), tier);
    }

    #[test]
    fn test_override_is_strict() {
        let priority = PluginPriority::new();
        assert!(priority.can_override(&PluginOrigin::Development, &PluginOrigin::Core));
        assert!(!priority.can_override(&PluginOrigin::Local, &PluginOrigin::Core));
        assert!(!priority.can_override(&PluginOrigin::Core, &PluginOrigin::Core));
    }

    #[test]
    fn test_sort_by_priority() {
        let priority = PluginPriority::new();
        let input = vec![
            PluginOrigin::Local,
            PluginOrigin::Core,
            PluginOrigin::Official,
            PluginOrigin::ThirdParty,
            PluginOrigin::Development,
        ];
        assert_eq!(
            priority.sort_by_priority(&input),
            vec![
                PluginOrigin::Development,
                PluginOrigin::Core,
                PluginOrigin::Official,
                PluginOrigin::ThirdParty,
                PluginOrigin::Local,
            ]
        );
    }

    #[test]
    fn test_equal_custom_tiers_keep_input_order() {
        let mut priority = PluginPriority::new();
        priority.set("alpha", 60);
        priority.set("beta", 60);
        let input: Vec<PluginOrigin> = vec!["beta".into(), PluginOrigin::Local, "alpha".into()];
        assert_eq!(
            priority.sort_by_priority(&input),
            vec![PluginOrigin::from("beta"), PluginOrigin::from("alpha"), PluginOrigin::Local]
        );
        assert!(!priority.can_override(&PluginOrigin::from("alpha"), &PluginOrigin::from("beta")));
    }

    #[test]
    fn test_reset_custom_restores_defaults() {
        let mut priority = PluginPriority::new();
        priority.set(PluginOrigin::Local, 95);
        assert!(priority.can_override(&PluginOrigin::Local, &PluginOrigin::Core));
        priority.reset_custom();
        assert_eq!(priority.tier(&PluginOrigin::Local), 30);
    }

    #[test]
    fn test_origin_detection() {
        assert_eq!(PluginOrigin::detect("CoreStats", None), PluginOrigin::Core);
        assert_eq!(PluginOrigin::detect("my_plugin", None), PluginOrigin::Local);
        assert_eq!(
            PluginOrigin::detect("core_like", Some(&PluginOrigin::ThirdParty)),
            PluginOrigin::ThirdParty
        );
    }

    #[test]
    fn test_origin_names_round_trip_through_serde() {
        let origin: PluginOrigin = serde_json::from_str("\"third_party\"").unwrap();
        assert_eq!(origin, PluginOrigin::ThirdParty);
        assert_eq!(serde_json::to_string(&PluginOrigin::from("vendor")).unwrap(), "\"vendor\"");
    }
}
