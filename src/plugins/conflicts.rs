//! Command table shared by loaded plugins, with conflict tracking.

use crate::plugins::priority::{PluginOrigin, PluginPriority, Ranked};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// How a command conflict gets settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    Interactive,
    Namespace,
    Priority,
    Disable,
}

impl ConflictStrategy {
    pub const ALL: [ConflictStrategy; 4] = [
        ConflictStrategy::Interactive,
        ConflictStrategy::Namespace,
        ConflictStrategy::Priority,
        ConflictStrategy::Disable,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConflictStrategy::Interactive => "interactive",
            ConflictStrategy::Namespace => "namespace",
            ConflictStrategy::Priority => "priority",
            ConflictStrategy::Disable => "disable",
        }
    }

    pub fn valid_names() -> String {
        Self::ALL.map(Self::as_str).join(", ")
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| format!("Invalid strategy '{}'. Valid strategies: {}", s, Self::valid_names()))
    }
}

/// Qualified name for `name`: origin prefix plus the sanitised, lower-cased name
pub fn namespace_for(name: &str, origin: &PluginOrigin) -> String {
    let sanitized: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}_{}", origin.namespace_prefix(), sanitized)
}

/// Names at least this similar are reported as naming conflicts
pub const SIMILARITY_THRESHOLD: f64 = 0.7;

fn levenshtein(a: &[char], b: &[char]) -> usize {
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.iter().enumerate() {
        let mut current = vec![i + 1; b.len() + 1];
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        previous = current;
    }
    previous[b.len()]
}

/// Similarity of two names in `0.0..=1.0`, from their edit distance
pub fn name_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let longest = a.len().max(b.len());
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    (longest - levenshtein(&a, &b)) as f64 / longest as f64
}

/// Two plugins whose names are close enough to be confused
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamingConflict {
    pub plugins: [String; 2],
    pub similarity: f64,
    pub recommended: ConflictStrategy,
}

/// Pairwise name comparison over `plugins`, in input order
pub fn detect_naming_conflicts(plugins: &[(String, PluginOrigin)]) -> Vec<NamingConflict> {
    let mut conflicts = Vec::new();
    for (i, (name_a, origin_a)) in plugins.iter().enumerate() {
        for (name_b, origin_b) in &plugins[i + 1..] {
            let similarity = name_similarity(name_a, name_b);
            if similarity <= SIMILARITY_THRESHOLD {
                continue;
            }
            let recommended = if similarity > 0.8 || origin_a == origin_b {
                ConflictStrategy::Namespace
            } else {
                ConflictStrategy::Priority
            };
            conflicts.push(NamingConflict {
                plugins: [name_a.clone(), name_b.clone()],
                similarity,
                recommended,
            });
        }
    }
    conflicts
}

/// One plugin's claim on a command name
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandClaim {
    pub plugin: String,
    pub origin: PluginOrigin,
    pub operation: String,
}

impl Ranked for CommandClaim {
    fn origin(&self) -> &PluginOrigin {
        &self.origin
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandConflict {
    pub command: String,
    /// Claimants in claim order
    pub claimants: Vec<String>,
    pub owner: String,
}

#[derive(Debug, Clone, Default)]
pub struct CommandTable {
    owners: BTreeMap<String, CommandClaim>,
    claims: BTreeMap<String, Vec<CommandClaim>>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `claim` on `command`. Returns true when the claimant now owns it.
    ///
    /// A taken command only changes hands when the new claimant strictly
    /// outranks the current owner.
    pub fn claim(&mut self, command: &str, claim: CommandClaim, priority: &PluginPriority) -> bool {
        let claims = self.claims.entry(command.to_string()).or_default();
        claims.retain(|existing| existing.plugin != claim.plugin);
        claims.push(claim.clone());

        match self.owners.get(command) {
            Some(owner) if owner.plugin != claim.plugin => {
                if priority.can_override(&claim, owner) {
                    tracing::info!(
                        "Command '{}' taken over by {} from {}",
                        command,
                        claim.plugin,
                        owner.plugin
                    );
                    self.owners.insert(command.to_string(), claim);
                    true
                } else {
                    tracing::warn!(
                        "Command '{}' from {} conflicts with {}",
                        command,
                        claim.plugin,
                        owner.plugin
                    );
                    false
                }
            }
            _ => {
                self.owners.insert(command.to_string(), claim);
                true
            }
        }
    }

    pub fn owner(&self, command: &str) -> Option<&CommandClaim> {
        self.owners.get(command)
    }

    pub fn commands(&self) -> impl Iterator<Item = (&String, &CommandClaim)> {
        self.owners.iter()
    }

    pub fn claimants(&self, command: &str) -> &[CommandClaim] {
        self.claims.get(command).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn conflicts(&self) -> Vec<CommandConflict> {
        self.claims
            .iter()
            .filter(|(_, claims)| claims.len() > 1)
            .map(|(command, claims)| CommandConflict {
                command: command.clone(),
                claimants: claims.iter().map(|c| c.plugin.clone()).collect(),
                owner: self
                    .owners
                    .get(command)
                    .map(|owner| owner.plugin.clone())
                    .unwrap_or_default(),
            })
            .collect()
    }

    pub fn conflicts_for(&self, plugin: &str) -> Vec<CommandConflict> {
        self.conflicts()
            .into_iter()
            .filter(|conflict| conflict.claimants.iter().any(|c| c == plugin))
            .collect()
    }

    /// Give a contested command to its highest-tier claimant; ties keep claim order
    pub fn prioritize(&mut self, command: &str, priority: &PluginPriority) -> Option<String> {
        let winner = priority
            .sort_by_priority(self.claimants(command))
            .into_iter()
            .next()?;
        let plugin = winner.plugin.clone();
        self.owners.insert(command.to_string(), winner);
        Some(plugin)
    }

    /// Move `plugin`'s contested commands under `namespace:command`.
    ///
    /// Returns the new qualified command names.
    pub fn namespace(&mut self, plugin: &str, namespace: &str, priority: &PluginPriority) -> Vec<String> {
        let mut renamed = Vec::new();
        for conflict in self.conflicts_for(plugin) {
            let Some(claim) = self
                .claimants(&conflict.command)
                .iter()
                .find(|c| c.plugin == plugin)
                .cloned()
            else {
                continue;
            };

            self.withdraw(&conflict.command, plugin, priority);
            let qualified = format!("{}:{}", namespace, conflict.command);
            self.claim(&qualified, claim, priority);
            renamed.push(qualified);
        }
        renamed
    }

    /// Drop every claim held by `plugin`, handing owned commands to the next claimant
    pub fn release(&mut self, plugin: &str, priority: &PluginPriority) {
        let commands: Vec<String> = self
            .claims
            .iter()
            .filter(|(_, claims)| claims.iter().any(|c| c.plugin == plugin))
            .map(|(command, _)| command.clone())
            .collect();
        for command in commands {
            self.withdraw(&command, plugin, priority);
        }
    }

    fn withdraw(&mut self, command: &str, plugin: &str, priority: &PluginPriority) {
        if let Some(claims) = self.claims.get_mut(command) {
            claims.retain(|c| c.plugin != plugin);
            if claims.is_empty() {
                self.claims.remove(command);
            }
        }
        if self.owners.get(command).is_some_and(|owner| owner.plugin == plugin) {
            self.owners.remove(command);
            self.prioritize(command, priority);
        }
    }
}

/// Human-readable report of similarly named plugins
pub fn naming_report(conflicts: &[NamingConflict]) -> String {
    let mut report = format!("Naming conflicts ({}):\n", conflicts.len());
    for conflict in conflicts {
        report.push_str(&format!(
            "  '{}' ~ '{}' ({:.0}% similar, suggest {})\n",
            conflict.plugins[0],
            conflict.plugins[1],
            conflict.similarity * 100.0,
            conflict.recommended
        ));
    }
    report
}

/// Human-readable conflict report
pub fn conflict_report(conflicts: &[CommandConflict]) -> String {
    if conflicts.is_empty() {
        return "No conflicts detected.".to_string();
    }

    let mut report = String::from("=== Plugin Conflict Report ===\n\n");
    report.push_str(&format!("Command conflicts ({}):\n", conflicts.len()));
    for conflict in conflicts {
        report.push_str(&format!(
            "  '{}' claimed by: {} (active: {})\n",
            conflict.command,
            conflict.claimants.join(", "),
            conflict.owner
        ));
    }
    report.push_str("\nRecommendations:\n");
    report.push_str("  - Consider using namespaced commands for command conflicts\n");
    report.push_str("  - Use `resolve <plugin> --strategy=priority` to keep the highest-priority plugin\n");
    report
}
