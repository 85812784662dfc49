//! Dependency-first load ordering.

use crate::error::ResolveError;
use crate::plugins::registry::PluginRegistry;
use std::collections::HashSet;

pub struct DependencyResolver<'a> {
    registry: &'a PluginRegistry,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(registry: &'a PluginRegistry) -> Self {
        Self { registry }
    }

    /// Load order for `id`: every transitive dependency first, `id` last.
    ///
    /// With `check_versions`, each versioned dependency must be satisfied by
    /// the version that is registered (or discovered) for it.
    pub fn resolve(&self, id: &str, check_versions: bool) -> Result<Vec<String>, ResolveError> {
        if !self.registry.knows(id) {
            return Err(ResolveError::UnknownPlugin(id.to_string()));
        }

        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        self.visit(id, &mut path, &mut visited, &mut order)?;

        if check_versions {
            self.check_versions(&order)?;
        }
        Ok(order)
    }

    /// Union of the load orders of several plugins, each dependency once
    pub fn resolve_multiple<S: AsRef<str>>(
        &self,
        ids: &[S],
        check_versions: bool,
    ) -> Result<Vec<String>, ResolveError> {
        let mut combined: Vec<String> = Vec::new();
        let mut seen = HashSet::new();

        for id in ids {
            for plugin in self.resolve(id.as_ref(), check_versions)? {
                if seen.insert(plugin.clone()) {
                    combined.push(plugin);
                }
            }
        }
        Ok(combined)
    }

    /// Direct dependencies of `id` that are neither registered nor discovered
    pub fn missing_dependencies(&self, id: &str) -> Vec<String> {
        self.registry
            .dependencies_of(id)
            .unwrap_or_default()
            .into_iter()
            .map(|dep| dep.name)
            .filter(|name| !self.registry.knows(name))
            .collect()
    }

    pub fn dependencies_satisfied(&self, id: &str) -> bool {
        self.resolve(id, true).is_ok()
    }

    fn visit(
        &self,
        id: &str,
        path: &mut Vec<String>,
        visited: &mut HashSet<String>,
        order: &mut Vec<String>,
    ) -> Result<(), ResolveError> {
        if let Some(start) = path.iter().position(|node| node == id) {
            let mut cycle = path[start..].to_vec();
            cycle.push(id.to_string());
            return Err(ResolveError::CircularDependency { cycle });
        }
        if visited.contains(id) {
            return Ok(());
        }

        let missing = self.missing_dependencies(id);
        if !missing.is_empty() {
            return Err(ResolveError::UnresolvedDependency {
                plugin: id.to_string(),
                missing,
            });
        }

        path.push(id.to_string());
        for dep in self.registry.dependencies_of(id).unwrap_or_default() {
            self.visit(&dep.name, path, visited, order)?;
        }
        path.pop();

        visited.insert(id.to_string());
        order.push(id.to_string());
        Ok(())
    }

    fn check_versions(&self, order: &[String]) -> Result<(), ResolveError> {
        for plugin in order {
            for dep in self.registry.dependencies_of(plugin).unwrap_or_default() {
                let Some(constraint) = dep.constraint else {
                    continue;
                };
                let available = self.registry.version_of(&dep.name);
                if !available.as_ref().is_some_and(|v| constraint.matches(v)) {
                    return Err(ResolveError::VersionConflict {
                        plugin: plugin.clone(),
                        dependency: dep.name,
                        required: constraint.to_string(),
                        available: available.map_or_else(|| "unknown".to_string(), |v| v.to_string()),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::descriptor::{Plugin, PluginManifest};
    use crate::plugins::registry::RegisterOptions;
    use pretty_assertions::assert_eq;
    use std::any::Any;
    use std::sync::Arc;

    struct Stub(PluginManifest);

    impl Plugin for Stub {
        fn manifest(&self) -> &PluginManifest {
            &self.0
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn registry_with(plugins: &[(&str, &str, &[&str])]) -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        for (name, version, deps) in plugins {
            let manifest = PluginManifest::new(*name, *version).with_dependencies(deps.iter().copied());
            registry
                .register(name, Arc::new(Stub(manifest)), RegisterOptions::default())
                .unwrap();
        }
        registry
    }

    #[test]
    fn test_chain_resolves_dependencies_first() {
        let registry = registry_with(&[("A", "1.0.0", &["B"]), ("B", "1.0.0", &["C"]), ("C", "1.0.0", &[])]);
        let order = DependencyResolver::new(&registry).resolve("A", true).unwrap();
        assert_eq!(order, vec!["C", "B", "A"]);
    }

    #[test]
    fn test_three_node_cycle_is_reported() {
        let registry = registry_with(&[("A", "1.0.0", &["B"]), ("B", "1.0.0", &["C"]), ("C", "1.0.0", &["A"])]);
        let err = DependencyResolver::new(&registry).resolve("A", false).unwrap_err();
        assert_eq!(
            err,
            ResolveError::CircularDependency {
                cycle: vec!["A".into(), "B".into(), "C".into(), "A".into()]
            }
        );
        assert_eq!(err.to_string(), "Circular dependency detected: A -> B -> C -> A");
    }

    #[test]
    fn test_missing_dependency_is_unresolved() {
        let registry = registry_with(&[("X", "1.0.0", &["Y", "Z"])]);
        let resolver = DependencyResolver::new(&registry);
        assert_eq!(
            resolver.resolve("X", true).unwrap_err(),
            ResolveError::UnresolvedDependency {
                plugin: "X".into(),
                missing: vec!["Y".into(), "Z".into()]
            }
        );
        assert_eq!(resolver.missing_dependencies("X"), vec!["Y", "Z"]);
        assert!(!resolver.dependencies_satisfied("X"));
        assert_eq!(
            resolver.resolve("nope", true).unwrap_err(),
            ResolveError::UnknownPlugin("nope".into())
        );
    }

    #[test]
    fn test_version_conflict_only_when_checking() {
        let registry = registry_with(&[("app", "1.0.0", &["lib ~> 2.0"]), ("lib", "1.4.0", &[])]);
        let resolver = DependencyResolver::new(&registry);

        assert_eq!(resolver.resolve("app", false).unwrap(), vec!["lib", "app"]);
        let err = resolver.resolve("app", true).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Version conflict: 'app' requires lib ~> 2.0, but 1.4.0 is available"
        );
    }

    #[test]
    fn test_resolve_multiple_unions_closures() {
        let registry = registry_with(&[
            ("report", "1.0.0", &["stats", "charts"]),
            ("charts", "1.0.0", &["stats"]),
            ("stats", "1.0.0", &[]),
            ("export", "1.0.0", &["charts"]),
        ]);
        let order = DependencyResolver::new(&registry)
            .resolve_multiple(&["export", "report"], true)
            .unwrap();
        assert_eq!(order, vec!["stats", "charts", "export", "report"]);
    }

    #[test]
    fn test_shared_dependency_is_not_a_cycle() {
        let registry = registry_with(&[
            ("top", "1.0.0", &["left", "right"]),
            ("left", "1.0.0", &["base"]),
            ("right", "1.0.0", &["base"]),
            ("base", "1.0.0", &[]),
        ]);
        let order = DependencyResolver::new(&registry).resolve("top", true).unwrap();
        assert_eq!(order, vec!["base", "left", "right", "top"]);
    }
}
