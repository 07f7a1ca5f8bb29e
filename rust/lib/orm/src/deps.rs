//! Module manifests and dependency ordering.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::OrmError;

/// Identity and dependencies of a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleManifest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ModuleManifest {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: None,
            description: None,
            depends_on: Vec::new(),
        }
    }

    pub fn depends(mut self, modules: &[&str]) -> Self {
        self.depends_on = modules.iter().map(|m| m.to_string()).collect();
        self
    }
}

/// Module name → direct dependencies, in discovery order.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    deps: IndexMap<String, Vec<String>>,
}

impl DependencyGraph {
    pub fn from_manifests<'a>(manifests: impl IntoIterator<Item = &'a ModuleManifest>) -> Self {
        let deps = manifests
            .into_iter()
            .map(|m| (m.name.clone(), m.depends_on.clone()))
            .collect();
        Self { deps }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.deps.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.deps.keys().map(String::as_str)
    }

    pub fn dependencies(&self, name: &str) -> &[String] {
        self.deps.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    /// Every module of the graph, dependencies first.
    pub fn sort(&self) -> Result<Vec<String>, OrmError> {
        let names: Vec<&str> = self.names().collect();
        topological_sort(&names, |name| self.dependencies(name).to_vec())
    }
}

/// Order `names` so that every name comes after its transitive dependencies.
///
/// Depth-first, visiting `names` in input order, so ties keep that order.
/// Re-entering a name that is still being visited is a
/// [`OrmError::CircularDependency`] carrying the cycle path.
pub fn topological_sort<S, F>(names: &[S], get_deps: F) -> Result<Vec<String>, OrmError>
where
    S: AsRef<str>,
    F: Fn(&str) -> Vec<String>,
{
    let mut sorted = Vec::new();
    let mut done = HashSet::new();
    let mut path = Vec::new();
    for name in names {
        visit(name.as_ref(), &get_deps, &mut done, &mut path, &mut sorted)?;
    }
    Ok(sorted)
}

fn visit<F>(
    name: &str,
    get_deps: &F,
    done: &mut HashSet<String>,
    path: &mut Vec<String>,
    sorted: &mut Vec<String>,
) -> Result<(), OrmError>
where
    F: Fn(&str) -> Vec<String>,
{
    if done.contains(name) {
        return Ok(());
    }
    if let Some(start) = path.iter().position(|n| n == name) {
        let mut cycle = path[start..].to_vec();
        cycle.push(name.to_string());
        return Err(OrmError::CircularDependency {
            module: name.to_string(),
            cycle,
        });
    }

    path.push(name.to_string());
    for dep in get_deps(name) {
        visit(&dep, get_deps, done, path, sorted)?;
    }
    path.pop();

    done.insert(name.to_string());
    sorted.push(name.to_string());
    Ok(())
}

/// Outcome of [`check_dependencies`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyCheck {
    pub valid: bool,
    /// Unsatisfied modules, in discovery order.
    pub missing: Vec<String>,
}

/// Check that every transitive dependency of `name` is installed or
/// available as a manifest.
pub fn check_dependencies(
    name: &str,
    manifests: &[ModuleManifest],
    installed: &HashSet<String>,
) -> DependencyCheck {
    let available: HashMap<&str, &ModuleManifest> =
        manifests.iter().map(|m| (m.name.as_str(), m)).collect();

    let mut missing = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut pending = vec![name];
    while let Some(current) = pending.pop() {
        if !seen.insert(current) || installed.contains(current) {
            continue;
        }
        match available.get(current) {
            Some(manifest) => {
                pending.extend(manifest.depends_on.iter().rev().map(String::as_str));
            }
            None => missing.push(current.to_string()),
        }
    }

    DependencyCheck {
        valid: missing.is_empty(),
        missing,
    }
}
