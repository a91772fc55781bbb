//! Dependency resolution
//!
//! Builds a fresh dependency graph for one plugin from the installed-plugin
//! snapshot. The graph holds one node per plugin id. Versions are tried
//! highest first and the search backtracks when a later constraint rules a
//! choice out. Cycles are a hard failure and are reported with the full path.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use semver::{Version, VersionReq};
use thiserror::Error;
use tracing::debug;

use crate::manifest::{Dependency, PluginMetadata};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("missing dependency {dependency} ({requirement}) required by {required_by}{}", format_available(.available))]
    MissingDependency {
        dependency: String,
        requirement: VersionReq,
        required_by: String,
        available: Vec<Version>,
    },

    #[error("cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("conflicting requirements on {dependency}: {}", format_requirements(.requirements))]
    Conflict {
        dependency: String,
        requirements: Vec<(String, VersionReq)>,
    },

    #[error("{plugin_id} is not compatible with this host: {reason}")]
    IncompatibleHost { plugin_id: String, reason: String },
}

impl ResolutionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingDependency { .. } => "P200",
            Self::CyclicDependency { .. } => "P201",
            Self::Conflict { .. } => "P202",
            Self::IncompatibleHost { .. } => "P203",
        }
    }
}

fn format_available(available: &[Version]) -> String {
    if available.is_empty() {
        return String::new();
    }
    let list: Vec<String> = available.iter().map(Version::to_string).collect();
    format!(" (installed: {})", list.join(", "))
}

fn format_requirements(requirements: &[(String, VersionReq)]) -> String {
    requirements
        .iter()
        .map(|(by, req)| format!("{req} from {by}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// What the host offers to plugins
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub api_level: u32,
    pub app_version: Version,
}

/// One installed version of a plugin, as seen by the resolver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPlugin {
    pub id: String,
    pub version: Version,
    pub dependencies: Vec<Dependency>,
}

/// Read-only snapshot of what is installed
#[derive(Debug, Clone, Default)]
pub struct InstalledIndex {
    plugins: HashMap<String, Vec<InstalledPlugin>>,
}

impl InstalledIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, plugin: InstalledPlugin) {
        let versions = self.plugins.entry(plugin.id.clone()).or_default();
        versions.retain(|p| p.version != plugin.version);
        versions.push(plugin);
        versions.sort_by(|a, b| a.version.cmp(&b.version));
    }

    /// Installed versions of `id`, lowest first
    pub fn versions(&self, id: &str) -> &[InstalledPlugin] {
        self.plugins.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

/// A resolved node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    pub id: String,
    pub version: Version,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    pub from: String,
    pub to: String,
    pub requirement: VersionReq,
}

/// Result of a successful resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyGraph {
    root: String,
    nodes: BTreeMap<String, GraphNode>,
    edges: Vec<DependencyEdge>,
}

impl DependencyGraph {
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values()
    }

    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Direct dependencies of `id`
    pub fn dependencies_of<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.edges
            .iter()
            .filter(move |e| e.from == id)
            .map(|e| e.to.as_str())
    }

    /// Every node, dependencies before their dependents, root last
    pub fn load_order(&self) -> Vec<&GraphNode> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut visited = BTreeSet::new();
        self.post_order(&self.root, &mut visited, &mut order);
        order
    }

    fn post_order<'a>(
        &'a self,
        id: &str,
        visited: &mut BTreeSet<String>,
        order: &mut Vec<&'a GraphNode>,
    ) {
        if !visited.insert(id.to_string()) {
            return;
        }
        for dep in self.dependencies_of(id) {
            self.post_order(dep, visited, order);
        }
        if let Some(node) = self.nodes.get(id) {
            order.push(node);
        }
    }
}

impl fmt::Display for DependencyGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in self.load_order() {
            write!(f, "{}@{}", node.id, node.version)?;
            let deps: Vec<&str> = self.dependencies_of(&node.id).collect();
            if !deps.is_empty() {
                write!(f, " -> {}", deps.join(", "))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

#[derive(Debug, Clone)]
pub struct DependencyResolver {
    host: HostInfo,
}

impl DependencyResolver {
    pub fn new(host: HostInfo) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &HostInfo {
        &self.host
    }

    /// Resolve `metadata` (the plugin `plugin_id`) against `installed`
    ///
    /// Read-only: never installs anything.
    pub fn resolve(
        &self,
        plugin_id: &str,
        metadata: &PluginMetadata,
        installed: &InstalledIndex,
    ) -> Result<DependencyGraph, ResolutionError> {
        self.check_host(plugin_id, metadata)?;

        let root = InstalledPlugin {
            id: plugin_id.to_string(),
            version: metadata.version.clone(),
            dependencies: metadata.dependencies.clone(),
        };

        let mut chosen = BTreeMap::new();
        chosen.insert(root.id.clone(), root);
        search(&mut chosen, installed)?;

        let graph = build_graph(plugin_id, &chosen);
        detect_cycle(&graph)?;
        debug!(
            plugin_id = %plugin_id,
            nodes = graph.len(),
            "Dependencies resolved"
        );
        Ok(graph)
    }

    fn check_host(&self, plugin_id: &str, metadata: &PluginMetadata) -> Result<(), ResolutionError> {
        if self.host.api_level < metadata.min_api_level {
            return Err(ResolutionError::IncompatibleHost {
                plugin_id: plugin_id.to_string(),
                reason: format!(
                    "requires API level {} or newer, host provides {}",
                    metadata.min_api_level, self.host.api_level
                ),
            });
        }
        if let Some(max) = metadata.max_api_level {
            if self.host.api_level > max {
                return Err(ResolutionError::IncompatibleHost {
                    plugin_id: plugin_id.to_string(),
                    reason: format!(
                        "supports API level up to {}, host provides {}",
                        max, self.host.api_level
                    ),
                });
            }
        }
        if let Some(min_host) = &metadata.min_host_version {
            if self.host.app_version < *min_host {
                return Err(ResolutionError::IncompatibleHost {
                    plugin_id: plugin_id.to_string(),
                    reason: format!(
                        "requires host {} or newer, running {}",
                        min_host, self.host.app_version
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Depth-first search over installed versions, highest first
///
/// Constraints are rebuilt from the nodes currently chosen, so dropping a
/// version on backtrack also drops what it required.
fn search(
    chosen: &mut BTreeMap<String, InstalledPlugin>,
    installed: &InstalledIndex,
) -> Result<(), ResolutionError> {
    let constraints = constraints_of(chosen);

    for (id, reqs) in &constraints {
        if let Some(node) = chosen.get(id) {
            if reqs.iter().any(|(_, req)| !req.matches(&node.version)) {
                return Err(ResolutionError::Conflict {
                    dependency: id.clone(),
                    requirements: reqs.clone(),
                });
            }
        }
    }

    let Some((id, reqs)) = constraints.iter().find(|(id, _)| !chosen.contains_key(*id))
    else {
        return Ok(());
    };

    let available = installed.versions(id);
    let candidates: Vec<&InstalledPlugin> = available
        .iter()
        .rev()
        .filter(|p| reqs.iter().all(|(_, req)| req.matches(&p.version)))
        .collect();

    let mut first_error = None;
    for candidate in candidates {
        chosen.insert(id.clone(), candidate.clone());
        match search(chosen, installed) {
            Ok(()) => return Ok(()),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
        chosen.remove(id);
    }

    Err(first_error.unwrap_or_else(|| unsatisfied(id, reqs, available)))
}

/// Every requirement the chosen nodes place on each dependency id
fn constraints_of(
    chosen: &BTreeMap<String, InstalledPlugin>,
) -> BTreeMap<String, Vec<(String, VersionReq)>> {
    let mut constraints: BTreeMap<String, Vec<(String, VersionReq)>> = BTreeMap::new();
    for node in chosen.values() {
        for dep in &node.dependencies {
            constraints
                .entry(dep.id.clone())
                .or_default()
                .push((node.id.clone(), dep.version_req.clone()));
        }
    }
    constraints
}

/// No installed version meets `requirements`: missing if one of them alone
/// matches nothing, a conflict otherwise
fn unsatisfied(
    dependency: &str,
    requirements: &[(String, VersionReq)],
    available: &[InstalledPlugin],
) -> ResolutionError {
    let alone = requirements
        .iter()
        .find(|(_, req)| !available.iter().any(|p| req.matches(&p.version)));

    match alone {
        Some((required_by, requirement)) => ResolutionError::MissingDependency {
            dependency: dependency.to_string(),
            requirement: requirement.clone(),
            required_by: required_by.clone(),
            available: available.iter().map(|p| p.version.clone()).collect(),
        },
        None => ResolutionError::Conflict {
            dependency: dependency.to_string(),
            requirements: requirements.to_vec(),
        },
    }
}

fn build_graph(root: &str, chosen: &BTreeMap<String, InstalledPlugin>) -> DependencyGraph {
    let nodes = chosen
        .values()
        .map(|p| {
            (
                p.id.clone(),
                GraphNode {
                    id: p.id.clone(),
                    version: p.version.clone(),
                },
            )
        })
        .collect();

    let edges = chosen
        .values()
        .flat_map(|p| {
            p.dependencies.iter().map(move |dep| DependencyEdge {
                from: p.id.clone(),
                to: dep.id.clone(),
                requirement: dep.version_req.clone(),
            })
        })
        .collect();

    DependencyGraph {
        root: root.to_string(),
        nodes,
        edges,
    }
}

/// Three-colour DFS over the whole graph; a back edge names the cycle
fn detect_cycle(graph: &DependencyGraph) -> Result<(), ResolutionError> {
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut path: Vec<&str> = Vec::new();

    let mut starts: Vec<&str> = vec![graph.root()];
    starts.extend(graph.nodes.keys().map(String::as_str));

    for start in starts {
        if !marks.contains_key(start) {
            visit(graph, start, &mut marks, &mut path)?;
        }
    }
    Ok(())
}

fn visit<'a>(
    graph: &'a DependencyGraph,
    id: &'a str,
    marks: &mut HashMap<&'a str, Mark>,
    path: &mut Vec<&'a str>,
) -> Result<(), ResolutionError> {
    marks.insert(id, Mark::InProgress);
    path.push(id);

    for next in graph.dependencies_of(id) {
        match marks.get(next) {
            Some(Mark::InProgress) => {
                let start = path.iter().position(|n| *n == next).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(next.to_string());
                return Err(ResolutionError::CyclicDependency { cycle });
            }
            Some(Mark::Done) => {}
            None => visit(graph, next, marks, path)?,
        }
    }

    path.pop();
    marks.insert(id, Mark::Done);
    Ok(())
}
