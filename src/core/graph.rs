//! Artifact dependency graph.
//!
//! Edges point from a dependency to its dependents. The graph is validated
//! once at load time: unknown references and cycles are rejected before any
//! build is attempted.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use tracing::debug;

use crate::adapters::SourceResolver;
use crate::domain::Artifact;

use super::error::GraphError;

/// Per-artifact cache of resolved source files.
///
/// Resolution is delegated to a [`SourceResolver`]; results are kept for
/// the process lifetime and dropped only by [`SourceDependencies::refresh`].
pub struct SourceDependencies {
    resolver: Arc<dyn SourceResolver>,
    cache: RwLock<HashMap<String, Arc<BTreeSet<PathBuf>>>>,
}

impl SourceDependencies {
    pub fn new(resolver: Arc<dyn SourceResolver>) -> Self {
        Self {
            resolver,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolved source files of an artifact
    pub fn files(&self, artifact: &Artifact) -> Result<Arc<BTreeSet<PathBuf>>, GraphError> {
        if let Some(files) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&artifact.name)
        {
            return Ok(files.clone());
        }

        let resolved: BTreeSet<PathBuf> = self
            .resolver
            .resolve(artifact)
            .map_err(|e| GraphError::Resolve {
                artifact: artifact.name.clone(),
                message: e.to_string(),
            })?
            .into_iter()
            .collect();

        debug!(artifact = %artifact.name, files = resolved.len(), "Resolved source dependencies");

        let resolved = Arc::new(resolved);
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(artifact.name.clone(), resolved.clone());
        Ok(resolved)
    }

    /// Whether `path` belongs to the artifact, either through its cached
    /// file set or through its declared patterns
    pub fn owns(&self, artifact: &Artifact, path: &Path) -> Result<bool, GraphError> {
        if self.files(artifact)?.contains(path) {
            return Ok(true);
        }
        Ok(self.resolver.matches(artifact, path))
    }

    /// Drop the cached file set of an artifact
    pub fn refresh(&self, name: &str) {
        let removed = self
            .cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some();
        if removed {
            debug!(artifact = %name, "Refreshed source dependencies");
        }
    }

    /// Whether an artifact's file set is currently cached
    pub fn is_cached(&self, name: &str) -> bool {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }
}

/// Static dependency graph over the project's artifacts
pub struct ArtifactGraph {
    /// Artifacts by name
    artifacts: BTreeMap<String, Artifact>,

    /// The underlying graph
    graph: DiGraph<String, ()>,

    /// Map from artifact name to node index
    nodes: HashMap<String, NodeIndex>,

    /// Deterministic topological order
    order: Vec<String>,

    /// Resolved source files
    sources: SourceDependencies,
}

impl ArtifactGraph {
    /// Build and validate the graph
    pub fn new(
        artifacts: Vec<Artifact>,
        resolver: Arc<dyn SourceResolver>,
    ) -> Result<Self, GraphError> {
        let mut by_name = BTreeMap::new();
        for artifact in artifacts {
            if artifact.name.is_empty() {
                return Err(GraphError::EmptyName);
            }
            if by_name.contains_key(&artifact.name) {
                return Err(GraphError::DuplicateArtifact(artifact.name));
            }
            by_name.insert(artifact.name.clone(), artifact);
        }

        let mut graph = DiGraph::new();
        let mut nodes = HashMap::new();

        for name in by_name.keys() {
            let idx = graph.add_node(name.clone());
            nodes.insert(name.clone(), idx);
        }

        for (name, artifact) in &by_name {
            let dependent = nodes[name];
            for required in &artifact.requires {
                let Some(&dependency) = nodes.get(required) else {
                    return Err(GraphError::UnresolvedReference {
                        artifact: name.clone(),
                        reference: required.clone(),
                    });
                };
                if graph.find_edge(dependency, dependent).is_none() {
                    graph.add_edge(dependency, dependent, ());
                }
            }
        }

        let mut dag = Self {
            artifacts: by_name,
            graph,
            nodes,
            order: Vec::new(),
            sources: SourceDependencies::new(resolver),
        };

        dag.order = dag.topological_order()?;
        Ok(dag)
    }

    /// Kahn's algorithm with name-ordered tie breaking
    fn topological_order(&self) -> Result<Vec<String>, GraphError> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| {
                let degree = self.graph.neighbors_directed(idx, Direction::Incoming).count();
                (idx, degree)
            })
            .collect();

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(idx, _)| self.graph[*idx].as_str())
            .collect();

        let mut order = Vec::with_capacity(self.artifacts.len());

        while let Some(name) = ready.pop_first() {
            order.push(name.to_string());
            let idx = self.nodes[name];
            for dependent in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if let Some(degree) = in_degree.get_mut(&dependent) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        ready.insert(self.graph[dependent].as_str());
                    }
                }
            }
        }

        if order.len() != self.artifacts.len() {
            return Err(GraphError::CyclicDependency {
                cycle: self.find_cycle(),
            });
        }

        Ok(order)
    }

    /// Name the members of one cycle, following "requires" edges
    fn find_cycle(&self) -> Vec<String> {
        let component = tarjan_scc(&self.graph)
            .into_iter()
            .find(|scc| {
                scc.len() > 1 || self.graph.find_edge(scc[0], scc[0]).is_some()
            })
            .unwrap_or_default();

        let members: BTreeSet<NodeIndex> = component.into_iter().collect();
        let Some(start) = members.iter().min_by_key(|idx| &self.graph[**idx]).copied() else {
            return Vec::new();
        };

        let mut path: Vec<NodeIndex> = Vec::new();
        let mut current = start;
        loop {
            if let Some(pos) = path.iter().position(|idx| *idx == current) {
                let mut cycle: Vec<String> =
                    path[pos..].iter().map(|idx| self.graph[*idx].clone()).collect();
                cycle.push(self.graph[current].clone());
                return cycle;
            }
            path.push(current);

            let next = self
                .graph
                .neighbors_directed(current, Direction::Incoming)
                .filter(|idx| members.contains(idx))
                .min_by_key(|idx| &self.graph[*idx]);
            match next {
                Some(next) => current = next,
                None => return path.iter().map(|idx| self.graph[*idx].clone()).collect(),
            }
        }
    }

    /// Artifact names with every dependency before its dependents
    pub fn build_order(&self) -> &[String] {
        &self.order
    }

    /// Artifacts in build order
    pub fn artifacts(&self) -> impl Iterator<Item = &Artifact> {
        self.order.iter().filter_map(|name| self.artifacts.get(name))
    }

    /// Look up an artifact
    pub fn artifact(&self, name: &str) -> Option<&Artifact> {
        self.artifacts.get(name)
    }

    /// Whether an artifact exists
    pub fn contains(&self, name: &str) -> bool {
        self.artifacts.contains_key(name)
    }

    /// All artifact names
    pub fn names(&self) -> BTreeSet<String> {
        self.artifacts.keys().cloned().collect()
    }

    /// Number of artifacts
    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    /// Whether the graph has no artifacts
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// Direct dependencies of an artifact, sorted by name
    pub fn direct_dependencies(&self, name: &str) -> Vec<String> {
        self.neighbors(name, Direction::Incoming)
    }

    fn neighbors(&self, name: &str, direction: Direction) -> Vec<String> {
        let Some(&idx) = self.nodes.get(name) else {
            return Vec::new();
        };
        let mut names: Vec<String> = self
            .graph
            .neighbors_directed(idx, direction)
            .map(|n| self.graph[n].clone())
            .collect();
        names.sort();
        names
    }

    /// Transitive dependencies (everything that must build before `name`)
    pub fn dependencies(&self, name: &str) -> BTreeSet<String> {
        self.reachable(name, Direction::Incoming)
    }

    /// Transitive dependents (everything invalidated when `name` rebuilds)
    pub fn dependents(&self, name: &str) -> BTreeSet<String> {
        self.reachable(name, Direction::Outgoing)
    }

    fn reachable(&self, name: &str, direction: Direction) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let Some(&start) = self.nodes.get(name) else {
            return seen;
        };

        let mut queue = VecDeque::from([start]);
        while let Some(idx) = queue.pop_front() {
            for next in self.graph.neighbors_directed(idx, direction) {
                if seen.insert(self.graph[next].clone()) {
                    queue.push_back(next);
                }
            }
        }
        seen
    }

    /// Close a set of artifacts over their transitive dependents
    pub fn with_dependents(&self, names: &BTreeSet<String>) -> BTreeSet<String> {
        let mut closed = names.clone();
        for name in names {
            closed.extend(self.dependents(name));
        }
        closed
    }

    /// Group a subset of artifacts into build waves.
    ///
    /// Every artifact lands in a later wave than each of its dependencies
    /// that is also in the subset; dependencies outside the subset are
    /// treated as already satisfied.
    pub fn waves(&self, subset: &BTreeSet<String>) -> Vec<Vec<String>> {
        let mut level: HashMap<&str, usize> = HashMap::new();
        let mut waves: Vec<Vec<String>> = Vec::new();

        for name in &self.order {
            if !subset.contains(name) {
                continue;
            }
            let depth = self
                .direct_dependencies(name)
                .iter()
                .filter_map(|dep| level.get(dep.as_str()))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            level.insert(name.as_str(), depth);

            if waves.len() <= depth {
                waves.resize(depth + 1, Vec::new());
            }
            waves[depth].push(name.clone());
        }

        for wave in &mut waves {
            wave.sort();
        }
        waves
    }

    /// Resolved source files of an artifact
    pub fn source_files(&self, name: &str) -> Result<Arc<BTreeSet<PathBuf>>, GraphError> {
        let artifact = self
            .artifacts
            .get(name)
            .ok_or_else(|| GraphError::UnknownArtifact(name.to_string()))?;
        self.sources.files(artifact)
    }

    /// Source dependency cache
    pub fn sources(&self) -> &SourceDependencies {
        &self.sources
    }
}
