//! §4.G DependencyResolver — constructs the dependency DAG for a root
//! package: recursive discovery, cycle detection, topological sort,
//! and level grouping.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::path::Path;

use tracing::{debug, info, warn};

use crate::archive_reader;
use crate::error::CoreError;
use crate::hub_client::HubClient;
use crate::model::{BuildChain, DependencyGraph, DependencyNode};
use crate::name_canonicalizer::NameCanonicalizer;

/// Caller-supplied archive resolution callback, typically
/// `ArchiveFetcher::fetch` wrapped to erase the version parameter
/// → path`).
pub trait ArchiveResolver {
    fn resolve(&self, name: &str) -> Result<String, CoreError>;
}

impl<F> ArchiveResolver for F
where
    F: Fn(&str) -> Result<String, CoreError>,
{
    fn resolve(&self, name: &str) -> Result<String, CoreError> {
        self(name)
    }
}

pub struct DependencyResolver<'a> {
    hub: &'a dyn HubClient,
    canonicalizer: &'a NameCanonicalizer,
    hub_build_tag: String,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(hub: &'a dyn HubClient, canonicalizer: &'a NameCanonicalizer, hub_build_tag: impl Into<String>) -> Self {
        Self {
            hub,
            canonicalizer,
            hub_build_tag: hub_build_tag.into(),
        }
    }

    /// Builds the full `DependencyGraph` for `root_name`/`root_archive_path`
    ///. Resolution of a dependency's archive is
    /// delegated to `resolve_archive`.
    pub fn build_graph(
        &self,
        root_name: &str,
        root_archive_path: &str,
        resolve_archive: &dyn ArchiveResolver,
    ) -> Result<DependencyGraph, CoreError> {
        let mut graph: DependencyGraph = BTreeMap::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut worklist: VecDeque<(String, String)> = VecDeque::new();

        let mut root_node = DependencyNode::new(root_name);
        root_node.archive_path = Some(root_archive_path.to_string());
        graph.insert(root_name.to_string(), root_node);
        seen.insert(root_name.to_string());
        worklist.push_back((root_name.to_string(), root_archive_path.to_string()));

        while let Some((name, archive_path)) = worklist.pop_front() {
            if graph.get(&name).map(|n| n.is_available).unwrap_or(false) {
                continue;
            }

            let requirement_tokens = self.requirements_for(&archive_path)?;
            let mut dependencies = BTreeSet::new();

            for token in requirement_tokens {
                let canonical = self.canonicalizer.canonicalize(&token);
                let dep_key = canonical.clone();

                if self.is_satisfied(&canonical, &token)? {
                    debug!(requirement = token, canonical, "dependency satisfied by hub tag");
                    if !seen.contains(&dep_key) {
                        seen.insert(dep_key.clone());
                        let mut node = DependencyNode::new(&dep_key);
                        node.is_available = true;
                        graph.insert(dep_key.clone(), node);
                    }
                    dependencies.insert(dep_key);
                    continue;
                }

                if !seen.contains(&dep_key) {
                    seen.insert(dep_key.clone());
                    let dep_archive = resolve_archive.resolve(&dep_key)?;
                    let mut node = DependencyNode::new(&dep_key);
                    node.archive_path = Some(dep_archive.clone());
                    graph.insert(dep_key.clone(), node);
                    worklist.push_back((dep_key.clone(), dep_archive));
                }
                dependencies.insert(dep_key);
            }

            if let Some(node) = graph.get_mut(&name) {
                node.dependencies = dependencies;
            }
        }

        info!(nodes = graph.len(), "dependency graph constructed");
        Ok(graph)
    }

    fn requirements_for(&self, archive_path: &str) -> Result<Vec<String>, CoreError> {
        archive_reader::requires(Path::new(archive_path))
    }

    /// A requirement is satisfied iff the canonical name exists in the
    /// hub tag; if not, fall back to the original pre-canonical token
    /// (§4.G: "canonical wins if present, else original" — see
    /// DESIGN.md for this Open Question's resolution).
    fn is_satisfied(&self, canonical: &str, original_token: &str) -> Result<bool, CoreError> {
        if self.hub.exists(canonical, &self.hub_build_tag)? {
            return Ok(true);
        }
        if canonical != original_token && self.hub.exists(original_token, &self.hub_build_tag)? {
            return Ok(true);
        }
        Ok(false)
    }

    /// Marks every node whose dependencies are now known and that
    /// exists in the hub tag as available, with no outgoing edges
    ///. `build_graph` already marks satisfied dependencies as they're
    /// discovered; this pass also covers the (possible) root-as-
    /// available case — a root whose own `BuildRequires` is empty
    /// and that already exists in the hub tag.
    pub fn mark_availability(&self, graph: &mut DependencyGraph) -> Result<(), CoreError> {
        let names: Vec<String> = graph.keys().cloned().collect();
        for name in names {
            let already_has_deps = graph.get(&name).map(|n| !n.dependencies.is_empty()).unwrap_or(false);
            if already_has_deps {
                continue;
            }
            let exists = self.hub.exists(&name, &self.hub_build_tag)?;
            if let Some(node) = graph.get_mut(&name) {
                if exists {
                    node.is_available = true;
                    node.dependencies.clear();
                }
            }
        }
        Ok(())
    }
}

/// Kahn's algorithm over the subgraph of unavailable nodes, extracting
/// ties in lexicographic name order for determinism.
/// Fails with `CircularDependencyError` carrying the remaining subset
/// if any node keeps a positive in-degree.
pub fn topological_sort(graph: &DependencyGraph) -> Result<Vec<String>, CoreError> {
    let unavailable: BTreeSet<&String> = graph
        .iter()
        .filter(|(_, node)| !node.is_available)
        .map(|(name, _)| name)
        .collect();

    let mut in_degree: BTreeMap<String, usize> = unavailable.iter().map(|&n| (n.clone(), 0)).collect();
    let mut dependents: BTreeMap<String, BTreeSet<String>> = unavailable.iter().map(|&n| (n.clone(), BTreeSet::new())).collect();

    for &name in &unavailable {
        let node = &graph[name];
        for dep in &node.dependencies {
            if unavailable.contains(dep) {
                *in_degree.get_mut(name).unwrap() += 1;
                dependents.get_mut(dep).unwrap().insert(name.clone());
            }
        }
    }

    let mut order = Vec::new();
    let mut ready: BTreeSet<String> = in_degree.iter().filter(|(_, &d)| d == 0).map(|(n, _)| n.clone()).collect();

    while let Some(next) = ready.iter().next().cloned() {
        ready.remove(&next);
        order.push(next.clone());
        if let Some(children) = dependents.get(&next) {
            for child in children {
                let degree = in_degree.get_mut(child).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(child.clone());
                }
            }
        }
    }

    if order.len() != unavailable.len() {
        let remaining: BTreeSet<String> = in_degree
            .into_iter()
            .filter(|(name, degree)| *degree > 0 || !order.contains(name))
            .map(|(name, _)| name)
            .collect();
        warn!(cycle = ?remaining, "circular dependency detected");
        return Err(CoreError::CircularDependency { cycle: remaining });
    }

    Ok(order)
}

/// Assigns `buildOrder` along the topological order and groups nodes
/// into parallel levels. The root is
/// necessarily the last, singleton level.
pub fn build_chain(graph: &mut DependencyGraph, order: &[String]) -> BuildChain {
    for name in order {
        let max_dep_order = {
            let node = &graph[name];
            node.dependencies
                .iter()
                .filter_map(|dep| graph.get(dep))
                .filter(|dep_node| !dep_node.is_available)
                .map(|dep_node| dep_node.build_order)
                .max()
        };
        let order_value = match max_dep_order {
            Some(max) if max >= 0 => max + 1,
            _ => 0,
        };
        graph.get_mut(name).unwrap().build_order = order_value;
    }

    let max_level = order.iter().map(|n| graph[n].build_order).max().unwrap_or(-1);
    if max_level < 0 {
        return Vec::new();
    }
    let mut chain: BuildChain = vec![BTreeSet::new(); (max_level + 1) as usize];
    for name in order {
        let level = graph[name].build_order as usize;
        chain[level].insert(name.clone());
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DependencyNode;

    fn node(name: &str, deps: &[&str], available: bool) -> (String, DependencyNode) {
        let mut n = DependencyNode::new(name);
        n.dependencies = deps.iter().map(|s| s.to_string()).collect();
        n.is_available = available;
        (name.to_string(), n)
    }

    /// §8 S3: `my-app → {lib-foo, lib-bar, lib-baz}`, `lib-foo →
    /// lib-base`, `lib-baz → lib-core`; hub already contains
    /// `lib-bar, lib-base, lib-core`.
    fn s3_graph() -> DependencyGraph {
        BTreeMap::from([
            node("my-app", &["lib-foo", "lib-bar", "lib-baz"], false),
            node("lib-foo", &["lib-base"], false),
            node("lib-bar", &[], true),
            node("lib-baz", &["lib-core"], false),
            node("lib-base", &[], true),
            node("lib-core", &[], true),
        ])
    }

    #[test]
    fn s3_dag_leveling() {
        let mut graph = s3_graph();
        let order = topological_sort(&graph).unwrap();
        let chain = build_chain(&mut graph, &order);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0], BTreeSet::from(["lib-foo".to_string(), "lib-baz".to_string()]));
        assert_eq!(chain[1], BTreeSet::from(["my-app".to_string()]));
    }

    #[test]
    fn p3_leaf_build_order_is_zero() {
        let mut graph = s3_graph();
        let order = topological_sort(&graph).unwrap();
        build_chain(&mut graph, &order);
        assert_eq!(graph["lib-foo"].build_order, 0);
        assert_eq!(graph["lib-baz"].build_order, 0);
        assert_eq!(graph["my-app"].build_order, 1);
    }

    #[test]
    fn s4_cycle_detection() {
        let graph: DependencyGraph = BTreeMap::from([node("A", &["B"], false), node("B", &["A"], false)]);
        let err = topological_sort(&graph).unwrap_err();
        match err {
            CoreError::CircularDependency { cycle } => {
                assert_eq!(cycle, BTreeSet::from(["A".to_string(), "B".to_string()]));
            }
            other => panic!("expected CircularDependency, got {other:?}"),
        }
    }

    #[test]
    fn determinism_across_runs() {
        let mut g1 = s3_graph();
        let mut g2 = s3_graph();
        let order1 = topological_sort(&g1).unwrap();
        let order2 = topological_sort(&g2).unwrap();
        let chain1 = build_chain(&mut g1, &order1);
        let chain2 = build_chain(&mut g2, &order2);
        assert_eq!(chain1, chain2);
    }

    #[test]
    fn mark_availability_flips_leaf_present_in_hub_tag() {
        let hub = crate::hub_client::mock::MockHubClient::with_available(["lib-base"]);
        let canonicalizer = NameCanonicalizer::without_ml();
        let resolver = DependencyResolver::new(&hub, &canonicalizer, "build-tag");

        let mut graph: DependencyGraph = BTreeMap::from([node("lib-base", &[], false)]);
        resolver.mark_availability(&mut graph).unwrap();

        assert!(graph["lib-base"].is_available);
        assert!(graph["lib-base"].dependencies.is_empty());
    }

    #[test]
    fn mark_availability_leaves_resolved_node_untouched() {
        let hub = crate::hub_client::mock::MockHubClient::with_available(["my-app"]);
        let canonicalizer = NameCanonicalizer::without_ml();
        let resolver = DependencyResolver::new(&hub, &canonicalizer, "build-tag");

        let mut graph: DependencyGraph = BTreeMap::from([node("my-app", &["lib-foo"], false)]);
        resolver.mark_availability(&mut graph).unwrap();

        assert!(!graph["my-app"].is_available);
        assert_eq!(graph["my-app"].dependencies, BTreeSet::from(["lib-foo".to_string()]));
    }

    #[test]
    fn mark_availability_skips_node_not_in_hub_tag() {
        let hub = crate::hub_client::mock::MockHubClient::with_available(["lib-base"]);
        let canonicalizer = NameCanonicalizer::without_ml();
        let resolver = DependencyResolver::new(&hub, &canonicalizer, "build-tag");

        let mut graph: DependencyGraph = BTreeMap::from([node("lib-missing", &[], false)]);
        resolver.mark_availability(&mut graph).unwrap();

        assert!(!graph["lib-missing"].is_available);
    }
}
