//! Shared data model for spec parsing, dependency resolution and builds.
//!
//! Mirrors the value types of the reference tool this system drives:
//! flat, serializable, and owned by name rather than by pointer so the
//! dependency graph never needs cyclic ownership (see `graph.rs`).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Version comparison operator recognized in a `BuildRequires` token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    Compatible,
}

impl Operator {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "=" | "==" => Some(Operator::Eq),
            "<" => Some(Operator::Lt),
            "<=" => Some(Operator::Le),
            ">" => Some(Operator::Gt),
            ">=" => Some(Operator::Ge),
            "~=" => Some(Operator::Compatible),
            _ => None,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operator::Eq => "=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Compatible => "~=",
        };
        write!(f, "{s}")
    }
}

/// `{ name, operator?, version? }` — operator and version are present
/// or absent together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequirement {
    pub name: String,
    pub constraint: Option<(Operator, String)>,
}

impl BuildRequirement {
    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constraint: None,
        }
    }

    pub fn versioned(name: impl Into<String>, op: Operator, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constraint: Some((op, version.into())),
        }
    }

    /// Parses a single whitespace-delimited token of the form
    /// `name [op version]`. `==` is normalized to `=`.
    pub fn parse(token: &str) -> Option<Self> {
        let parts: Vec<&str> = token.split_whitespace().collect();
        match parts.as_slice() {
            [name] => Some(Self::bare(*name)),
            [name, op, version] => {
                let operator = Operator::parse(op)?;
                Some(Self::versioned(*name, operator, *version))
            }
            _ => None,
        }
    }

    /// `"name op version"` or bare `"name"` — round-trips with `parse`
    /// modulo whitespace.
    pub fn to_token(&self) -> String {
        match &self.constraint {
            Some((op, version)) => format!("{} {op} {version}", self.name),
            None => self.name.clone(),
        }
    }
}

impl fmt::Display for BuildRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_token())
    }
}

/// Parsed identity, versions, sources and build requirements of one
/// spec file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    pub name: String,
    pub version: String,
    pub release: String,
    pub epoch: Option<String>,
    pub build_requires: Vec<BuildRequirement>,
    pub source_urls: Vec<String>,
}

impl PackageInfo {
    /// `name-version-release`, the hub's canonical build identifier.
    pub fn nvr(&self) -> String {
        format!("{}-{}-{}", self.name, self.version, self.release)
    }
}

/// One node of the dependency DAG, keyed by package name in
/// `DependencyGraph`. Edges are represented as names, not pointers,
/// which keeps the graph trivially serializable and ownership-free.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyNode {
    pub name: String,
    pub archive_path: Option<String>,
    pub info: Option<PackageInfo>,
    pub dependencies: BTreeSet<String>,
    pub is_available: bool,
    pub build_order: i64,
}

impl DependencyNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            archive_path: None,
            info: None,
            dependencies: BTreeSet::new(),
            is_available: false,
            build_order: -1,
        }
    }
}

/// Mapping from package name to `DependencyNode`. Structural
/// invariants are enforced by `DependencyResolver`, not by this type.
pub type DependencyGraph = BTreeMap<String, DependencyNode>;

/// `buildOrder`-indexed partition of a `DependencyGraph` produced by
/// level grouping; index `i` holds every node with `build_order == i`.
pub type BuildChain = Vec<BTreeSet<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Building,
    Complete,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Complete | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Building => "BUILDING",
            TaskStatus::Complete => "COMPLETE",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Canceled => "CANCELED",
        };
        write!(f, "{s}")
    }
}

/// One submitted build, tracked by the orchestrator. Fields evolve
/// monotonically toward a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildTask {
    pub package_name: String,
    pub archive_path: String,
    pub target: String,
    pub task_id: Option<u64>,
    pub status: TaskStatus,
    pub error_message: Option<String>,
    pub nvr: Option<String>,
}

impl BuildTask {
    pub fn new(package_name: impl Into<String>, archive_path: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            package_name: package_name.into(),
            archive_path: archive_path.into(),
            target: target.into(),
            task_id: None,
            status: TaskStatus::Pending,
            error_message: None,
            nvr: None,
        }
    }
}

/// Outcome of a full or partial orchestration run. `success` is
/// derived, never set directly — see `BuildResult::finalize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    pub success: bool,
    pub tasks: Vec<BuildTask>,
    pub built_packages: Vec<String>,
    pub failed_packages: Vec<String>,
    pub total_seconds: f64,
}

impl BuildResult {
    /// Computes `success` and the built/failed package lists from
    /// `tasks`: success holds iff every task terminated COMPLETE.
    pub fn finalize(tasks: Vec<BuildTask>, total_seconds: f64) -> Self {
        let mut built_packages = Vec::new();
        let mut failed_packages = Vec::new();
        for task in &tasks {
            match task.status {
                TaskStatus::Complete => built_packages.push(task.package_name.clone()),
                _ => failed_packages.push(task.package_name.clone()),
            }
        }
        let success = failed_packages.is_empty() && tasks.iter().all(|t| t.status == TaskStatus::Complete);
        Self {
            success,
            tasks,
            built_packages,
            failed_packages,
            total_seconds,
        }
    }
}

/// `nameResolutionMode` of `ResolverConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum NameResolutionMode {
    Off,
    #[default]
    RulesOnly,
    RulesPlusMl,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_requirement_round_trips() {
        let cases = ["gcc", "python3-requests = 2.31.0", "foo >= 1.0"];
        for raw in cases {
            let parsed = BuildRequirement::parse(raw).expect("parses");
            assert_eq!(parsed.to_token(), raw);
        }
    }

    #[test]
    fn double_equals_normalizes_to_single() {
        let parsed = BuildRequirement::parse("foo == 1.0").unwrap();
        assert_eq!(parsed.to_token(), "foo = 1.0");
    }

    #[test]
    fn nvr_joins_three_fields() {
        let info = PackageInfo {
            name: "foo".into(),
            version: "1.2".into(),
            release: "3".into(),
            epoch: None,
            build_requires: vec![],
            source_urls: vec![],
        };
        assert_eq!(info.nvr(), "foo-1.2-3");
    }

    #[test]
    fn build_result_success_requires_all_complete() {
        let mut t1 = BuildTask::new("a", "/tmp/a.src.rpm", "target");
        t1.status = TaskStatus::Complete;
        let mut t2 = BuildTask::new("b", "/tmp/b.src.rpm", "target");
        t2.status = TaskStatus::Failed;
        let result = BuildResult::finalize(vec![t1, t2], 1.0);
        assert!(!result.success);
        assert_eq!(result.failed_packages, vec!["b".to_string()]);
    }
}
