//! Library surface for the dependency-aware RPM build orchestrator.
//!
//! Wires the eight components of spec.md §4 behind the four
//! "Observable operations" of §6: `analyze`, `plan`, `download_only`,
//! and `build`. `main.rs`/`cli.rs` are a thin shell over this crate.

pub mod archive_fetcher;
pub mod archive_reader;
pub mod build_lock;
pub mod build_orchestrator;
pub mod config;
pub mod dependency_resolver;
pub mod error;
pub mod hub_client;
pub mod ml_fallback;
pub mod model;
pub mod name_canonicalizer;
pub mod report;
pub mod retry;
pub mod spec_analyzer;
pub mod ui;

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::archive_fetcher::ArchiveFetcher;
use crate::config::ResolverConfig;
use crate::dependency_resolver::{self, ArchiveResolver, DependencyResolver};
use crate::error::{CoreError, CoreResult};
use crate::hub_client::{CliHubClient, HubClient, SubmitFlags};
use crate::ml_fallback::NgramFallback;
use crate::model::{BuildChain, BuildResult, DependencyGraph, NameResolutionMode, PackageInfo};
use crate::name_canonicalizer::NameCanonicalizer;

/// `plan(archive or name) → DependencyGraph + chain` result of §6.
#[derive(Debug, Clone)]
pub struct Plan {
    pub graph: DependencyGraph,
    pub chain: BuildChain,
}

/// One constructed `Engine` owns the process-lifetime collaborators
/// (hub client, canonicalizer cache, archive fetcher) that back every
/// `analyze`/`plan`/`download_only`/`build` call — mirroring §5's
/// "process-wide caches... read-mostly".
pub struct Engine {
    config: ResolverConfig,
    hub: Box<dyn HubClient>,
    canonicalizer: NameCanonicalizer,
    fetcher: ArchiveFetcher,
}

impl Engine {
    pub fn new(config: ResolverConfig) -> anyhow::Result<Self> {
        let hub: Box<dyn HubClient> = Box::new(CliHubClient::new(config.hub_cli_binary.clone(), config.hub.clone()));
        let ml_fallback = match config.name_resolution_mode {
            NameResolutionMode::RulesPlusMl => config
                .ml_model_path
                .as_deref()
                .and_then(|path| NgramFallback::maybe_load(path, config.ml_distance_threshold))
                .map(|m| Arc::new(m) as Arc<dyn ml_fallback::MlFallback>),
            _ => None,
        };
        let canonicalizer = NameCanonicalizer::new(config.name_resolution_mode, ml_fallback);
        let fetcher = ArchiveFetcher::new(
            config.archive_cache_dir.clone(),
            config.sources.clone(),
            !config.no_ssl_verify,
            config.hub_cli_binary.clone(),
        )?;
        Ok(Self {
            config,
            hub,
            canonicalizer,
            fetcher,
        })
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// `analyze(archive) → PackageInfo`. Accepts a path to an SRPM
    /// archive, a path to a raw `.spec` file, or a bare package name
    /// (which is fetched first via `ArchiveFetcher`).
    pub fn analyze(&self, archive_or_spec: &str) -> CoreResult<PackageInfo> {
        let path = Path::new(archive_or_spec);
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("spec") {
            let payload = std::fs::read_to_string(path).map_err(|err| CoreError::InvalidArchive {
                path: archive_or_spec.to_string(),
                reason: format!("failed to read spec file: {err}"),
            })?;
            let (info, warnings) = spec_analyzer::analyze_spec_text(archive_or_spec, &payload)?;
            for warning in warnings {
                tracing::warn!(%warning, "unresolved macro");
            }
            return Ok(info);
        }
        let (_, archive_path) = self.resolve_root(archive_or_spec)?;
        archive_reader::info(Path::new(&archive_path))
    }

    /// `plan(archive or name) → DependencyGraph + chain` (dry-run).
    pub fn plan(&self, archive_or_name: &str) -> CoreResult<Plan> {
        let (root_name, root_archive) = self.resolve_root(archive_or_name)?;
        let resolver = DependencyResolver::new(self.hub.as_ref(), &self.canonicalizer, self.config.hub_build_tag.clone());
        let resolve_archive = self.archive_resolver();

        let mut graph = if self.config.no_deps {
            self.single_node_graph(&root_name, &root_archive)
        } else {
            resolver.build_graph(&root_name, &root_archive, &resolve_archive)?
        };
        resolver.mark_availability(&mut graph)?;
        let order = dependency_resolver::topological_sort(&graph)?;
        let chain = dependency_resolver::build_chain(&mut graph, &order);
        Ok(Plan { graph, chain })
    }

    /// `downloadOnly(name) → archivePath`.
    pub fn download_only(&self, package_name: &str, version: Option<&str>) -> CoreResult<PathBuf> {
        self.fetcher.fetch(package_name, version)
    }

    /// `build(archive or name, options) → BuildResult`, honoring
    /// `config.no_deps` (§9 Open Question: the root is still
    /// submitted even with dependency discovery disabled).
    pub fn build(&self, archive_or_name: &str, cancellation: Arc<AtomicBool>) -> CoreResult<BuildResult> {
        let (root_name, root_archive) = self.resolve_root(archive_or_name)?;
        let submit_flags = SubmitFlags {
            scratch: self.config.scratch,
            no_wait: self.config.no_wait,
        };
        let orchestrator = build_orchestrator::BuildOrchestrator::with_cancellation(
            self.hub.as_ref(),
            self.config.hub_build_tag.clone(),
            self.config.hub_target.clone(),
            self.config.max_parallel_per_level,
            submit_flags,
            Duration::from_secs(self.config.wait_for_repo_seconds),
            cancellation,
        );

        if self.config.no_deps {
            info!(package = root_name, "no_deps set, building root only");
            return orchestrator.build_single(&root_name, &root_archive);
        }

        let resolve_archive = self.archive_resolver();
        orchestrator.build_with_deps(&root_name, &root_archive, &self.canonicalizer, &resolve_archive)
    }

    fn archive_resolver(&self) -> impl ArchiveResolver + '_ {
        move |name: &str| -> Result<String, CoreError> {
            self.fetcher
                .fetch(name, None)
                .map(|path| path.display().to_string())
        }
    }

    fn single_node_graph(&self, root_name: &str, root_archive: &str) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        let mut node = model::DependencyNode::new(root_name);
        node.archive_path = Some(root_archive.to_string());
        graph.insert(root_name.to_string(), node);
        graph
    }

    /// Resolves `input` to `(package_name, archive_path)`: an existing
    /// RPM archive is used as-is (its name is derived from `info()`);
    /// anything else is treated as a package name and fetched.
    fn resolve_root(&self, input: &str) -> CoreResult<(String, String)> {
        let path = Path::new(input);
        if path.is_file() {
            let info = archive_reader::info(path)?;
            return Ok((info.name, input.to_string()));
        }
        let archive_path = self.fetcher.fetch(input, None)?;
        Ok((input.to_string(), archive_path.display().to_string()))
    }
}
