//! Command-line surface: `analyze`, `plan`, `download`, `build`.
//!
//! Flags layer on top of `ResolverConfig::load_layered` (defaults →
//! `--config` TOML file → these flags), matching this tool's usual
//! config precedence.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::config::{ArchiveSourceConfig, ArchiveSourceKind, ResolverConfig};
use crate::model::NameResolutionMode;

#[derive(Debug, Parser)]
#[command(name = "srpmgraph", version, about = "Dependency-aware RPM build orchestrator", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Parse an SRPM archive or `.spec` file and print its identity,
    /// sources and build requirements.
    Analyze(AnalyzeArgs),
    /// Resolve the dependency DAG for a package without submitting
    /// anything to the hub.
    Plan(PlanArgs),
    /// Fetch one package's archive into the local cache and print its
    /// path, without resolving or building anything.
    Download(DownloadArgs),
    /// Resolve dependencies and submit the full build chain to the
    /// hub, level by level.
    Build(BuildArgs),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum NameResolutionArg {
    Off,
    RulesOnly,
    RulesPlusMl,
}

impl From<NameResolutionArg> for NameResolutionMode {
    fn from(value: NameResolutionArg) -> Self {
        match value {
            NameResolutionArg::Off => NameResolutionMode::Off,
            NameResolutionArg::RulesOnly => NameResolutionMode::RulesOnly,
            NameResolutionArg::RulesPlusMl => NameResolutionMode::RulesPlusMl,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum UiMode {
    #[default]
    Auto,
    Ratatui,
    Plain,
}

impl UiMode {
    /// `auto` means ratatui when attached to a real terminal, plain
    /// otherwise (piped output, CI).
    pub fn resolve(self) -> UiMode {
        match self {
            UiMode::Auto => {
                if atty_stdout() {
                    UiMode::Ratatui
                } else {
                    UiMode::Plain
                }
            }
            other => other,
        }
    }
}

fn atty_stdout() -> bool {
    use std::io::IsTerminal;
    std::io::stdout().is_terminal()
}

/// Flags shared by every subcommand: hub connectivity, archive
/// sources, name resolution and config-file layering.
#[derive(Debug, Parser)]
pub struct CommonArgs {
    /// Path to a TOML config file layered under these flags.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Hub server URL (overrides the config file).
    #[arg(long)]
    pub hub_server: Option<String>,

    /// Client certificate/key bundle for mTLS to the hub.
    #[arg(long)]
    pub client_credentials: Option<PathBuf>,

    /// Server CA bundle to verify the hub's certificate.
    #[arg(long)]
    pub server_ca: Option<PathBuf>,

    /// Name or path of the hub's command-line client.
    #[arg(long)]
    pub hub_cli_binary: Option<String>,

    /// Tag builds are submitted against.
    #[arg(long)]
    pub hub_build_tag: Option<String>,

    /// Build target (architecture/chroot) submitted to the hub.
    #[arg(long)]
    pub hub_target: Option<String>,

    /// Local directory archives are downloaded into and cached.
    #[arg(long)]
    pub archive_cache_dir: Option<PathBuf>,

    /// Repeatable archive source entry, tried in ascending priority
    /// order: `id=priority=hub` or `id=priority=spec-repo=baseURL`.
    /// Replaces the config file's sources list entirely when given.
    #[arg(long = "source", value_parser = parse_source_arg)]
    pub sources: Vec<ArchiveSourceConfig>,

    /// How aggressively to rewrite unresolvable `BuildRequires` tokens
    /// into RPM package names.
    #[arg(long, value_enum)]
    pub name_resolution: Option<NameResolutionArg>,

    /// Path to a trained n-gram fallback model, used only in
    /// `rules-plus-ml` mode.
    #[arg(long)]
    pub ml_model_path: Option<PathBuf>,

    /// Skip TLS certificate verification for archive downloads
    /// (development/self-signed setups only).
    #[arg(long)]
    pub no_ssl_verify: bool,

    /// Fedora release archives and macro expansion are resolved
    /// against.
    #[arg(long)]
    pub fedora_release: Option<String>,

    /// Resolve and submit only the requested package, skipping
    /// dependency discovery entirely.
    #[arg(long)]
    pub no_deps: bool,
}

fn parse_source_arg(raw: &str) -> Result<ArchiveSourceConfig, String> {
    let parts: Vec<&str> = raw.splitn(4, '=').collect();
    match parts.as_slice() {
        [id, priority, "hub"] => Ok(ArchiveSourceConfig {
            id: id.to_string(),
            priority: parse_priority(priority, raw)?,
            kind: ArchiveSourceKind::HubDownload,
        }),
        [id, priority, "spec-repo", base_url] => Ok(ArchiveSourceConfig {
            id: id.to_string(),
            priority: parse_priority(priority, raw)?,
            kind: ArchiveSourceKind::SpecRepo {
                base_url: base_url.to_string(),
            },
        }),
        _ => Err(format!("expected id=priority=hub or id=priority=spec-repo=baseURL, got '{raw}'")),
    }
}

fn parse_priority(raw_priority: &str, raw: &str) -> Result<u32, String> {
    raw_priority.parse().map_err(|_| format!("invalid priority '{raw_priority}' in --source {raw}"))
}

impl CommonArgs {
    /// Loads the layered config file, then applies these flags on
    /// top — flags always win over the file.
    pub fn resolve_config(&self) -> anyhow::Result<ResolverConfig> {
        let mut config = ResolverConfig::load_layered(self.config.as_deref())?;
        if let Some(v) = &self.hub_server {
            config.hub.hub_server = Some(v.clone());
        }
        if let Some(v) = &self.client_credentials {
            config.hub.client_credentials = Some(v.clone());
        }
        if let Some(v) = &self.server_ca {
            config.hub.server_ca = Some(v.clone());
        }
        if let Some(v) = &self.hub_cli_binary {
            config.hub_cli_binary = v.clone();
        }
        if let Some(v) = &self.hub_build_tag {
            config.hub_build_tag = v.clone();
        }
        if let Some(v) = &self.hub_target {
            config.hub_target = v.clone();
        }
        if let Some(v) = &self.archive_cache_dir {
            config.archive_cache_dir = v.clone();
        }
        if !self.sources.is_empty() {
            config.sources = self.sources.clone();
        }
        if let Some(v) = self.name_resolution {
            config.name_resolution_mode = v.into();
        }
        if let Some(v) = &self.ml_model_path {
            config.ml_model_path = Some(v.clone());
        }
        if self.no_ssl_verify {
            config.no_ssl_verify = true;
        }
        if let Some(v) = &self.fedora_release {
            config.fedora_release = v.clone();
        }
        if self.no_deps {
            config.no_deps = true;
        }
        Ok(config)
    }
}

#[derive(Debug, Parser)]
pub struct AnalyzeArgs {
    /// Path to an SRPM archive, a `.spec` file, or a bare package name
    /// (fetched first).
    pub target: String,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Debug, Parser)]
pub struct PlanArgs {
    /// Path to an SRPM archive or a bare package name.
    pub target: String,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Debug, Parser)]
pub struct DownloadArgs {
    /// Package name to fetch.
    pub name: String,

    /// Specific version to fetch; latest available if omitted.
    #[arg(long)]
    pub version: Option<String>,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Debug, Parser)]
pub struct BuildArgs {
    /// Path to an SRPM archive or a bare package name.
    pub target: String,

    /// Submit as a scratch build (not tagged into the build target on
    /// success).
    #[arg(long)]
    pub scratch: bool,

    /// Submit builds but don't block waiting for repo regeneration
    /// between levels.
    #[arg(long)]
    pub no_wait: bool,

    /// Maximum concurrent submissions within one dependency level.
    #[arg(long)]
    pub max_parallel_per_level: Option<usize>,

    /// How the build dashboard is rendered.
    #[arg(long, value_enum, default_value_t = UiMode::Auto)]
    pub ui: UiMode,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl BuildArgs {
    pub fn apply_onto(&self, config: &mut ResolverConfig) {
        if self.scratch {
            config.scratch = true;
        }
        if self.no_wait {
            config.no_wait = true;
        }
        if let Some(v) = self.max_parallel_per_level {
            config.max_parallel_per_level = v.max(1);
        }
    }
}
