//! Resolver configuration, covering hub connectivity, archive sources,
//! and orchestration tuning. Layered defaults → optional TOML file →
//! CLI flags, the same precedence order used elsewhere for config
//! loading.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::model::NameResolutionMode;

/// One entry of `sources`: an archive source tried in priority
/// order, lower `priority` first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveSourceConfig {
    pub id: String,
    pub priority: u32,
    #[serde(flatten)]
    pub kind: ArchiveSourceKind,
}

/// §4.F's two built-in source kinds. `HubDownload` shells out to the
/// hub CLI's `download-build --arch=src`; `SpecRepo` fetches a spec
/// and its referenced sources over HTTP and builds the SRPM locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum ArchiveSourceKind {
    HubDownload,
    SpecRepo { base_url: String },
}

/// Hub transport configuration: server URL plus client cert bundle
/// and server CA for mTLS.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubConnectionConfig {
    pub hub_server: Option<String>,
    pub client_credentials: Option<PathBuf>,
    pub server_ca: Option<PathBuf>,
}

/// Default `θ` for MLFallback.
pub const DEFAULT_ML_DISTANCE_THRESHOLD: f64 = 0.3;
/// Default `waitForRepo` deadline (30 minutes is the commonly assumed
/// ceiling across hub deployments).
pub const DEFAULT_WAIT_FOR_REPO_SECONDS: u64 = 30 * 60;
/// Macro expansion depth cap.
pub const MACRO_EXPANSION_DEPTH: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    pub hub: HubConnectionConfig,
    /// Name (or path) of the hub's official command-line tool that
    /// `HubClient` shells out to (spec.md §9: "the tool name ... [is]
    /// an implementation concern").
    pub hub_cli_binary: String,
    pub hub_build_tag: String,
    pub hub_target: String,
    pub archive_cache_dir: PathBuf,
    pub max_parallel_per_level: usize,
    pub name_resolution_mode: NameResolutionMode,
    pub ml_model_path: Option<PathBuf>,
    pub ml_distance_threshold: f64,
    pub sources: Vec<ArchiveSourceConfig>,
    pub scratch: bool,
    pub no_wait: bool,
    pub no_ssl_verify: bool,
    pub fedora_release: String,
    pub wait_for_repo_seconds: u64,
    pub no_deps: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            hub: HubConnectionConfig::default(),
            hub_cli_binary: "buildhub".to_string(),
            hub_build_tag: "dist-build".to_string(),
            hub_target: "dist-build-target".to_string(),
            archive_cache_dir: default_cache_dir(),
            max_parallel_per_level: 4,
            name_resolution_mode: NameResolutionMode::RulesOnly,
            ml_model_path: None,
            ml_distance_threshold: DEFAULT_ML_DISTANCE_THRESHOLD,
            sources: vec![
                ArchiveSourceConfig {
                    id: "hub-primary".to_string(),
                    priority: 0,
                    kind: ArchiveSourceKind::HubDownload,
                },
                ArchiveSourceConfig {
                    id: "spec-repo-fallback".to_string(),
                    priority: 1,
                    kind: ArchiveSourceKind::SpecRepo {
                        base_url: "https://dist-git.example.org/rpms".to_string(),
                    },
                },
            ],
            scratch: false,
            no_wait: false,
            no_ssl_verify: false,
            fedora_release: "42".to_string(),
            wait_for_repo_seconds: DEFAULT_WAIT_FOR_REPO_SECONDS,
            no_deps: false,
        }
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("srpmgraph")
        .join("archives")
}

impl ResolverConfig {
    /// Loads a TOML config file, falling back to defaults for any key
    /// it omits. Absent file is not an error.
    pub fn load_layered(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Some(path) = path {
            if path.exists() {
                let text = std::fs::read_to_string(path)?;
                let from_file: PartialResolverConfig = toml::from_str(&text)?;
                from_file.apply_onto(&mut config);
            }
        }
        Ok(config)
    }

    pub fn ml_prediction_cache_path(&self) -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("srpmgraph")
            .join("ml-predictions.json")
    }
}

/// Deserialization target for a config file: every field optional so
/// a partial file only overrides what it mentions.
#[derive(Debug, Default, Deserialize)]
struct PartialResolverConfig {
    hub_server: Option<String>,
    client_credentials: Option<PathBuf>,
    server_ca: Option<PathBuf>,
    hub_cli_binary: Option<String>,
    hub_build_tag: Option<String>,
    hub_target: Option<String>,
    archive_cache_dir: Option<PathBuf>,
    max_parallel_per_level: Option<usize>,
    name_resolution_mode: Option<NameResolutionMode>,
    ml_model_path: Option<PathBuf>,
    ml_distance_threshold: Option<f64>,
    sources: Option<Vec<ArchiveSourceConfig>>,
    scratch: Option<bool>,
    no_wait: Option<bool>,
    no_ssl_verify: Option<bool>,
    fedora_release: Option<String>,
    wait_for_repo_seconds: Option<u64>,
    no_deps: Option<bool>,
}

impl PartialResolverConfig {
    fn apply_onto(self, config: &mut ResolverConfig) {
        if let Some(v) = self.hub_server {
            config.hub.hub_server = Some(v);
        }
        if let Some(v) = self.client_credentials {
            config.hub.client_credentials = Some(v);
        }
        if let Some(v) = self.server_ca {
            config.hub.server_ca = Some(v);
        }
        if let Some(v) = self.hub_cli_binary {
            config.hub_cli_binary = v;
        }
        if let Some(v) = self.hub_build_tag {
            config.hub_build_tag = v;
        }
        if let Some(v) = self.hub_target {
            config.hub_target = v;
        }
        if let Some(v) = self.archive_cache_dir {
            config.archive_cache_dir = v;
        }
        if let Some(v) = self.max_parallel_per_level {
            config.max_parallel_per_level = v.max(1);
        }
        if let Some(v) = self.name_resolution_mode {
            config.name_resolution_mode = v;
        }
        if let Some(v) = self.ml_model_path {
            config.ml_model_path = Some(v);
        }
        if let Some(v) = self.ml_distance_threshold {
            config.ml_distance_threshold = v;
        }
        if let Some(v) = self.sources {
            config.sources = v;
        }
        if let Some(v) = self.scratch {
            config.scratch = v;
        }
        if let Some(v) = self.no_wait {
            config.no_wait = v;
        }
        if let Some(v) = self.no_ssl_verify {
            config.no_ssl_verify = v;
        }
        if let Some(v) = self.fedora_release {
            config.fedora_release = v;
        }
        if let Some(v) = self.wait_for_repo_seconds {
            config.wait_for_repo_seconds = v;
        }
        if let Some(v) = self.no_deps {
            config.no_deps = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_retry_and_threshold_defaults() {
        let config = ResolverConfig::default();
        assert_eq!(config.ml_distance_threshold, DEFAULT_ML_DISTANCE_THRESHOLD);
        assert_eq!(config.wait_for_repo_seconds, DEFAULT_WAIT_FOR_REPO_SECONDS);
        assert!(config.max_parallel_per_level >= 1);
    }

    #[test]
    fn partial_file_only_overrides_named_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "hub_build_tag = \"custom-tag\"\n").unwrap();
        let config = ResolverConfig::load_layered(Some(&path)).unwrap();
        assert_eq!(config.hub_build_tag, "custom-tag");
        assert_eq!(config.hub_target, ResolverConfig::default().hub_target);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = ResolverConfig::load_layered(Some(Path::new("/nonexistent/path.toml"))).unwrap();
        assert_eq!(config.hub_build_tag, ResolverConfig::default().hub_build_tag);
    }
}
