//! Machine-readable JSON summary of a `build()` run, written next to
//! the archive cache for CI consumption (SPEC_FULL.md §7). A thin
//! serialization of `BuildResult` already held in memory, not a new
//! subsystem.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::model::BuildResult;

#[derive(Debug, Serialize)]
struct BuildReport<'a> {
    target: &'a str,
    success: bool,
    built_packages: &'a [String],
    failed_packages: &'a [String],
    total_seconds: f64,
    tasks: &'a [crate::model::BuildTask],
}

/// Writes `{cache_dir}/srpmgraph-report-{target}.json`, overwriting
/// any report from a previous run against the same target.
pub fn write_build_report(cache_dir: &Path, target: &str, result: &BuildResult) -> Result<PathBuf> {
    fs::create_dir_all(cache_dir).with_context(|| format!("creating report directory {}", cache_dir.display()))?;
    let file_name = format!("srpmgraph-report-{}.json", sanitize_target(target));
    let path = cache_dir.join(file_name);
    let report = BuildReport {
        target,
        success: result.success,
        built_packages: &result.built_packages,
        failed_packages: &result.failed_packages,
        total_seconds: result.total_seconds,
        tasks: &result.tasks,
    };
    let payload = serde_json::to_vec_pretty(&report).context("serializing build report")?;
    fs::write(&path, payload).with_context(|| format!("writing build report {}", path.display()))?;
    Ok(path)
}

fn sanitize_target(target: &str) -> String {
    target
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BuildTask, TaskStatus};

    #[test]
    fn write_build_report_round_trips_via_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = BuildTask::new("samtools", "/tmp/samtools.src.rpm", "dist-build-target");
        task.status = TaskStatus::Complete;
        let result = BuildResult::finalize(vec![task], 12.5);

        let path = write_build_report(dir.path(), "samtools", &result).expect("write report");
        assert!(path.exists());

        let raw = fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["success"], serde_json::Value::Bool(true));
        assert_eq!(parsed["built_packages"][0], "samtools");
    }

    #[test]
    fn sanitize_target_replaces_path_separators() {
        assert_eq!(sanitize_target("pkgs/samtools.src.rpm"), "pkgs_samtools.src.rpm");
    }
}
