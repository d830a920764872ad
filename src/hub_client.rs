//! §4.E HubClient — thin synchronous adapter over the build hub's
//! command-line tool. The CLI's invocation syntax is an
//! implementation concern (spec.md §6); this module isolates it
//! behind the `HubClient` trait so the rest of the system stays
//! hub-agnostic.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::process::Command;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, instrument, warn};

use crate::config::HubConnectionConfig;
use crate::error::{CoreError, HubBuildErrorKind};
use crate::model::TaskStatus;
use crate::retry::RetryPolicy;

/// Submission flags mirroring the `scratch`/`no-wait` knobs of §6.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitFlags {
    pub scratch: bool,
    pub no_wait: bool,
}

/// Capability interface a `DependencyResolver`/`BuildOrchestrator`
/// drive against. Production code uses `CliHubClient`; tests use
/// `mock::MockHubClient` (see `hub_client::mock`).
pub trait HubClient: Send + Sync {
    fn list_packages(&self, tag: &str) -> Result<HashSet<String>, CoreError>;
    fn exists(&self, name: &str, tag: &str) -> Result<bool, CoreError> {
        Ok(self.list_packages(tag)?.contains(name))
    }
    fn list_tagged_builds(&self, tag: &str) -> Result<HashMap<String, String>, CoreError>;
    fn submit_build(&self, target: &str, archive_path: &str, flags: SubmitFlags) -> Result<u64, CoreError>;
    fn status(&self, task_id: u64) -> Result<TaskStatus, CoreError>;
    fn cancel(&self, task_id: u64) -> Result<bool, CoreError>;
    fn wait_for_repo(&self, tag: &str, timeout: Duration) -> Result<bool, CoreError>;
    /// Clears the memoized `listPackages` result for `tag`.
    fn invalidate(&self, tag: &str);
}

/// Shells out to the hub's official CLI, parsing its stdout.
pub struct CliHubClient {
    cli_binary: String,
    connection: HubConnectionConfig,
    package_listing_cache: Mutex<HashMap<String, HashSet<String>>>,
}

impl CliHubClient {
    pub fn new(cli_binary: impl Into<String>, connection: HubConnectionConfig) -> Self {
        Self {
            cli_binary: cli_binary.into(),
            connection,
            package_listing_cache: Mutex::new(HashMap::new()),
        }
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.cli_binary);
        if let Some(server) = &self.connection.hub_server {
            cmd.arg("--server").arg(server);
        }
        if let Some(cert) = &self.connection.client_credentials {
            cmd.arg("--cert").arg(cert);
        }
        if let Some(ca) = &self.connection.server_ca {
            cmd.arg("--ca").arg(ca);
        }
        cmd
    }

    fn run_cli(&self, args: &[&str]) -> Result<String, CoreError> {
        let policy = RetryPolicy::hub_submission();
        policy.run(
            |err: &CoreError| matches!(err, CoreError::HubConnection(_)),
            |attempt| self.run_cli_once(args, attempt),
        )
    }

    fn run_cli_once(&self, args: &[&str], attempt: u32) -> Result<String, CoreError> {
        debug!(?args, attempt, "invoking hub CLI");
        let output = self
            .base_command()
            .args(args)
            .output()
            .map_err(|err| CoreError::HubConnection(format!("failed to invoke hub CLI: {err}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if looks_like_transport_failure(&stderr) {
                return Err(CoreError::HubConnection(stderr));
            }
            return Err(CoreError::HubBuild {
                kind: HubBuildErrorKind::SubmitFailed,
                message: stderr,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

fn looks_like_transport_failure(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    ["connection refused", "timed out", "could not resolve", "temporarily unavailable"]
        .iter()
        .any(|needle| lower.contains(needle))
}

impl HubClient for CliHubClient {
    #[instrument(skip(self))]
    fn list_packages(&self, tag: &str) -> Result<HashSet<String>, CoreError> {
        if let Some(cached) = self.package_listing_cache.lock().unwrap().get(tag) {
            return Ok(cached.clone());
        }
        let stdout = self.run_cli(&["list-pkgs", "--tag", tag])?;
        let names: HashSet<String> = stdout.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string).collect();
        self.package_listing_cache.lock().unwrap().insert(tag.to_string(), names.clone());
        Ok(names)
    }

    fn list_tagged_builds(&self, tag: &str) -> Result<HashMap<String, String>, CoreError> {
        let stdout = self.run_cli(&["list-tagged", tag])?;
        let mut result = HashMap::new();
        for line in stdout.lines() {
            if let Some((name, nvr)) = line.split_once(' ') {
                result.insert(name.trim().to_string(), nvr.trim().to_string());
            }
        }
        Ok(result)
    }

    fn submit_build(&self, target: &str, archive_path: &str, flags: SubmitFlags) -> Result<u64, CoreError> {
        let mut args = vec!["build".to_string(), target.to_string(), archive_path.to_string()];
        if flags.scratch {
            args.push("--scratch".to_string());
        }
        if flags.no_wait {
            args.push("--nowait".to_string());
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let stdout = self.run_cli(&arg_refs)?;
        parse_task_id(&stdout).ok_or_else(|| CoreError::HubBuild {
            kind: HubBuildErrorKind::SubmitFailed,
            message: format!("could not parse task id from hub output: {stdout}"),
        })
    }

    fn status(&self, task_id: u64) -> Result<TaskStatus, CoreError> {
        let stdout = self.run_cli(&["task-info", &task_id.to_string()])?;
        parse_status(&stdout).ok_or_else(|| CoreError::HubConnection(format!("unrecognized task status output: {stdout}")))
    }

    fn cancel(&self, task_id: u64) -> Result<bool, CoreError> {
        let result = self.run_cli(&["cancel", &task_id.to_string()]);
        Ok(result.is_ok())
    }

    fn wait_for_repo(&self, tag: &str, timeout: Duration) -> Result<bool, CoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            let stdout = self.run_cli(&["wait-repo", tag])?;
            if stdout.trim().eq_ignore_ascii_case("ready") {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                warn!(tag, "timed out waiting for repo regeneration");
                return Ok(false);
            }
            std::thread::sleep(Duration::from_secs(5));
        }
    }

    fn invalidate(&self, tag: &str) {
        self.package_listing_cache.lock().unwrap().remove(tag);
    }
}

fn parse_task_id(stdout: &str) -> Option<u64> {
    for line in stdout.lines() {
        let lower = line.to_ascii_lowercase();
        if let Some(idx) = lower.find("task id:").or_else(|| lower.find("task_id:")) {
            let rest = &line[idx..];
            let digits: String = rest.chars().filter(|c| c.is_ascii_digit()).collect();
            if let Ok(value) = digits.parse() {
                return Some(value);
            }
        }
    }
    None
}

fn parse_status(stdout: &str) -> Option<TaskStatus> {
    let normalized = stdout.trim().to_ascii_uppercase();
    match normalized.as_str() {
        "PENDING" | "FREE" | "OPEN" => Some(TaskStatus::Pending),
        "BUILDING" | "ASSIGNED" => Some(TaskStatus::Building),
        "COMPLETE" | "CLOSED" => Some(TaskStatus::Complete),
        "FAILED" => Some(TaskStatus::Failed),
        "CANCELED" | "CANCELLED" => Some(TaskStatus::Canceled),
        _ => None,
    }
}

/// In-memory `HubClient` used by resolver/orchestrator tests (spec.md
/// §8 S3-S6) so they never shell out to a real hub CLI.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    pub struct MockHubClient {
        pub available_packages: Mutex<HashSet<String>>,
        pub tasks: Mutex<HashMap<u64, TaskStatus>>,
        task_packages: Mutex<HashMap<u64, String>>,
        next_task_id: AtomicU64,
        pub repo_waits: Mutex<Vec<String>>,
        pub fail_packages: Mutex<HashSet<String>>,
    }

    impl Default for MockHubClient {
        fn default() -> Self {
            Self {
                available_packages: Mutex::new(HashSet::new()),
                tasks: Mutex::new(HashMap::new()),
                task_packages: Mutex::new(HashMap::new()),
                next_task_id: AtomicU64::new(1),
                repo_waits: Mutex::new(Vec::new()),
                fail_packages: Mutex::new(HashSet::new()),
            }
        }
    }

    impl MockHubClient {
        pub fn with_available(names: impl IntoIterator<Item = &'static str>) -> Self {
            let client = Self::default();
            client.available_packages.lock().unwrap().extend(names.into_iter().map(String::from));
            client
        }

        pub fn fail(&self, package_name: &str) {
            self.fail_packages.lock().unwrap().insert(package_name.to_string());
        }
    }

    impl HubClient for MockHubClient {
        fn list_packages(&self, _tag: &str) -> Result<HashSet<String>, CoreError> {
            Ok(self.available_packages.lock().unwrap().clone())
        }

        fn list_tagged_builds(&self, _tag: &str) -> Result<HashMap<String, String>, CoreError> {
            Ok(self
                .available_packages
                .lock()
                .unwrap()
                .iter()
                .map(|name| (name.clone(), format!("{name}-1.0-1")))
                .collect())
        }

        fn submit_build(&self, _target: &str, archive_path: &str, _flags: SubmitFlags) -> Result<u64, CoreError> {
            let task_id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
            self.tasks.lock().unwrap().insert(task_id, TaskStatus::Building);
            let package_name = package_name_from_archive(archive_path);
            self.task_packages.lock().unwrap().insert(task_id, package_name);
            Ok(task_id)
        }

        /// Resolves a BUILDING task to its outcome on the first poll,
        /// so tests never have to race a real polling loop: this mock
        /// models an instant build rather than a slow one.
        fn status(&self, task_id: u64) -> Result<TaskStatus, CoreError> {
            let mut tasks = self.tasks.lock().unwrap();
            let Some(status) = tasks.get_mut(&task_id) else {
                return Ok(TaskStatus::Pending);
            };
            if *status == TaskStatus::Building {
                let should_fail = self
                    .task_packages
                    .lock()
                    .unwrap()
                    .get(&task_id)
                    .map(|name| self.fail_packages.lock().unwrap().contains(name))
                    .unwrap_or(false);
                *status = if should_fail { TaskStatus::Failed } else { TaskStatus::Complete };
            }
            Ok(*status)
        }

        fn cancel(&self, task_id: u64) -> Result<bool, CoreError> {
            let mut tasks = self.tasks.lock().unwrap();
            if let Some(status) = tasks.get_mut(&task_id) {
                if !status.is_terminal() {
                    *status = TaskStatus::Canceled;
                }
            }
            Ok(true)
        }

        fn wait_for_repo(&self, tag: &str, _timeout: Duration) -> Result<bool, CoreError> {
            self.repo_waits.lock().unwrap().push(tag.to_string());
            Ok(true)
        }

        fn invalidate(&self, _tag: &str) {}
    }

    fn package_name_from_archive(archive_path: &str) -> String {
        std::path::Path::new(archive_path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(archive_path)
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_task_id_from_typical_output() {
        let stdout = "Created task: build\nTask ID: 12345\nWatching tasks...\n";
        assert_eq!(parse_task_id(stdout), Some(12345));
    }

    #[test]
    fn parses_known_status_aliases() {
        assert_eq!(parse_status("complete"), Some(TaskStatus::Complete));
        assert_eq!(parse_status("CLOSED"), Some(TaskStatus::Complete));
        assert_eq!(parse_status("cancelled"), Some(TaskStatus::Canceled));
        assert_eq!(parse_status("gibberish"), None);
    }

    #[test]
    fn transport_failure_detection_is_case_insensitive() {
        assert!(looks_like_transport_failure("Connection Refused by host"));
        assert!(!looks_like_transport_failure("package not found"));
    }

    #[test]
    fn mock_client_list_packages_reflects_available_set() {
        let client = mock::MockHubClient::with_available(["lib-bar", "lib-base"]);
        let packages = client.list_packages("tag").unwrap();
        assert!(packages.contains("lib-bar"));
        assert!(client.exists("lib-base", "tag").unwrap());
        assert!(!client.exists("lib-missing", "tag").unwrap());
    }
}
