//! §4.H BuildOrchestrator — drives a leveled build plan to completion
//! against a `HubClient`, level by level, with a bounded worker pool
//! per level and cooperative cancellation.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::dependency_resolver::{self, ArchiveResolver, DependencyResolver};
use crate::error::CoreError;
use crate::hub_client::{HubClient, SubmitFlags};
use crate::model::{BuildChain, BuildResult, BuildTask, DependencyGraph, TaskStatus};
use crate::name_canonicalizer::NameCanonicalizer;

/// Bounded backoff schedule for status polling: short at first, capped
/// at 30s, matching the spirit of §5's "bounded backoff schedule".
const POLL_BACKOFF_STEPS_SECS: &[u64] = &[1, 2, 5, 10, 15, 30];

pub struct BuildOrchestrator<'a> {
    hub: &'a dyn HubClient,
    hub_build_tag: String,
    hub_target: String,
    max_parallel_per_level: usize,
    submit_flags: SubmitFlags,
    wait_for_repo_timeout: Duration,
    cancellation: Arc<AtomicBool>,
}

impl<'a> BuildOrchestrator<'a> {
    pub fn new(
        hub: &'a dyn HubClient,
        hub_build_tag: impl Into<String>,
        hub_target: impl Into<String>,
        max_parallel_per_level: usize,
        submit_flags: SubmitFlags,
        wait_for_repo_timeout: Duration,
    ) -> Self {
        Self::with_cancellation(
            hub,
            hub_build_tag,
            hub_target,
            max_parallel_per_level,
            submit_flags,
            wait_for_repo_timeout,
            Arc::new(AtomicBool::new(false)),
        )
    }

    /// Same as `new`, but takes a caller-owned cancellation flag so a
    /// SIGINT handler can be wired up before the (blocking) build call
    /// is made.
    pub fn with_cancellation(
        hub: &'a dyn HubClient,
        hub_build_tag: impl Into<String>,
        hub_target: impl Into<String>,
        max_parallel_per_level: usize,
        submit_flags: SubmitFlags,
        wait_for_repo_timeout: Duration,
        cancellation: Arc<AtomicBool>,
    ) -> Self {
        Self {
            hub,
            hub_build_tag: hub_build_tag.into(),
            hub_target: hub_target.into(),
            max_parallel_per_level: max_parallel_per_level.max(1),
            submit_flags,
            wait_for_repo_timeout,
            cancellation,
        }
    }

    /// A handle external code (e.g. a SIGINT handler) can flip to
    /// request cooperative cancellation.
    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        self.cancellation.clone()
    }

    /// `buildWithDeps(archivePath) → BuildResult`: extracts the
    /// root `PackageInfo`, builds the graph, then drives every level
    /// followed by the root.
    pub fn build_with_deps(
        &self,
        root_name: &str,
        root_archive_path: &str,
        canonicalizer: &NameCanonicalizer,
        resolve_archive: &dyn ArchiveResolver,
    ) -> Result<BuildResult, CoreError> {
        let started = Instant::now();
        let resolver = DependencyResolver::new(self.hub, canonicalizer, self.hub_build_tag.clone());

        let mut graph = resolver.build_graph(root_name, root_archive_path, resolve_archive)?;
        resolver.mark_availability(&mut graph)?;
        let order = dependency_resolver::topological_sort(&graph)?;
        let chain = dependency_resolver::build_chain(&mut graph, &order);

        self.drive_chain(&graph, &chain, root_name, started)
    }

    /// `buildSingle(archive)`: skips graph construction.
    pub fn build_single(&self, package_name: &str, archive_path: &str) -> Result<BuildResult, CoreError> {
        let started = Instant::now();
        let task = self.submit_and_track(package_name, archive_path);
        Ok(BuildResult::finalize(vec![task], started.elapsed().as_secs_f64()))
    }

    /// `buildChain(sequenceOfArchives)`: builds archives one
    /// level at a time in the order given, without graph construction.
    pub fn build_chain_of(&self, archives: &[(String, String)]) -> Result<BuildResult, CoreError> {
        let started = Instant::now();
        let mut tasks = Vec::new();
        for (package_name, archive_path) in archives {
            let task = self.submit_and_track(package_name, archive_path);
            let failed = !task.status.is_terminal() || task.status != TaskStatus::Complete;
            tasks.push(task);
            if failed {
                break;
            }
        }
        Ok(BuildResult::finalize(tasks, started.elapsed().as_secs_f64()))
    }

    fn drive_chain(&self, graph: &DependencyGraph, chain: &BuildChain, root_name: &str, started: Instant) -> Result<BuildResult, CoreError> {
        let mut all_tasks = Vec::new();

        // The root is always its own, final, singleton level;
        // the levels preceding it are driven here, and the root is
        // submitted separately afterward (§4.H step 4, §5 ordering
        // guarantee 2).
        let dependency_levels: Vec<&std::collections::BTreeSet<String>> =
            chain.iter().filter(|level| !(level.len() == 1 && level.contains(root_name))).collect();

        for level in dependency_levels {
            if self.cancellation.load(Ordering::SeqCst) {
                warn!("cancellation requested before level submission");
                return Ok(self.cancel_and_finish(all_tasks, started));
            }

            let level_tasks = self.run_level(level, graph);
            let level_failed = level_tasks.iter().any(|t| t.status != TaskStatus::Complete);
            all_tasks.extend(level_tasks);

            if level_failed {
                error!(level = ?level, "level ended with a non-COMPLETE task, aborting run");
                return Ok(BuildResult::finalize(all_tasks, started.elapsed().as_secs_f64()));
            }

            if !self.hub.wait_for_repo(&self.hub_build_tag, self.wait_for_repo_timeout)? {
                warn!(tag = self.hub_build_tag, "repo regeneration timed out");
            }
        }

        if self.cancellation.load(Ordering::SeqCst) {
            return Ok(self.cancel_and_finish(all_tasks, started));
        }

        let root_node = &graph[root_name];
        if let Some(archive_path) = &root_node.archive_path {
            let root_task = self.submit_and_track(root_name, archive_path);
            all_tasks.push(root_task);
        }

        Ok(BuildResult::finalize(all_tasks, started.elapsed().as_secs_f64()))
    }

    fn cancel_and_finish(&self, mut tasks: Vec<BuildTask>, started: Instant) -> BuildResult {
        for task in tasks.iter_mut() {
            if !task.status.is_terminal() {
                task.status = TaskStatus::Canceled;
            }
        }
        BuildResult::finalize(tasks, started.elapsed().as_secs_f64())
    }

    /// Submits every node in `level` (up to `max_parallel_per_level`
    /// concurrently), polls each to a terminal status, and — as soon as
    /// any task in the level ends non-COMPLETE — flips a level-wide
    /// flag and calls `hub.cancel()` on every other task of the level
    /// still in flight, rather than waiting for the rest of the current
    /// chunk to finish on its own (§8 S6).
    fn run_level(&self, level: &std::collections::BTreeSet<String>, graph: &DependencyGraph) -> Vec<BuildTask> {
        let names: Vec<String> = level.iter().cloned().collect();
        let results: Arc<Mutex<Vec<BuildTask>>> = Arc::new(Mutex::new(Vec::new()));
        let level_failed = Arc::new(AtomicBool::new(false));
        let in_flight: Arc<Mutex<HashSet<u64>>> = Arc::new(Mutex::new(HashSet::new()));

        thread::scope(|scope| {
            let chunks = names.chunks(self.max_parallel_per_level.max(1));
            for chunk in chunks {
                let mut handles = Vec::new();
                for name in chunk {
                    let archive_path = graph[name].archive_path.clone().unwrap_or_default();
                    let results = results.clone();
                    let level_failed = level_failed.clone();
                    let in_flight = in_flight.clone();
                    let name = name.clone();
                    handles.push(scope.spawn(move || {
                        let task = self.submit_and_track_inner(&name, &archive_path, &level_failed, Some(&in_flight));
                        if task.status != TaskStatus::Complete {
                            if !level_failed.swap(true, Ordering::SeqCst) {
                                warn!(package = name, status = ?task.status, "level task failed, canceling siblings");
                            }
                            self.cancel_tracked(&in_flight);
                        }
                        results.lock().unwrap().push(task);
                    }));
                }
                for handle in handles {
                    let _ = handle.join();
                }
                if level_failed.load(Ordering::SeqCst) {
                    break;
                }
            }
        });

        let mut tasks = Arc::try_unwrap(results).unwrap().into_inner().unwrap();
        tasks.sort_by(|a, b| a.package_name.cmp(&b.package_name));
        tasks
    }

    /// Best-effort cancellation of every task id still registered in
    /// `in_flight` — called as soon as a level sibling fails.
    fn cancel_tracked(&self, in_flight: &Mutex<HashSet<u64>>) {
        let ids: Vec<u64> = in_flight.lock().unwrap().iter().copied().collect();
        for task_id in ids {
            let _ = self.hub.cancel(task_id);
        }
    }

    /// Submits one package and polls its task to a terminal status
    /// (§4.H state machine: `PENDING → BUILDING → {COMPLETE | FAILED |
    /// CANCELED}`).
    fn submit_and_track(&self, package_name: &str, archive_path: &str) -> BuildTask {
        self.submit_and_track_inner(package_name, archive_path, &AtomicBool::new(false), None)
    }

    /// As `submit_and_track`, but also bails out early (without
    /// submitting) once `level_failed` is set, and — while polling —
    /// registers its task id in `in_flight` so a sibling's failure can
    /// reach it via `hub.cancel()`.
    fn submit_and_track_inner(
        &self,
        package_name: &str,
        archive_path: &str,
        level_failed: &AtomicBool,
        in_flight: Option<&Mutex<HashSet<u64>>>,
    ) -> BuildTask {
        let mut task = BuildTask::new(package_name, archive_path, &self.hub_target);

        if self.cancellation.load(Ordering::SeqCst) || level_failed.load(Ordering::SeqCst) {
            task.status = TaskStatus::Canceled;
            return task;
        }

        let task_id = match self.hub.submit_build(&self.hub_target, archive_path, self.submit_flags) {
            Ok(id) => id,
            Err(err) => {
                task.status = TaskStatus::Failed;
                task.error_message = Some(err.to_string());
                return task;
            }
        };
        task.task_id = Some(task_id);
        task.status = TaskStatus::Building;
        info!(package = package_name, task_id, "build submitted");

        if self.submit_flags.no_wait {
            return task;
        }

        if let Some(set) = in_flight {
            set.lock().unwrap().insert(task_id);
        }
        self.poll_until_terminal_inner(&mut task, task_id, level_failed);
        if let Some(set) = in_flight {
            set.lock().unwrap().remove(&task_id);
        }
        task
    }

    fn poll_until_terminal(&self, task: &mut BuildTask, task_id: u64) {
        self.poll_until_terminal_inner(task, task_id, &AtomicBool::new(false));
    }

    fn poll_until_terminal_inner(&self, task: &mut BuildTask, task_id: u64, level_failed: &AtomicBool) {
        let mut step = 0usize;
        loop {
            if self.cancellation.load(Ordering::SeqCst) || level_failed.load(Ordering::SeqCst) {
                let _ = self.hub.cancel(task_id);
                task.status = TaskStatus::Canceled;
                return;
            }
            match self.hub.status(task_id) {
                Ok(status) => {
                    task.status = status;
                    if status.is_terminal() {
                        return;
                    }
                }
                Err(err) => {
                    task.status = TaskStatus::Failed;
                    task.error_message = Some(err.to_string());
                    return;
                }
            }
            let delay = POLL_BACKOFF_STEPS_SECS[step.min(POLL_BACKOFF_STEPS_SECS.len() - 1)];
            thread::sleep(Duration::from_secs(delay));
            step += 1;
        }
    }

    /// Best-effort cancellation of every task still tracked, used by
    /// a SIGINT handler driving `cancellation_flag()`.
    pub fn cancel_in_flight(&self, task_ids: &HashSet<u64>) {
        self.cancellation.store(true, Ordering::SeqCst);
        for task_id in task_ids {
            let _ = self.hub.cancel(*task_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub_client::mock::MockHubClient;
    use std::collections::BTreeMap;

    fn graph_with_levels() -> (DependencyGraph, BuildChain) {
        use crate::model::DependencyNode;
        let mut l1 = DependencyNode::new("L1");
        l1.archive_path = Some("/archives/L1.src.rpm".to_string());
        l1.build_order = 0;
        let mut l2 = DependencyNode::new("L2");
        l2.archive_path = Some("/archives/L2.src.rpm".to_string());
        l2.build_order = 0;
        let mut root = DependencyNode::new("R");
        root.archive_path = Some("/archives/R.src.rpm".to_string());
        root.dependencies = ["L1".to_string(), "L2".to_string()].into_iter().collect();
        root.build_order = 1;

        let graph: DependencyGraph = BTreeMap::from([
            ("L1".to_string(), l1),
            ("L2".to_string(), l2),
            ("R".to_string(), root),
        ]);
        let chain: BuildChain = vec![
            std::collections::BTreeSet::from(["L1".to_string(), "L2".to_string()]),
            std::collections::BTreeSet::from(["R".to_string()]),
        ];
        (graph, chain)
    }

    /// §8 S5: orchestration happy path. `MockHubClient::status`
    /// resolves a BUILDING task on its first poll, so this models an
    /// instant build rather than exercising the backoff schedule.
    #[test]
    fn s5_happy_path_builds_all_and_root_last() {
        let hub = MockHubClient::default();
        let orchestrator = BuildOrchestrator::new(&hub, "tag", "target", 2, SubmitFlags::default(), Duration::from_secs(1));
        let (graph, chain) = graph_with_levels();

        let result = orchestrator.drive_chain(&graph, &chain, "R", Instant::now()).unwrap();
        assert!(result.success);
        assert_eq!(result.built_packages.last(), Some(&"R".to_string()));
        assert_eq!(result.built_packages.len(), 3);
        assert_eq!(hub.repo_waits.lock().unwrap().len(), 1);
    }

    /// §8 S6: orchestration failure — L2 fails, R is never submitted.
    #[test]
    fn s6_level_failure_skips_root() {
        let hub = MockHubClient::default();
        hub.fail("L2");
        let orchestrator = BuildOrchestrator::new(&hub, "tag", "target", 2, SubmitFlags::default(), Duration::from_secs(1));
        let (graph, chain) = graph_with_levels();

        let result = orchestrator.drive_chain(&graph, &chain, "R", Instant::now()).unwrap();
        assert!(!result.success);
        assert!(result.failed_packages.contains(&"L2".to_string()));
        assert!(!result.built_packages.contains(&"R".to_string()));
    }
}
