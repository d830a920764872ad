//! Single-instance guard for a run against a given archive cache
//! directory (SPEC_FULL.md §7): a file lock plus a small JSON state
//! file recording who holds it, so a second concurrent invocation
//! against the same cache directory fails fast with a clear message
//! instead of racing on partially-downloaded archives.

use anyhow::{Context, Result, bail};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const LOCK_FILE_NAME: &str = ".srpmgraph.lock";
const STATE_FILE_NAME: &str = ".srpmgraph-active.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildSessionKind {
    Analyze,
    Plan,
    Download,
    Build,
}

impl BuildSessionKind {
    fn as_str(self) -> &'static str {
        match self {
            BuildSessionKind::Analyze => "analyze",
            BuildSessionKind::Plan => "plan",
            BuildSessionKind::Download => "download",
            BuildSessionKind::Build => "build",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ActiveSessionEntry {
    pid: u32,
    target: String,
    #[serde(default = "default_session_kind")]
    session_kind: String,
    started_at_utc: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ActiveSessionState {
    entries: Vec<ActiveSessionEntry>,
}

fn default_session_kind() -> String {
    "build".to_string()
}

pub struct BuildSessionGuard {
    lock_file: fs::File,
    state_file: PathBuf,
    pid: u32,
}

impl BuildSessionGuard {
    /// Acquires the single-instance lock scoped to `cache_dir`. Fails
    /// immediately (no blocking wait) if another process already
    /// holds it.
    pub fn acquire(cache_dir: &Path, target: &str, session_kind: BuildSessionKind) -> Result<Self> {
        fs::create_dir_all(cache_dir)
            .with_context(|| format!("creating archive cache dir {}", cache_dir.to_string_lossy()))?;

        let lock_path = cache_dir.join(LOCK_FILE_NAME);
        let state_file = cache_dir.join(STATE_FILE_NAME);
        let mut lock_file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("opening lock file {}", lock_path.to_string_lossy()))?;

        if let Err(err) = lock_file.try_lock_exclusive() {
            if err.kind() == ErrorKind::WouldBlock {
                let active = load_state(&state_file).unwrap_or_default();
                let owner = active
                    .entries
                    .first()
                    .map(|entry| format!("pid={} target={} kind={}", entry.pid, entry.target, entry.session_kind))
                    .unwrap_or_else(|| "unknown".to_string());
                bail!(
                    "archive cache dir {} is already in use: {owner}",
                    cache_dir.to_string_lossy()
                );
            }
            return Err(err).with_context(|| format!("acquiring lock {}", lock_path.to_string_lossy()));
        }

        let pid = std::process::id();
        let entry = ActiveSessionEntry {
            pid,
            target: target.to_string(),
            session_kind: session_kind.as_str().to_string(),
            started_at_utc: chrono::Utc::now().to_rfc3339(),
        };
        write_state(&state_file, &ActiveSessionState { entries: vec![entry] })?;

        use std::io::Write as _;
        lock_file
            .set_len(0)
            .with_context(|| format!("truncating lock file {}", lock_path.to_string_lossy()))?;
        writeln!(lock_file, "pid={pid}")
            .with_context(|| format!("writing lock file {}", lock_path.to_string_lossy()))?;
        lock_file
            .flush()
            .with_context(|| format!("flushing lock file {}", lock_path.to_string_lossy()))?;

        Ok(Self {
            lock_file,
            state_file,
            pid,
        })
    }
}

impl Drop for BuildSessionGuard {
    fn drop(&mut self) {
        let mut state = load_state(&self.state_file).unwrap_or_default();
        state.entries.retain(|entry| entry.pid != self.pid);
        if state.entries.is_empty() {
            let _ = fs::remove_file(&self.state_file);
        } else {
            let _ = write_state(&self.state_file, &state);
        }
        let _ = self.lock_file.unlock();
    }
}

fn load_state(path: &Path) -> Result<ActiveSessionState> {
    if !path.exists() {
        return Ok(ActiveSessionState::default());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading active session state {}", path.to_string_lossy()))?;
    if raw.trim().is_empty() {
        return Ok(ActiveSessionState::default());
    }
    serde_json::from_str(&raw).with_context(|| format!("parsing active session state {}", path.to_string_lossy()))
}

fn write_state(path: &Path, state: &ActiveSessionState) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let payload = serde_json::to_vec_pretty(state).context("serializing active session state")?;
    fs::write(&tmp, payload).with_context(|| format!("writing temp state {}", tmp.to_string_lossy()))?;
    fs::rename(&tmp, path).with_context(|| format!("committing active session state {}", path.to_string_lossy()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tempdir(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "srpmgraph-build-lock-test-{}-{}-{}",
            name,
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        fs::create_dir_all(&path).expect("create temp test dir");
        path
    }

    #[test]
    fn acquire_then_drop_clears_state_file() {
        let dir = tempdir("acquire-drop");
        {
            let guard = BuildSessionGuard::acquire(&dir, "samtools", BuildSessionKind::Build).expect("acquire lock");
            assert!(dir.join(STATE_FILE_NAME).exists());
            drop(guard);
        }
        assert!(!dir.join(STATE_FILE_NAME).exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn second_acquire_while_held_fails() {
        let dir = tempdir("double-acquire");
        let _first = BuildSessionGuard::acquire(&dir, "samtools", BuildSessionKind::Build).expect("first acquire");
        let second = BuildSessionGuard::acquire(&dir, "samtools", BuildSessionKind::Build);
        assert!(second.is_err());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn load_state_backfills_defaults_for_legacy_entries() {
        let dir = tempdir("legacy-state");
        let state_file = dir.join(STATE_FILE_NAME);
        fs::write(
            &state_file,
            r#"{"entries":[{"pid":42,"target":"x","started_at_utc":"2026-03-01T00:00:00Z"}]}"#,
        )
        .expect("write legacy state");

        let loaded = load_state(&state_file).expect("load state");
        assert_eq!(loaded.entries.len(), 1);
        assert_eq!(loaded.entries[0].session_kind, "build");

        let _ = fs::remove_dir_all(&dir);
    }
}
