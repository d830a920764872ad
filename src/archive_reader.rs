//! §4.B ArchiveReader — queries an SRPM archive's header fields and
//! extracts the embedded spec file, via the host's `rpm` tool.

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;
use tracing::{debug, instrument};

use crate::error::CoreError;
use crate::model::PackageInfo;
use crate::spec_analyzer::analyze_spec_text;

/// Magic-number check for an RPM archive (§6 Inputs: "magic-number
/// validated"). RPM files start with the 4-byte lead magic `0xedabeedb`.
const RPM_MAGIC: [u8; 4] = [0xed, 0xab, 0xee, 0xdb];

fn validate_rpm_magic(path: &Path) -> Result<(), CoreError> {
    let bytes = std::fs::read(path).map_err(|err| CoreError::InvalidArchive {
        path: path.display().to_string(),
        reason: format!("cannot read archive: {err}"),
    })?;
    if bytes.len() < 4 || bytes[0..4] != RPM_MAGIC {
        return Err(CoreError::InvalidArchive {
            path: path.display().to_string(),
            reason: "not an RPM source package (bad magic)".to_string(),
        });
    }
    Ok(())
}

/// `requires(archivePath) → sequence of string`: the raw
/// build-time requirement tokens recorded in the archive header, via
/// `rpm -qp --requires`.
#[instrument(skip_all, fields(archive = %archive_path.display()))]
pub fn requires(archive_path: &Path) -> Result<Vec<String>, CoreError> {
    validate_rpm_magic(archive_path)?;

    let output = Command::new("rpm")
        .arg("-qp")
        .arg("--requires")
        .arg(archive_path)
        .output()
        .map_err(|err| CoreError::InvalidArchive {
            path: archive_path.display().to_string(),
            reason: format!("failed to invoke rpm: {err}"),
        })?;

    if !output.status.success() {
        return Err(CoreError::InvalidArchive {
            path: archive_path.display().to_string(),
            reason: format!(
                "rpm -qp --requires exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            ),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let tokens = stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter(|l| !l.starts_with("rpmlib("))
        .map(str::to_string)
        .collect();
    Ok(tokens)
}

/// `info(archivePath) → PackageInfo`: unpacks the archive into
/// a scoped scratch directory, locates the single `.spec` file, and
/// delegates to `spec_analyzer`. The scratch directory is always
/// released, on every exit path, via `TempDir`'s drop.
#[instrument(skip_all, fields(archive = %archive_path.display()))]
pub fn info(archive_path: &Path) -> Result<PackageInfo, CoreError> {
    validate_rpm_magic(archive_path)?;
    let scratch = TempDir::new().map_err(|err| CoreError::InvalidArchive {
        path: archive_path.display().to_string(),
        reason: format!("failed to create scratch directory: {err}"),
    })?;

    unpack_into(archive_path, scratch.path())?;
    let spec_path = locate_spec_file(scratch.path(), archive_path)?;
    let payload = std::fs::read_to_string(&spec_path).map_err(|err| CoreError::InvalidArchive {
        path: archive_path.display().to_string(),
        reason: format!("failed to read extracted spec {}: {err}", spec_path.display()),
    })?;

    let (info, warnings) = analyze_spec_text(&spec_path.display().to_string(), &payload)?;
    for warning in warnings {
        tracing::warn!(%warning, "unresolved macro while analyzing extracted spec");
    }
    debug!(package = %info.name, "extracted PackageInfo from archive");
    Ok(info)
    // `scratch` is dropped (and removed) here regardless of outcome.
}

fn unpack_into(archive_path: &Path, dest: &Path) -> Result<(), CoreError> {
    // rpm2cpio archive.src.rpm | cpio -idmv, run from `dest`.
    let rpm2cpio = Command::new("rpm2cpio")
        .arg(archive_path)
        .stdout(std::process::Stdio::piped())
        .spawn()
        .map_err(|err| CoreError::InvalidArchive {
            path: archive_path.display().to_string(),
            reason: format!("failed to invoke rpm2cpio: {err}"),
        })?;

    let Some(stdout) = rpm2cpio.stdout else {
        return Err(CoreError::InvalidArchive {
            path: archive_path.display().to_string(),
            reason: "rpm2cpio produced no stdout pipe".to_string(),
        });
    };

    let cpio_status = Command::new("cpio")
        .arg("-idm")
        .current_dir(dest)
        .stdin(stdout)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map_err(|err| CoreError::InvalidArchive {
            path: archive_path.display().to_string(),
            reason: format!("failed to invoke cpio: {err}"),
        })?;

    if !cpio_status.success() {
        return Err(CoreError::InvalidArchive {
            path: archive_path.display().to_string(),
            reason: format!("cpio extraction exited with {cpio_status}"),
        });
    }
    Ok(())
}

fn locate_spec_file(scratch_dir: &Path, archive_path: &Path) -> Result<PathBuf, CoreError> {
    let mut found = Vec::new();
    collect_spec_files(scratch_dir, &mut found);
    match found.len() {
        1 => Ok(found.into_iter().next().unwrap()),
        0 => Err(CoreError::InvalidArchive {
            path: archive_path.display().to_string(),
            reason: "archive did not contain a .spec file".to_string(),
        }),
        n => Err(CoreError::InvalidArchive {
            path: archive_path.display().to_string(),
            reason: format!("archive contained {n} .spec files, expected exactly one"),
        }),
    }
}

fn collect_spec_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_spec_files(&path, out);
        } else if path.extension().and_then(|e| e.to_str()) == Some("spec") {
            out.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_rpm_input() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("not-an-rpm.txt");
        std::fs::write(&path, b"definitely not an rpm").unwrap();
        let err = requires(&path).unwrap_err();
        assert!(matches!(err, CoreError::InvalidArchive { .. }));
    }

    #[test]
    fn rejects_missing_file() {
        let path = PathBuf::from("/nonexistent/archive.src.rpm");
        let err = requires(&path).unwrap_err();
        assert!(matches!(err, CoreError::InvalidArchive { .. }));
    }

    #[test]
    fn locate_spec_file_requires_exactly_one() {
        let dir = TempDir::new().unwrap();
        let archive_stub = dir.path().join("stub.src.rpm");
        let err = locate_spec_file(dir.path(), &archive_stub).unwrap_err();
        assert!(matches!(err, CoreError::InvalidArchive { .. }));

        std::fs::write(dir.path().join("a.spec"), "Name: a\n").unwrap();
        let found = locate_spec_file(dir.path(), &archive_stub).unwrap();
        assert_eq!(found.file_name().unwrap(), "a.spec");

        std::fs::write(dir.path().join("b.spec"), "Name: b\n").unwrap();
        let err = locate_spec_file(dir.path(), &archive_stub).unwrap_err();
        assert!(matches!(err, CoreError::InvalidArchive { .. }));
    }
}
