//! Typed domain error kinds, collected as a single `thiserror` enum.
//!
//! Anything not one of these named categories (filesystem races,
//! unexpected I/O) is surfaced as `anyhow::Error` at the call site,
//! reserving domain errors for domain boundaries and `anyhow::Context`
//! for everything else.

use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubBuildErrorKind {
    SubmitFailed,
    TaskFailed,
    Timeout,
    Canceled,
}

impl std::fmt::Display for HubBuildErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HubBuildErrorKind::SubmitFailed => "submit-failed",
            HubBuildErrorKind::TaskFailed => "task-failed",
            HubBuildErrorKind::Timeout => "timeout",
            HubBuildErrorKind::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Error)]
pub enum CoreError {
    #[error("invalid archive {path}: {reason}")]
    InvalidArchive { path: String, reason: String },

    #[error("spec parse error in {source}: {reason}")]
    SpecParse { source: String, reason: String },

    #[error("name resolution exhausted for token '{token}'")]
    NameResolution { token: String },

    #[error("archive not found for package '{name}' (tried {attempted} candidate/source combinations)")]
    ArchiveNotFound { name: String, attempted: usize },

    #[error("circular dependency among {0:?}", .cycle)]
    CircularDependency { cycle: BTreeSet<String> },

    #[error("hub connection error: {0}")]
    HubConnection(String),

    #[error("hub build error ({kind}): {message}")]
    HubBuild {
        kind: HubBuildErrorKind,
        message: String,
    },
}

impl CoreError {
    /// Stable process exit code for the CLI binary.
    pub fn exit_code(&self) -> i32 {
        match self {
            CoreError::CircularDependency { .. } => 2,
            CoreError::ArchiveNotFound { .. } => 3,
            CoreError::HubConnection(_) => 4,
            CoreError::HubBuild { .. } => 5,
            _ => 1,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
