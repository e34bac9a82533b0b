use std::path::PathBuf;

/// Failures that end a capture, verify or prune run.
///
/// Malformed log lines and integrity mismatches are not represented here:
/// the parser skips the former and `manifest::VerifyStatus` reports the latter.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("invalid agent id {agent_id:?}: must be a single path component")]
    InvalidAgentId { agent_id: String },

    #[error("no sessions directory for agent {agent_id}: {}", path.display())]
    AgentDirNotFound { agent_id: String, path: PathBuf },

    #[error("no session log files in {}", path.display())]
    NoSessionFiles { path: PathBuf },

    #[error("no session log matching {session_id:?} in {}", path.display())]
    SessionNotFound { session_id: String, path: PathBuf },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("manifest {} is not valid JSON: {source}", path.display())]
    ManifestCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("manifest {} is locked by another process", path.display())]
    ManifestLocked { path: PathBuf },

    #[error("invalid config {}: {message}", path.display())]
    Config { path: PathBuf, message: String },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CaptureError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CaptureError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for the resolution failures (missing directory, no files, no match).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CaptureError::AgentDirNotFound { .. }
                | CaptureError::NoSessionFiles { .. }
                | CaptureError::SessionNotFound { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CaptureError>;
