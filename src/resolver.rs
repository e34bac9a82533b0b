use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Deserialize;

use crate::error::{CaptureError, Result};

/// What to do when a session id is given but no log filename contains it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMatch {
    /// Fall back to the most recently modified log.
    #[default]
    BestEffort,
    /// Fail with `SessionNotFound`.
    Strict,
}

/// Finds the session log to read for an agent.
///
/// Logs live at `<agents_dir>/<agent_id>/sessions/*.<ext>`.
#[derive(Debug, Clone)]
pub struct SessionFileResolver {
    agents_dir: PathBuf,
    extensions: Vec<String>,
}

#[derive(Debug, Clone)]
struct Candidate {
    path: PathBuf,
    name: String,
    modified: SystemTime,
}

impl SessionFileResolver {
    pub fn new(agents_dir: impl Into<PathBuf>, extensions: Vec<String>) -> Self {
        Self {
            agents_dir: agents_dir.into(),
            extensions,
        }
    }

    pub fn sessions_dir(&self, agent_id: &str) -> PathBuf {
        self.agents_dir.join(agent_id).join("sessions")
    }

    pub async fn resolve(
        &self,
        agent_id: &str,
        session_id: Option<&str>,
        policy: SessionMatch,
    ) -> Result<PathBuf> {
        validate_agent_id(agent_id)?;
        let dir = self.sessions_dir(agent_id);
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(CaptureError::AgentDirNotFound {
                    agent_id: agent_id.to_string(),
                    path: dir,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CaptureError::AgentDirNotFound {
                    agent_id: agent_id.to_string(),
                    path: dir,
                })
            }
            Err(e) => return Err(CaptureError::io(dir, e)),
        }

        let candidates = self.candidates(&dir).await?;
        let Some(newest) = candidates.first() else {
            return Err(CaptureError::NoSessionFiles { path: dir });
        };

        let Some(session_id) = session_id else {
            tracing::debug!("using most recent session log {}", newest.path.display());
            return Ok(newest.path.clone());
        };

        if let Some(hit) = candidates.iter().find(|c| c.name.contains(session_id)) {
            tracing::debug!("session {session_id} resolved to {}", hit.path.display());
            return Ok(hit.path.clone());
        }

        match policy {
            SessionMatch::Strict => Err(CaptureError::SessionNotFound {
                session_id: session_id.to_string(),
                path: dir,
            }),
            SessionMatch::BestEffort => {
                tracing::warn!(
                    "no session log matches {session_id:?}, falling back to {}",
                    newest.path.display()
                );
                Ok(newest.path.clone())
            }
        }
    }

    /// Log files in `dir`, newest first, ties broken by path.
    async fn candidates(&self, dir: &Path) -> Result<Vec<Candidate>> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| CaptureError::io(dir, e))?;

        let mut out = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CaptureError::io(dir, e))?
        {
            let path = entry.path();
            if !self.has_log_extension(&path) {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            out.push(Candidate {
                name: entry.file_name().to_string_lossy().into_owned(),
                path,
                modified,
            });
        }

        out.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.path.cmp(&b.path)));
        Ok(out)
    }

    fn has_log_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|want| want == ext))
    }
}

/// Agent ids become a directory name and a filename prefix, so they must be
/// a single plain path component.
pub fn validate_agent_id(agent_id: &str) -> Result<()> {
    let bad = agent_id.is_empty()
        || agent_id == "."
        || agent_id.contains("..")
        || agent_id.contains(['/', '\\', '\0']);
    if bad {
        return Err(CaptureError::InvalidAgentId {
            agent_id: agent_id.to_string(),
        });
    }
    Ok(())
}

/// Split a hook session key into agent id and optional session id.
///
/// `agent:<id>:subagent:<session>` gives both parts, `agent:<id>` only the
/// agent, and anything else is taken as a bare agent id.
pub fn parse_session_key(key: &str) -> (String, Option<String>) {
    let parts: Vec<&str> = key.split(':').collect();
    match parts.as_slice() {
        ["agent", agent, "subagent", session, ..] if !agent.is_empty() && !session.is_empty() => {
            (agent.to_string(), Some(session.to_string()))
        }
        ["agent", agent, ..] if !agent.is_empty() => (agent.to_string(), None),
        _ => (key.to_string(), None),
    }
}
