use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CaptureError, Result};
use crate::manifest::DEFAULT_MANIFEST_NAME;
use crate::render::{RenderOptions, DEFAULT_ARGS_BUDGET, DEFAULT_RESULT_BUDGET};
use crate::resolver::{SessionFileResolver, SessionMatch};

pub const WORKSPACE_ENV: &str = "OPENCLAW_WORKSPACE";
const CONFIG_FILE_NAME: &str = "transcript-capture.toml";

/// Settings for capture, verify and prune runs.
///
/// Paths may start with `~/`; they are expanded when the config is resolved.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    pub agents_dir: String,
    /// `None` means `<workspace>/memory/agent-transcripts`.
    pub transcript_dir: Option<String>,
    pub manifest_name: String,
    pub log_extensions: Vec<String>,
    pub session_match: SessionMatch,
    pub include_messages: bool,
    pub args_budget: usize,
    pub result_budget: usize,
    pub lock_timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            agents_dir: default_agents_dir(),
            transcript_dir: None,
            manifest_name: DEFAULT_MANIFEST_NAME.to_string(),
            log_extensions: default_log_extensions(),
            session_match: SessionMatch::BestEffort,
            include_messages: true,
            args_budget: DEFAULT_ARGS_BUDGET,
            result_budget: DEFAULT_RESULT_BUDGET,
            lock_timeout_ms: 5000,
        }
    }
}

fn default_agents_dir() -> String {
    "~/.openclaw/agents".to_string()
}

fn default_workspace_dir() -> String {
    "~/.openclaw/workspace".to_string()
}

fn default_log_extensions() -> Vec<String> {
    vec!["jsonl".to_string(), "log".to_string()]
}

/// `~/.openclaw/transcript-capture.toml`
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".openclaw")
        .join(CONFIG_FILE_NAME)
}

pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Parse a config file.
pub fn load_config(path: &Path) -> Result<CaptureConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| CaptureError::io(path, e))?;
    toml::from_str(&raw).map_err(|e| CaptureError::Config {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Load `explicit` if given, else the default config file when it exists,
/// else built-in defaults.
pub fn load_config_or_default(explicit: Option<&Path>) -> Result<CaptureConfig> {
    match explicit {
        Some(path) => load_config(path),
        None => {
            let path = default_config_path();
            if path.is_file() {
                load_config(&path)
            } else {
                Ok(CaptureConfig::default())
            }
        }
    }
}

impl CaptureConfig {
    pub fn agents_dir(&self) -> PathBuf {
        expand_path(&self.agents_dir)
    }

    /// Where transcripts and the manifest live. Falls back to
    /// `$OPENCLAW_WORKSPACE/memory/agent-transcripts`.
    pub fn transcript_dir(&self) -> PathBuf {
        if let Some(dir) = &self.transcript_dir {
            return expand_path(dir);
        }
        let workspace = std::env::var(WORKSPACE_ENV)
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(default_workspace_dir);
        expand_path(&workspace).join("memory").join("agent-transcripts")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.transcript_dir().join(&self.manifest_name)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn resolver(&self) -> SessionFileResolver {
        SessionFileResolver::new(self.agents_dir(), self.log_extensions.clone())
    }

    pub fn render_options(&self, agent_id: &str, task: Option<String>) -> RenderOptions {
        RenderOptions {
            agent_id: agent_id.to_string(),
            task,
            include_messages: self.include_messages,
            args_budget: self.args_budget,
            result_budget: self.result_budget,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = CaptureConfig::default();
        assert_eq!(cfg.manifest_name, ".manifest.json");
        assert_eq!(cfg.log_extensions, vec!["jsonl", "log"]);
        assert_eq!(cfg.session_match, SessionMatch::BestEffort);
        assert!(cfg.include_messages);
        assert_eq!(cfg.args_budget, 200);
        assert_eq!(cfg.result_budget, 2000);
        assert_eq!(cfg.lock_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let cfg: CaptureConfig = toml::from_str(
            r#"
agents_dir = "/srv/agents"
session_match = "strict"
result_budget = 1000
"#,
        )
        .unwrap();
        assert_eq!(cfg.agents_dir(), PathBuf::from("/srv/agents"));
        assert_eq!(cfg.session_match, SessionMatch::Strict);
        assert_eq!(cfg.result_budget, 1000);
        assert_eq!(cfg.args_budget, 200);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result: std::result::Result<CaptureConfig, _> = toml::from_str("bogus = 1");
        assert!(result.is_err());
    }

    #[test]
    fn explicit_transcript_dir_wins() {
        let cfg = CaptureConfig {
            transcript_dir: Some("/data/transcripts".to_string()),
            ..Default::default()
        };
        assert_eq!(cfg.transcript_dir(), PathBuf::from("/data/transcripts"));
        assert_eq!(
            cfg.manifest_path(),
            PathBuf::from("/data/transcripts/.manifest.json")
        );
    }

    #[test]
    fn expand_path_leaves_absolute_paths_alone() {
        assert_eq!(expand_path("/abs/path"), PathBuf::from("/abs/path"));
    }

    #[test]
    fn expand_path_expands_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_path("~/x"), home.join("x"));
        }
    }

    #[test]
    fn load_config_reports_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.toml");
        std::fs::write(&path, "agents_dir = [").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, CaptureError::Config { .. }));
    }

    #[test]
    fn load_config_missing_explicit_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config_or_default(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(matches!(err, CaptureError::Io { .. }));
    }

    #[test]
    fn render_options_carry_budgets() {
        let cfg = CaptureConfig {
            include_messages: false,
            args_budget: 7,
            ..Default::default()
        };
        let opts = cfg.render_options("w", Some("t".to_string()));
        assert_eq!(opts.agent_id, "w");
        assert!(!opts.include_messages);
        assert_eq!(opts.args_budget, 7);
        assert_eq!(opts.task.as_deref(), Some("t"));
    }
}
