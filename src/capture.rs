use std::io::BufReader;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::config::CaptureConfig;
use crate::error::{CaptureError, Result};
use crate::manifest::{write_atomic, IntegrityManifest};
use crate::parser::{LogStreamParser, ParseStats};
use crate::render::render_markdown;
use crate::transcript::Transcript;

#[derive(Debug, Clone, Default)]
pub struct CaptureRequest {
    pub agent_id: String,
    pub session_id: Option<String>,
    pub task: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    /// The session log that was read.
    pub source: PathBuf,
    pub path: PathBuf,
    pub filename: String,
    pub sha256: String,
    pub size: u64,
    pub stats: ParseStats,
    pub manifest_path: PathBuf,
}

/// `<agent>-<YYYY-MM-DDTHH-MM-SS>.md`
pub fn artifact_filename(agent_id: &str, now: DateTime<Utc>) -> String {
    format!("{agent_id}-{}.md", now.format("%Y-%m-%dT%H-%M-%S"))
}

/// Parse a session log from disk into a transcript.
pub fn read_transcript(path: &Path) -> Result<(Transcript, ParseStats)> {
    let file = std::fs::File::open(path).map_err(|e| CaptureError::io(path, e))?;
    let mut parser = LogStreamParser::new(BufReader::new(file));
    let transcript = Transcript::from_entries(parser.by_ref());
    Ok((transcript, parser.stats()))
}

/// Resolve, parse, render, write and record one transcript.
///
/// The manifest is only touched after the artifact has been written in full.
pub async fn capture(config: &CaptureConfig, request: &CaptureRequest) -> Result<CaptureOutcome> {
    let source = config
        .resolver()
        .resolve(
            &request.agent_id,
            request.session_id.as_deref(),
            config.session_match,
        )
        .await?;
    tracing::info!("parsing {}", source.display());

    let (transcript, stats) = {
        let log_path = source.clone();
        tokio::task::spawn_blocking(move || read_transcript(&log_path))
            .await
            .map_err(|e| CaptureError::io(&source, std::io::Error::other(e)))??
    };
    if stats.malformed > 0 {
        tracing::warn!(
            malformed = stats.malformed,
            "skipped malformed lines in {}",
            source.display()
        );
    }

    let opts = config.render_options(&request.agent_id, request.task.clone());
    let markdown = render_markdown(&transcript, &opts);

    let dir = config.transcript_dir();
    let filename = artifact_filename(&request.agent_id, Utc::now());
    let path = dir.join(&filename);
    write_atomic(&path, markdown.as_bytes()).await?;
    tracing::info!("transcript saved: {}", path.display());

    let manifest = IntegrityManifest::new(&dir, &config.manifest_name, config.lock_timeout());
    let session_id = transcript.session_id().unwrap_or("unknown");
    let entry = manifest
        .record(&filename, markdown.as_bytes(), &request.agent_id, session_id)
        .await?;

    Ok(CaptureOutcome {
        source,
        path,
        filename,
        sha256: entry.sha256,
        size: entry.size,
        stats,
        manifest_path: manifest.path().to_path_buf(),
    })
}
