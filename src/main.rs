use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use transcript_capture::capture::{capture, CaptureRequest};
use transcript_capture::config::{load_config_or_default, CaptureConfig};
use transcript_capture::manifest::{IntegrityManifest, VerifyStatus};
use transcript_capture::resolver::{parse_session_key, SessionMatch};

#[derive(Parser)]
#[command(
    name = "transcript-capture",
    version,
    about = "Capture tamper-evident transcripts of agent sessions"
)]
struct Cli {
    /// Verify every recorded transcript (same as the `verify` command)
    #[arg(long)]
    verify: bool,

    /// Config file (default: ~/.openclaw/transcript-capture.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Root directory holding `<agent>/sessions/` logs
    #[arg(long, global = true)]
    agents_dir: Option<PathBuf>,

    /// Directory for transcripts and the integrity manifest
    #[arg(long, global = true)]
    transcript_dir: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Render a session log to markdown and record its hash
    Capture {
        /// Agent id, or a session key like `agent:<id>:subagent:<session>`
        agent: String,
        /// Session id to match against log filenames
        session_id: Option<String>,
        /// Task description for the transcript header
        #[arg(long)]
        task: Option<String>,
        /// Fail instead of falling back when no log matches the session id
        #[arg(long)]
        strict_session: bool,
        /// Leave out the per-message section
        #[arg(long)]
        no_messages: bool,
    },
    /// Re-hash every transcript in the manifest
    Verify,
    /// Remove manifest entries whose transcript file is gone
    Prune,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    if cli.verify && cli.command.is_some() {
        anyhow::bail!("--verify cannot be combined with a subcommand");
    }

    let mut config = load_config_or_default(cli.config.as_deref())?;
    apply_overrides(&mut config, &cli);

    match cli.command {
        Some(Commands::Capture {
            agent,
            session_id,
            task,
            strict_session,
            no_messages,
        }) => {
            if strict_session {
                config.session_match = SessionMatch::Strict;
            }
            if no_messages {
                config.include_messages = false;
            }
            cmd_capture(&config, &agent, session_id, task).await
        }
        Some(Commands::Verify) => cmd_verify(&config).await,
        Some(Commands::Prune) => cmd_prune(&config).await,
        None if cli.verify => cmd_verify(&config).await,
        None => anyhow::bail!("no command given; run `capture <agentId>` or `--verify`"),
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn apply_overrides(config: &mut CaptureConfig, cli: &Cli) {
    if let Some(dir) = &cli.agents_dir {
        config.agents_dir = dir.to_string_lossy().into_owned();
    }
    if let Some(dir) = &cli.transcript_dir {
        config.transcript_dir = Some(dir.to_string_lossy().into_owned());
    }
}

async fn cmd_capture(
    config: &CaptureConfig,
    agent: &str,
    session_id: Option<String>,
    task: Option<String>,
) -> Result<ExitCode> {
    let (agent_id, key_session) = parse_session_key(agent);
    let request = CaptureRequest {
        agent_id,
        session_id: session_id.or(key_session),
        task,
    };

    let outcome = capture(config, &request)
        .await
        .with_context(|| format!("capture failed for agent {}", request.agent_id))?;

    println!("Parsed: {}", outcome.source.display());
    println!("Transcript saved: {}", outcome.path.display());
    println!("SHA256: {}", outcome.sha256);
    println!("Manifest updated: {}", outcome.manifest_path.display());
    Ok(ExitCode::SUCCESS)
}

async fn cmd_verify(config: &CaptureConfig) -> Result<ExitCode> {
    let manifest = IntegrityManifest::new(
        config.transcript_dir(),
        &config.manifest_name,
        config.lock_timeout(),
    );
    let report = manifest.verify().await?;

    println!("Verifying transcript integrity...\n");
    for result in &report.results {
        match &result.status {
            VerifyStatus::Valid => println!("VALID: {}", result.filename),
            VerifyStatus::Modified { expected, actual } => {
                println!("MODIFIED: {}", result.filename);
                println!("   Expected: {expected}");
                println!("   Current:  {actual}");
            }
            VerifyStatus::Missing => println!("MISSING: {}", result.filename),
        }
    }

    let s = report.summary;
    println!(
        "\nSummary: {} valid, {} modified, {} missing",
        s.valid, s.modified, s.missing
    );

    Ok(if report.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn cmd_prune(config: &CaptureConfig) -> Result<ExitCode> {
    let manifest = IntegrityManifest::new(
        config.transcript_dir(),
        &config.manifest_name,
        config.lock_timeout(),
    );
    let removed = manifest.prune().await?;
    for filename in &removed {
        println!("Removed: {filename}");
    }
    println!("Pruned {} entries", removed.len());
    Ok(ExitCode::SUCCESS)
}
