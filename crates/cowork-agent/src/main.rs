//! # cowork-agent
//!
//! `cowork` binary. Runs an agent against an in-process task document and
//! plays the remote peer on the terminal: the prompt goes in as a remote
//! edit, permission prompts are answered interactively, and assistant output
//! is printed as it lands in the document.

#![deny(unsafe_code)]

mod approver;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use cowork_core::{ContentBlock, Message, TaskId, TaskStatus};
use cowork_doc::{DocumentId, MemoryDocumentStore, TaskDocumentHandle};
use cowork_logging::LogFormat;
use cowork_runtime::{ClaudeCodeDriver, DispatchResult, TaskOrchestrator};
use cowork_settings::CoworkSettings;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Drive a coding agent from the terminal.
#[derive(Parser, Debug)]
#[command(name = "cowork", about = "Agent-session orchestration over a task document", version)]
struct Cli {
    /// Settings file (defaults to `~/.cowork/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an agent on a prompt.
    Run(RunArgs),
    /// Print the effective settings as JSON.
    Settings,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Task id.
    #[arg(long)]
    task: String,

    /// Working directory for the agent (defaults to the current directory).
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Model override.
    #[arg(long)]
    model: Option<String>,

    /// Approve every permission request without asking.
    #[arg(long)]
    yes: bool,

    /// What to ask the agent.
    prompt: String,
}

fn load_settings(path: Option<&PathBuf>) -> Result<CoworkSettings> {
    let path = path.cloned().unwrap_or_else(cowork_settings::settings_path);
    cowork_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let settings = load_settings(cli.settings.as_ref())?;
    cowork_logging::init_subscriber(
        &settings.logging.level,
        LogFormat::from_json_flag(settings.logging.json),
    );

    match cli.command {
        Command::Settings => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Run(args) => run(args, settings).await,
    }
}

async fn run(args: RunArgs, mut settings: CoworkSettings) -> Result<ExitCode> {
    if args.prompt.trim().is_empty() {
        bail!("prompt is empty");
    }
    if let Some(model) = args.model {
        settings.agent.default_model = Some(model);
    }
    let cwd = match args.cwd {
        Some(cwd) => cwd,
        None => std::env::current_dir().context("Failed to read current directory")?,
    };
    let cwd = cwd
        .canonicalize()
        .with_context(|| format!("Working directory not found: {}", cwd.display()))?;

    let task_id = TaskId::from(args.task.as_str());
    let store = Arc::new(MemoryDocumentStore::new());
    let doc = store.open_memory(&DocumentId::task(
        task_id.clone(),
        settings.document.schema_epoch,
    ));
    let driver = Arc::new(ClaudeCodeDriver::new(settings.agent.clone()));
    let orchestrator = TaskOrchestrator::new(store, driver, settings, &cwd);

    let done = CancellationToken::new();
    let skip = doc.snapshot().conversation.len() + 1;
    let printer = tokio::spawn(output::stream(Arc::clone(&doc), skip, done.clone()));
    let approver = tokio::spawn(approver::run(Arc::clone(&doc), args.yes, done.clone()));

    doc.apply_remote(|d| {
        d.conversation
            .push(Message::user(vec![ContentBlock::text(args.prompt.as_str())]));
    })?;
    match orchestrator.handle_notification(&task_id).await? {
        DispatchResult::Dispatched {
            session_id,
            process,
        } => info!(%session_id, pid = ?process.pid, cwd = %cwd.display(), "agent started"),
        other => bail!("agent was not started: {other:?}"),
    }

    wait_for_session(&orchestrator, &task_id).await;
    done.cancel();
    let _ = printer.await;
    let _ = approver.await;

    let snapshot = doc.snapshot();
    if let Some(record) = snapshot.sessions.last() {
        if let Some(error) = &record.error {
            eprintln!("error: {error}");
        }
        if let Some(cost) = record.total_cost_usd {
            eprintln!("cost: ${cost:.4}");
        }
    }
    Ok(exit_code(snapshot.meta.status))
}

/// Wait until the task has no running session. Ctrl-C stops the agent.
async fn wait_for_session(orchestrator: &Arc<TaskOrchestrator>, task_id: &TaskId) {
    let mut tick = tokio::time::interval(Duration::from_millis(100));
    let mut interrupted = false;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                if let Err(e) = signal {
                    tracing::warn!(error = %e, "failed to listen for ctrl-c");
                }
                interrupted = true;
                eprintln!("stopping agent...");
                let _ = orchestrator.stop_agent(task_id);
            }
            _ = tick.tick() => {
                if orchestrator.active_session(task_id).is_none() {
                    return;
                }
            }
        }
    }
}

fn exit_code(status: TaskStatus) -> ExitCode {
    match status {
        TaskStatus::Completed => ExitCode::SUCCESS,
        TaskStatus::Canceled => ExitCode::from(130),
        _ => ExitCode::FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_command() {
        let cli = Cli::try_parse_from([
            "cowork", "run", "--task", "t1", "--model", "opus", "--yes", "fix the build",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.task, "t1");
        assert_eq!(args.model.as_deref(), Some("opus"));
        assert!(args.yes);
        assert_eq!(args.prompt, "fix the build");
        assert!(args.cwd.is_none());
    }

    #[test]
    fn run_requires_task() {
        assert!(Cli::try_parse_from(["cowork", "run", "hello"]).is_err());
    }

    #[test]
    fn global_settings_flag() {
        let cli = Cli::try_parse_from(["cowork", "settings", "--settings", "/tmp/s.json"]).unwrap();
        assert!(matches!(cli.command, Command::Settings));
        assert_eq!(cli.settings, Some(PathBuf::from("/tmp/s.json")));
    }

    #[test]
    fn exit_codes_follow_task_status() {
        assert_eq!(exit_code(TaskStatus::Completed), ExitCode::SUCCESS);
        assert_eq!(exit_code(TaskStatus::Failed), ExitCode::FAILURE);
        assert_eq!(exit_code(TaskStatus::Canceled), ExitCode::from(130));
    }
}
