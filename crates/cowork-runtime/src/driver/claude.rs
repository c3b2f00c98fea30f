//! Claude Code subprocess driver.
//!
//! Spawns the `claude` CLI in bidirectional `stream-json` mode. Three tasks
//! serve each run:
//!
//! - a stdin writer that forwards user turns and control responses,
//! - a stdout reader that parses events and routes permission prompts,
//! - a reaper that waits for exit (or kills on [`RunControl::stop`]).
//!
//! stderr is relayed to the log at `warn`.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use cowork_settings::AgentSettings;
use dashmap::DashMap;
use futures::{FutureExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::wire::{self, Incoming};
use super::{AgentDriver, AgentEvent, AgentRun, DriverOptions, PermissionCallback, RunControl};
use crate::errors::RuntimeError;
use crate::input::InputReader;
use crate::spawn::LaunchConfig;

type EventSender = mpsc::UnboundedSender<Result<AgentEvent, RuntimeError>>;

/// Launches `claude` subprocesses.
pub struct ClaudeCodeDriver {
    settings: AgentSettings,
}

impl ClaudeCodeDriver {
    /// Driver using `settings` for executable, defaults, and extra args.
    #[must_use]
    pub fn new(settings: AgentSettings) -> Self {
        Self { settings }
    }
}

struct ChildControl {
    kill: CancellationToken,
}

impl RunControl for ChildControl {
    fn stop(&self) {
        self.kill.cancel();
    }
}

#[async_trait]
impl AgentDriver for ClaudeCodeDriver {
    async fn start(&self, input: InputReader, options: DriverOptions) -> Result<AgentRun, RuntimeError> {
        let launch = LaunchConfig::resolve(&self.settings, &options)?;
        debug!(executable = %launch.executable, args = ?launch.args, cwd = %launch.cwd.display(), "spawning agent");

        let mut cmd = Command::new(&launch.executable);
        let _ = cmd
            .args(&launch.args)
            .current_dir(&launch.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in &launch.env_remove {
            let _ = cmd.env_remove(key);
        }

        let mut child = cmd.spawn().map_err(|e| {
            RuntimeError::Launch(format!("failed to spawn {}: {e}", launch.executable))
        })?;
        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RuntimeError::Launch("agent stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Launch("agent stdout unavailable".into()))?;
        if let Some(stderr) = child.stderr.take() {
            drop(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        warn!(target: "cowork_runtime::agent_stderr", "{line}");
                    }
                }
            }));
        }
        info!(pid = ?pid, "agent spawned");

        let kill = CancellationToken::new();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        drop(tokio::spawn(write_stdin(stdin, input, reply_rx)));
        drop(tokio::spawn(read_stdout(
            stdout,
            event_tx,
            reply_tx,
            options.permissions.clone(),
            options.cancel.clone(),
        )));

        let (exit_tx, exit_rx) = oneshot::channel();
        let reaper_kill = kill.clone();
        drop(tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                () = reaper_kill.cancelled() => None,
            };
            let status = match exited {
                Some(status) => status,
                None => {
                    debug!(pid = ?pid, "killing agent");
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(pid = ?pid, error = %e, "failed to wait for agent");
                    None
                }
            };
            info!(pid = ?pid, code = ?code, "agent exited");
            let _ = exit_tx.send(code);
        }));

        Ok(AgentRun {
            pid,
            events: UnboundedReceiverStream::new(event_rx).boxed(),
            control: Arc::new(ChildControl { kill }),
            exit: async move { exit_rx.await.ok().flatten() }.boxed(),
        })
    }
}

/// Forward user turns and control replies to stdin. Closing the input
/// channel closes stdin.
async fn write_stdin(
    mut stdin: ChildStdin,
    mut input: InputReader,
    mut replies: mpsc::UnboundedReceiver<String>,
) {
    loop {
        let line = tokio::select! {
            biased;
            reply = replies.recv() => match reply {
                Some(line) => line,
                None => break,
            },
            turn = input.next() => match turn {
                Some(turn) => wire::user_turn_line(&turn),
                None => {
                    debug!("input ended, closing agent stdin");
                    break;
                }
            },
        };
        if let Err(e) = write_line(&mut stdin, &line).await {
            warn!(error = %e, "failed to write to agent stdin");
            break;
        }
    }
    let _ = stdin.shutdown().await;
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

/// Parse stdout into events and answer control requests.
async fn read_stdout(
    stdout: ChildStdout,
    events: EventSender,
    replies: mpsc::UnboundedSender<String>,
    permissions: Arc<dyn PermissionCallback>,
    cancel: CancellationToken,
) {
    let prompts: Arc<DashMap<String, CancellationToken>> = Arc::new(DashMap::new());
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                let _ = events.send(Err(RuntimeError::Agent(format!(
                    "failed to read agent output: {e}"
                ))));
                break;
            }
        };
        match wire::parse_line(&line) {
            None => debug!(line = %preview(&line), "skipping unparseable agent output"),
            Some(Incoming::Ignore) => {}
            Some(Incoming::Event(event)) => {
                if events.send(Ok(event)).is_err() {
                    break;
                }
            }
            Some(Incoming::Permission {
                request_id,
                request,
            }) => {
                let token = cancel.child_token();
                let _ = prompts.insert(request_id.clone(), token.clone());
                let permissions = permissions.clone();
                let replies = replies.clone();
                let prompts = prompts.clone();
                drop(tokio::spawn(async move {
                    let outcome = permissions.can_use_tool(request, token).await;
                    let _ = prompts.remove(&request_id);
                    let _ = replies.send(wire::control_response_line(&request_id, &outcome));
                }));
            }
            Some(Incoming::UnsupportedControl {
                request_id,
                subtype,
            }) => {
                warn!(%subtype, "unsupported control request");
                let _ = replies.send(wire::control_error_line(
                    &request_id,
                    &format!("unsupported control request: {subtype}"),
                ));
            }
            Some(Incoming::Cancel { request_id }) => {
                if let Some((_, token)) = prompts.remove(&request_id) {
                    debug!(%request_id, "agent withdrew permission request");
                    token.cancel();
                }
            }
        }
    }
    for entry in prompts.iter() {
        entry.value().cancel();
    }
}

fn preview(line: &str) -> &str {
    match line.char_indices().nth(200) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
