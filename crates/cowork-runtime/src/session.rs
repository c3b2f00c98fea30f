//! Agent session state machine.
//!
//! An [`AgentSession`] owns one agent invocation end to end: it writes the
//! `pending` record, launches the subprocess through the
//! [`SpawnCoordinator`], folds every event into the task document, and lands
//! in exactly one terminal state.
//!
//! ```text
//! pending ──init──▶ active ──result──▶ completed | failed
//!    │                 │
//!    └─────────────────┴──cancel──▶ interrupted
//!                      └──idle / no result / stream error──▶ failed
//! ```
//!
//! Follow-up turns may be pushed while the session is streaming. Each turn is
//! answered by one `result`; only the result answering the last outstanding
//! turn ends the session.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cowork_core::constants::{IDLE_TIMEOUT_ERROR, NO_RESULT_ERROR};
use cowork_core::{
    AgentSessionId, CoreError, MachineId, SessionId, SessionRecord, SessionStatus, TaskDocument,
    TaskId, parse_content_blocks,
};
use cowork_doc::{TaskDocumentExt, TaskDocumentHandle};
use cowork_settings::CoworkSettings;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::driver::{
    AgentDriver, AgentEvent, AgentResult, DriverOptions, EventStream, PermissionCallback,
    RunControl,
};
use crate::errors::RuntimeError;
use crate::fold::{self, Terminal};
use crate::input::{InputChannel, UserTurn};
use crate::spawn::{ProcessHandle, SpawnCoordinator};
use crate::watchdog::{ActivityClock, WatchdogResult, run_watchdog};

/// Per-session launch parameters.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Owning task.
    pub task_id: TaskId,
    /// Working directory of the agent.
    pub cwd: PathBuf,
    /// Model override.
    pub model: Option<String>,
    /// Agent permission mode.
    pub permission_mode: String,
    /// Host recorded on the session record.
    pub machine_id: MachineId,
    /// Silence after which the session fails.
    pub idle_timeout: Duration,
    /// Watchdog check period.
    pub watchdog_interval: Duration,
}

impl SessionConfig {
    /// Config for `task_id` in `cwd` using `settings` for everything else.
    #[must_use]
    pub fn from_settings(task_id: TaskId, cwd: impl Into<PathBuf>, settings: &CoworkSettings) -> Self {
        Self {
            task_id,
            cwd: cwd.into(),
            model: settings.agent.default_model.clone(),
            permission_mode: settings.agent.permission_mode.clone(),
            machine_id: MachineId::from(settings.agent.resolved_machine_id()),
            idle_timeout: settings.session.idle_timeout(),
            watchdog_interval: settings.session.watchdog_interval(),
        }
    }
}

/// Collaborators a session needs.
#[derive(Clone)]
pub struct SessionDeps {
    /// The task document.
    pub doc: Arc<dyn TaskDocumentHandle>,
    /// Agent launcher.
    pub driver: Arc<dyn AgentDriver>,
    /// Per-task launch serialization.
    pub spawner: Arc<SpawnCoordinator>,
    /// Permission prompt handler.
    pub permissions: Arc<dyn PermissionCallback>,
}

/// Why a session failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// The agent reported a failed result.
    Agent,
    /// The event stream closed without a result.
    NoResult,
    /// The event stream yielded an error.
    Stream,
    /// No activity within the idle timeout.
    IdleTimeout,
}

/// How a session ended.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionOutcome {
    /// Successful result.
    Completed {
        /// Reported cost.
        total_cost_usd: Option<f64>,
        /// Reported duration.
        duration_ms: Option<u64>,
    },
    /// Any failure.
    Failed {
        /// Text written to the record.
        error: String,
        /// Failure class.
        kind: FailureKind,
    },
    /// Cancelled by the caller.
    Interrupted,
}

impl SessionOutcome {
    fn failed(error: impl Into<String>, kind: FailureKind) -> Self {
        Self::Failed {
            error: error.into(),
            kind,
        }
    }

    fn from_result(result: &AgentResult) -> Self {
        if result.is_error {
            Self::failed(result.error_message(), FailureKind::Agent)
        } else {
            Self::Completed {
                total_cost_usd: result.total_cost_usd,
                duration_ms: result.duration_ms,
            }
        }
    }

    /// Record status for this outcome.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        match self {
            Self::Completed { .. } => SessionStatus::Completed,
            Self::Failed { .. } => SessionStatus::Failed,
            Self::Interrupted => SessionStatus::Interrupted,
        }
    }
}

/// One live agent invocation.
pub struct AgentSession {
    session_id: SessionId,
    config: SessionConfig,
    doc: Arc<dyn TaskDocumentHandle>,
    input: InputChannel,
    handle: ProcessHandle,
    control: Arc<dyn RunControl>,
    events: Mutex<Option<EventStream>>,
    cancel: CancellationToken,
    finished: CancellationToken,
    clock: ActivityClock,
    pending_turns: Mutex<usize>,
    last_result: Mutex<Option<AgentResult>>,
    stopped: AtomicBool,
}

impl AgentSession {
    /// Start a fresh session with `turn` as its first input.
    #[instrument(skip_all, fields(task_id = %config.task_id))]
    pub async fn create_session(
        deps: &SessionDeps,
        config: SessionConfig,
        turn: UserTurn,
    ) -> Result<Arc<Self>, RuntimeError> {
        Self::start(deps, config, turn, AgentSessionId::default()).await
    }

    /// Continue the runtime session of `prior` in a new session record.
    #[instrument(skip_all, fields(task_id = %config.task_id, prior = %prior))]
    pub async fn resume_session(
        deps: &SessionDeps,
        prior: &SessionId,
        config: SessionConfig,
        turn: UserTurn,
    ) -> Result<Arc<Self>, RuntimeError> {
        let snapshot = deps.doc.snapshot();
        let record = snapshot
            .session(prior)
            .ok_or_else(|| RuntimeError::Validation(format!("unknown session {prior}")))?;
        if !record.agent_session_id.is_assigned() {
            return Err(RuntimeError::Resume("no agent session id".into()));
        }
        let agent_session_id = record.agent_session_id.clone();
        Self::start(deps, config, turn, agent_session_id).await
    }

    async fn start(
        deps: &SessionDeps,
        config: SessionConfig,
        turn: UserTurn,
        resume: AgentSessionId,
    ) -> Result<Arc<Self>, RuntimeError> {
        if turn.is_empty() {
            return Err(RuntimeError::Validation("turn has no content".into()));
        }

        let record = SessionRecord::pending(
            config.cwd.display().to_string(),
            config.model.clone(),
            config.machine_id.clone(),
            resume.clone(),
        );
        let session_id = record.session_id.clone();
        deps.doc.update(|doc| doc.sessions.push(record))?;
        info!(%session_id, resume = resume.is_assigned(), "session created");

        let input = InputChannel::new();
        input.push(turn)?;
        let reader = input
            .take_reader()
            .ok_or_else(|| RuntimeError::Internal("input reader already taken".into()))?;

        let cancel = CancellationToken::new();
        let options = DriverOptions {
            cwd: config.cwd.clone(),
            model: config.model.clone(),
            permission_mode: config.permission_mode.clone(),
            resume: resume.is_assigned().then_some(resume),
            permissions: Arc::clone(&deps.permissions),
            cancel: cancel.clone(),
        };

        let running = match deps
            .spawner
            .spawn(&config.task_id, deps.driver.start(reader, options))
            .await
        {
            Ok(running) => running,
            Err(e) => {
                let terminal = Terminal {
                    status: SessionStatus::Failed,
                    error: Some(e.to_string()),
                    total_cost_usd: None,
                    duration_ms: None,
                };
                if let Err(doc_err) = deps
                    .doc
                    .update(|doc| fold::apply_terminal(doc, &session_id, &terminal))
                {
                    warn!(%session_id, error = %doc_err, "failed to record launch failure");
                }
                return Err(e);
            }
        };

        Ok(Arc::new(Self {
            session_id,
            config,
            doc: Arc::clone(&deps.doc),
            input,
            handle: running.handle,
            control: running.control,
            events: Mutex::new(Some(running.events)),
            cancel,
            finished: CancellationToken::new(),
            clock: ActivityClock::new(),
            pending_turns: Mutex::new(1),
            last_result: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }))
    }

    /// Local session id.
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Subprocess identity.
    #[must_use]
    pub fn process(&self) -> &ProcessHandle {
        &self.handle
    }

    /// Whether follow-up turns are accepted.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        !self.input.is_ended()
    }

    /// Queue another user turn on the running invocation.
    pub fn send_follow_up(&self, turn: UserTurn) -> Result<(), RuntimeError> {
        if turn.is_empty() {
            return Err(RuntimeError::Validation("turn has no content".into()));
        }
        let mut pending = self.pending_turns.lock();
        if self.input.is_ended() {
            return Err(RuntimeError::NotStreaming(self.session_id.to_string()));
        }
        self.input
            .push(turn)
            .map_err(|_| RuntimeError::NotStreaming(self.session_id.to_string()))?;
        *pending += 1;
        debug!(session_id = %self.session_id, pending = *pending, "follow-up queued");
        Ok(())
    }

    /// End input and stop the subprocess. Idempotent.
    pub fn close_session(&self) {
        self.input.end();
        if !self.stopped.swap(true, Ordering::SeqCst) {
            debug!(session_id = %self.session_id, "stopping agent");
            self.control.stop();
        }
    }

    /// Interrupt the session. The running loop lands in `interrupted`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves once [`run`](Self::run) has written the terminal record and
    /// released the event stream.
    pub async fn finished(&self) {
        self.finished.cancelled().await;
    }

    /// Drive the session to its terminal state.
    ///
    /// Errors only when called more than once.
    #[instrument(skip_all, fields(task_id = %self.config.task_id, session_id = %self.session_id))]
    pub async fn run(&self) -> Result<SessionOutcome, RuntimeError> {
        let mut events = self
            .events
            .lock()
            .take()
            .ok_or_else(|| RuntimeError::Internal("session loop already started".into()))?;

        let watchdog = run_watchdog(
            self.clock.clone(),
            self.config.watchdog_interval,
            self.config.idle_timeout,
            self.cancel.child_token(),
        );
        tokio::pin!(watchdog);

        let outcome = loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break SessionOutcome::Interrupted,
                watched = &mut watchdog => match watched {
                    WatchdogResult::TimedOut => {
                        warn!(idle = ?self.clock.idle_for(), "agent idle, giving up");
                        break SessionOutcome::failed(IDLE_TIMEOUT_ERROR, FailureKind::IdleTimeout);
                    }
                    WatchdogResult::Cancelled => break SessionOutcome::Interrupted,
                },
                event = events.next() => match event {
                    None => break SessionOutcome::failed(NO_RESULT_ERROR, FailureKind::NoResult),
                    Some(Err(e)) => {
                        let message = match e {
                            RuntimeError::Agent(message) => message,
                            other => other.to_string(),
                        };
                        break SessionOutcome::failed(message, FailureKind::Stream);
                    }
                    Some(Ok(event)) => {
                        self.clock.touch();
                        if let Some(outcome) = self.fold(event) {
                            break outcome;
                        }
                    }
                },
            }
        };

        let outcome = self.finish(outcome);
        drop(events);
        self.finished.cancel();
        Ok(outcome)
    }

    /// Apply one event. Returns the outcome once the session is over.
    fn fold(&self, event: AgentEvent) -> Option<SessionOutcome> {
        match event {
            AgentEvent::Init {
                agent_session_id,
                model,
            } => {
                info!(agent_session_id = %agent_session_id, model = ?model, "agent session started");
                self.write(|doc| fold::apply_init(doc, &self.session_id, agent_session_id));
                None
            }
            AgentEvent::Assistant {
                content,
                parent_tool_use_id,
            } => {
                let blocks = parse_content_blocks(&content, parent_tool_use_id.as_deref());
                self.write(|doc| {
                    let plans = fold::apply_assistant(doc, &self.session_id, blocks);
                    if plans > 0 {
                        info!(plans, "plan extracted");
                    }
                    Ok(())
                });
                None
            }
            AgentEvent::User {
                content,
                parent_tool_use_id,
            } => {
                let blocks = parse_content_blocks(&content, parent_tool_use_id.as_deref());
                self.write(|doc| {
                    fold::apply_tool_results(doc, blocks);
                    Ok(())
                });
                None
            }
            AgentEvent::ToolProgress {
                tool_use_id,
                tool_name,
                elapsed_secs,
            } => {
                debug!(%tool_use_id, %tool_name, elapsed_secs, "tool progress");
                None
            }
            AgentEvent::Result(result) => self.on_result(result),
        }
    }

    fn on_result(&self, result: AgentResult) -> Option<SessionOutcome> {
        let mut pending = self.pending_turns.lock();
        *pending = pending.saturating_sub(1);
        if *pending > 0 {
            info!(
                is_error = result.is_error,
                remaining = *pending,
                "turn finished, follow-ups outstanding"
            );
            *self.last_result.lock() = Some(result);
            return None;
        }
        // No follow-up can slip in between the last result and the close.
        self.input.end();
        drop(pending);
        Some(SessionOutcome::from_result(&result))
    }

    fn write(&self, apply: impl FnOnce(&mut TaskDocument) -> Result<(), CoreError>) {
        match self.doc.update(apply) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "event not applied"),
            Err(e) => warn!(error = %e, "document write failed"),
        }
    }

    fn finish(&self, outcome: SessionOutcome) -> SessionOutcome {
        let (error, cost, duration) = match &outcome {
            SessionOutcome::Completed {
                total_cost_usd,
                duration_ms,
            } => (None, *total_cost_usd, *duration_ms),
            SessionOutcome::Failed { error, .. } => {
                let last = self.last_result.lock();
                (
                    Some(error.clone()),
                    last.as_ref().and_then(|r| r.total_cost_usd),
                    last.as_ref().and_then(|r| r.duration_ms),
                )
            }
            SessionOutcome::Interrupted => (None, None, None),
        };
        let terminal = Terminal {
            status: outcome.status(),
            error,
            total_cost_usd: cost,
            duration_ms: duration,
        };
        self.write(|doc| fold::apply_terminal(doc, &self.session_id, &terminal));

        match &outcome {
            SessionOutcome::Completed { .. } => info!("session completed"),
            SessionOutcome::Failed { error, kind } => warn!(%error, ?kind, "session failed"),
            SessionOutcome::Interrupted => info!("session interrupted"),
        }

        self.close_session();
        // Resolves any permission prompt still waiting.
        self.cancel.cancel();
        outcome
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
