//! Task orchestrator: the control plane over documents, gate, and sessions.
//!
//! Per task the orchestrator keeps the dispatch watermark and the active
//! session. A notification runs the dispatch gate against a fresh snapshot;
//! a dispatch starts (or resumes) a session and drives it on its own task.
//! When that session ends the slot is cleared and the gate runs again, so
//! input that arrived meanwhile is never lost.
//!
//! While a session is streaming, new user messages are pushed to it as
//! follow-up turns instead of waiting for the next dispatch.

use std::path::PathBuf;
use std::sync::Arc;

use cowork_core::{ContentBlock, Message, Role, SessionId, TaskDocument, TaskId};
use cowork_doc::{DocumentId, DocumentProvider, Origin, TaskDocumentExt, TaskDocumentHandle};
use cowork_settings::CoworkSettings;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::dispatch::{self, DispatchDecision, SkipReason};
use crate::driver::AgentDriver;
use crate::errors::RuntimeError;
use crate::input::UserTurn;
use crate::risk::RiskClassifier;
use crate::session::{AgentSession, SessionConfig, SessionDeps};
use crate::spawn::{AgentProcessInfo, ProcessHandle, SpawnCoordinator};
use crate::tunnel::PermissionTunnel;

/// What a notification led to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchResult {
    /// A session was started.
    Dispatched {
        /// New session record.
        session_id: SessionId,
        /// Its subprocess.
        process: ProcessHandle,
    },
    /// New messages were pushed into the running session.
    FollowUp {
        /// How many.
        count: usize,
    },
    /// Nothing to do.
    Skipped(SkipReason),
}

struct TaskState {
    task_id: TaskId,
    doc: Arc<dyn TaskDocumentHandle>,
    cwd: Mutex<PathBuf>,
    watermark: Mutex<usize>,
    active: Mutex<Option<Arc<AgentSession>>>,
    dispatch_lock: tokio::sync::Mutex<()>,
    watcher: Mutex<Option<CancellationToken>>,
}

impl TaskState {
    fn active(&self) -> Option<Arc<AgentSession>> {
        self.active.lock().clone()
    }
}

/// Everything after the last assistant message counts as unprocessed.
fn initial_watermark(doc: &TaskDocument) -> usize {
    doc.conversation
        .iter()
        .rposition(|m| m.role == Role::Assistant)
        .map_or(0, |i| i + 1)
}

fn turn_from(message: &Message) -> UserTurn {
    UserTurn {
        message_id: Some(message.message_id.clone()),
        content: message
            .content
            .iter()
            .filter(|b| matches!(b, ContentBlock::Text { .. } | ContentBlock::Image { .. }))
            .cloned()
            .collect(),
    }
}

/// Control plane for agent work across tasks.
pub struct TaskOrchestrator {
    provider: Arc<dyn DocumentProvider>,
    driver: Arc<dyn AgentDriver>,
    spawner: Arc<SpawnCoordinator>,
    settings: CoworkSettings,
    default_cwd: PathBuf,
    tasks: DashMap<TaskId, Arc<TaskState>>,
}

impl TaskOrchestrator {
    /// Orchestrator opening documents through `provider` and launching
    /// agents through `driver`. Tasks run in `default_cwd` unless told
    /// otherwise.
    #[must_use]
    pub fn new(
        provider: Arc<dyn DocumentProvider>,
        driver: Arc<dyn AgentDriver>,
        settings: CoworkSettings,
        default_cwd: impl Into<PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider,
            driver,
            spawner: Arc::new(SpawnCoordinator::new()),
            settings,
            default_cwd: default_cwd.into(),
            tasks: DashMap::new(),
        })
    }

    /// Open the task's document, registering the task on first use.
    pub async fn open_task(&self, task_id: &TaskId) -> Result<Arc<dyn TaskDocumentHandle>, RuntimeError> {
        Ok(Arc::clone(&self.state(task_id).await?.doc))
    }

    async fn state(&self, task_id: &TaskId) -> Result<Arc<TaskState>, RuntimeError> {
        let existing = self.tasks.get(task_id).map(|s| Arc::clone(s.value()));
        if let Some(state) = existing {
            return Ok(state);
        }
        let id = DocumentId::task(task_id.clone(), self.settings.document.schema_epoch);
        let doc = self.provider.open(&id).await?;
        let watermark = initial_watermark(&doc.snapshot());
        debug!(task_id = %task_id, document = %id, watermark, "task opened");
        let state = Arc::new(TaskState {
            task_id: task_id.clone(),
            doc,
            cwd: Mutex::new(self.default_cwd.clone()),
            watermark: Mutex::new(watermark),
            active: Mutex::new(None),
            dispatch_lock: tokio::sync::Mutex::new(()),
            watcher: Mutex::new(None),
        });
        Ok(Arc::clone(
            self.tasks.entry(task_id.clone()).or_insert(state).value(),
        ))
    }

    /// Working directory for the task's future sessions.
    pub async fn set_task_cwd(&self, task_id: &TaskId, cwd: impl Into<PathBuf>) -> Result<(), RuntimeError> {
        *self.state(task_id).await?.cwd.lock() = cwd.into();
        Ok(())
    }

    /// The task's running session, if any.
    #[must_use]
    pub fn active_session(&self, task_id: &TaskId) -> Option<Arc<AgentSession>> {
        self.tasks.get(task_id).and_then(|s| s.active())
    }

    /// Append `prompt` as a user message and start an agent on it.
    ///
    /// A session already running for the task is interrupted first.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub async fn spawn_claude_code(
        self: &Arc<Self>,
        task_id: &TaskId,
        prompt: &str,
        cwd: Option<PathBuf>,
    ) -> Result<ProcessHandle, RuntimeError> {
        if prompt.trim().is_empty() {
            return Err(RuntimeError::Validation("prompt is empty".into()));
        }
        let state = self.state(task_id).await?;
        if let Some(cwd) = cwd {
            *state.cwd.lock() = cwd;
        }
        let _dispatching = state.dispatch_lock.lock().await;

        let previous = state.active.lock().take();
        if let Some(previous) = previous {
            info!(session_id = %previous.session_id(), "interrupting running session");
            previous.cancel();
            // Its terminal record must land before the resume target is picked.
            previous.finished().await;
        }

        let message = Message::user(vec![ContentBlock::text(prompt)]);
        let turn = turn_from(&message);
        let len = state.doc.update(|doc| {
            doc.conversation.push(message);
            doc.conversation.len()
        })?;
        *state.watermark.lock() = len;

        let session = self.start_session(&state, turn).await?;
        Ok(session.process().clone())
    }

    /// Interrupt the task's session and stop its subprocess.
    ///
    /// `false` when nothing was running.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub fn stop_agent(&self, task_id: &TaskId) -> bool {
        let session = self.tasks.get(task_id).and_then(|s| s.active());
        let cancelled = session.is_some_and(|s| {
            s.cancel();
            true
        });
        let stopped = self.spawner.stop(task_id);
        if cancelled || stopped {
            info!(cancelled, stopped, "agent stopped");
        }
        cancelled || stopped
    }

    /// Live subprocesses across all tasks.
    #[must_use]
    pub fn list_agents(&self) -> Vec<AgentProcessInfo> {
        self.spawner.list()
    }

    /// Run the dispatch gate for the task and act on it.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub async fn handle_notification(self: &Arc<Self>, task_id: &TaskId) -> Result<DispatchResult, RuntimeError> {
        let state = self.state(task_id).await?;
        let _dispatching = state.dispatch_lock.lock().await;

        let snapshot = state.doc.snapshot();
        let active = state.active();
        if let Some(session) = active.as_ref().filter(|s| s.is_streaming()) {
            return Ok(Self::forward_follow_ups(&state, session, &snapshot));
        }

        let watermark = *state.watermark.lock();
        match dispatch::evaluate(&snapshot.conversation, watermark, active.is_some()) {
            DispatchDecision::Skip(reason) => {
                debug!(reason = %reason, watermark, "dispatch skipped");
                Ok(DispatchResult::Skipped(reason))
            }
            DispatchDecision::Dispatch { message, index } => {
                info!(index, message_id = %message.message_id, "dispatching");
                *state.watermark.lock() = snapshot.conversation.len();
                let session = self.start_session(&state, turn_from(&message)).await?;
                Ok(DispatchResult::Dispatched {
                    session_id: session.session_id().clone(),
                    process: session.process().clone(),
                })
            }
        }
    }

    fn forward_follow_ups(
        state: &TaskState,
        session: &AgentSession,
        snapshot: &TaskDocument,
    ) -> DispatchResult {
        let mut watermark = state.watermark.lock();
        let mut count = 0;
        for (index, message) in snapshot.conversation.iter().enumerate().skip(*watermark) {
            if message.is_user() {
                if let Err(e) = session.send_follow_up(turn_from(message)) {
                    debug!(error = %e, "follow-up not accepted");
                    break;
                }
                count += 1;
            }
            *watermark = index + 1;
        }
        if count == 0 {
            return DispatchResult::Skipped(SkipReason::ActiveTask);
        }
        info!(count, "follow-ups forwarded");
        DispatchResult::FollowUp { count }
    }

    async fn start_session(
        self: &Arc<Self>,
        state: &Arc<TaskState>,
        turn: UserTurn,
    ) -> Result<Arc<AgentSession>, RuntimeError> {
        let cwd = state.cwd.lock().clone();
        let classifier = Arc::new(RiskClassifier::new(
            cwd.clone(),
            &self.settings.permissions.protected_paths,
        )?);
        let deps = SessionDeps {
            doc: Arc::clone(&state.doc),
            driver: Arc::clone(&self.driver),
            spawner: Arc::clone(&self.spawner),
            permissions: Arc::new(PermissionTunnel::new(
                Arc::clone(&state.doc),
                classifier,
                &self.settings.permissions,
            )),
        };
        let config = SessionConfig::from_settings(state.task_id.clone(), cwd, &self.settings);

        let snapshot = state.doc.snapshot();
        let session = match snapshot.latest_resumable_session() {
            Some(prior) => {
                AgentSession::resume_session(&deps, &prior.session_id, config, turn).await?
            }
            None => AgentSession::create_session(&deps, config, turn).await?,
        };
        *state.active.lock() = Some(Arc::clone(&session));
        self.drive(Arc::clone(state), Arc::clone(&session));
        Ok(session)
    }

    fn drive(self: &Arc<Self>, state: Arc<TaskState>, session: Arc<AgentSession>) {
        let this = Arc::clone(self);
        drop(tokio::spawn(async move {
            match session.run().await {
                Ok(outcome) => debug!(task_id = %state.task_id, ?outcome, "session ended"),
                Err(e) => warn!(task_id = %state.task_id, error = %e, "session loop failed"),
            }
            {
                let mut active = state.active.lock();
                if active.as_ref().is_some_and(|a| Arc::ptr_eq(a, &session)) {
                    *active = None;
                }
            }
            this.rearm(state.task_id.clone());
        }));
    }

    /// Re-run the gate after a session ends.
    fn rearm(self: &Arc<Self>, task_id: TaskId) {
        let this = Arc::clone(self);
        drop(tokio::spawn(async move {
            match this.handle_notification(&task_id).await {
                Ok(DispatchResult::Skipped(reason)) => debug!(task_id = %task_id, %reason, "re-arm idle"),
                Ok(result) => info!(task_id = %task_id, ?result, "re-arm dispatched"),
                Err(e) => warn!(task_id = %task_id, error = %e, "re-arm failed"),
            }
        }));
    }

    /// Call [`handle_notification`](Self::handle_notification) for every
    /// remote change to the task's document.
    pub async fn watch_task(self: &Arc<Self>, task_id: &TaskId) -> Result<(), RuntimeError> {
        let state = self.state(task_id).await?;
        let cancel = CancellationToken::new();
        if let Some(previous) = state.watcher.lock().replace(cancel.clone()) {
            previous.cancel();
        }
        let mut changes = state.doc.subscribe();
        let this = Arc::clone(self);
        let task_id = task_id.clone();
        info!(task_id = %task_id, "watching task");
        drop(tokio::spawn(async move {
            loop {
                let notify = tokio::select! {
                    () = cancel.cancelled() => break,
                    change = changes.recv() => match change {
                        Ok(change) => change.origin == Origin::Remote,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(task_id = %task_id, skipped, "document changes lagged");
                            true
                        }
                        Err(RecvError::Closed) => break,
                    },
                };
                if !notify {
                    continue;
                }
                if let Err(e) = this.handle_notification(&task_id).await {
                    warn!(task_id = %task_id, error = %e, "notification failed");
                }
            }
            debug!(task_id = %task_id, "watch ended");
        }));
        Ok(())
    }

    /// Stop watching the task. `false` when it was not watched.
    pub fn unwatch_task(&self, task_id: &TaskId) -> bool {
        self.tasks
            .get(task_id)
            .and_then(|s| s.watcher.lock().take())
            .is_some_and(|token| {
                token.cancel();
                true
            })
    }

    /// Stop all watchers, sessions, and subprocesses.
    pub fn shutdown(&self) -> usize {
        for entry in &self.tasks {
            if let Some(token) = entry.watcher.lock().take() {
                token.cancel();
            }
            if let Some(session) = entry.active() {
                session.cancel();
            }
        }
        let stopped = self.spawner.stop_all();
        info!(stopped, "orchestrator shut down");
        stopped
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
