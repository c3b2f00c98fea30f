//! The task document model.
//!
//! A [`TaskDocument`] is the replicated state of one task: metadata, the
//! conversation, session records, and extracted plans. `meta.status` is the
//! authoritative "is work in flight" flag.
//!
//! Session records are always addressed by [`SessionId`]. Peers may insert
//! records concurrently, so positions are never cached across mutations.

use serde::{Deserialize, Serialize};

use crate::errors::CoreError;
use crate::ids::{AgentSessionId, MachineId, SessionId, TaskId};
use crate::messages::Message;

/// Current wall clock in unix milliseconds.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Task-level lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Waiting for an agent to pick up work.
    #[default]
    Submitted,
    /// An agent session is running.
    Working,
    /// Blocked on a human permission decision.
    InputRequired,
    /// Last session finished successfully.
    Completed,
    /// Last session was interrupted.
    Canceled,
    /// Last session failed.
    Failed,
}

impl TaskStatus {
    /// Whether an agent is currently running for the task.
    #[must_use]
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Working | Self::InputRequired)
    }
}

/// Session lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Created, subprocess not yet reporting.
    Pending,
    /// Subprocess reported its session id.
    Active,
    /// Finished with a successful result.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled by the caller.
    Interrupted,
}

impl SessionStatus {
    /// Terminal states are never left.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Interrupted)
    }

    /// States a later session may resume from.
    #[must_use]
    pub fn is_resumable(self) -> bool {
        matches!(self, Self::Completed | Self::Interrupted)
    }
}

/// One agent subprocess invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Local id.
    pub session_id: SessionId,
    /// Id assigned by the agent runtime; empty until reported.
    #[serde(default)]
    pub agent_session_id: AgentSessionId,
    /// Lifecycle state.
    pub status: SessionStatus,
    /// Working directory of the subprocess.
    pub cwd: String,
    /// Model requested for the session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Host machine.
    pub machine_id: MachineId,
    /// Unix milliseconds.
    pub created_at: i64,
    /// Unix milliseconds, set on the terminal transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    /// Reported cost.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
    /// Reported wall duration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Failure text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SessionRecord {
    /// A fresh `pending` record.
    ///
    /// `agent_session_id` is carried over when resuming a prior session.
    #[must_use]
    pub fn pending(
        cwd: impl Into<String>,
        model: Option<String>,
        machine_id: MachineId,
        agent_session_id: AgentSessionId,
    ) -> Self {
        Self {
            session_id: SessionId::new(),
            agent_session_id,
            status: SessionStatus::Pending,
            cwd: cwd.into(),
            model,
            machine_id,
            created_at: now_ms(),
            completed_at: None,
            total_cost_usd: None,
            duration_ms: None,
            error: None,
        }
    }

    /// Record the runtime-assigned id and move to `active`.
    pub fn activate(&mut self, agent_session_id: AgentSessionId) -> Result<(), CoreError> {
        self.ensure_open()?;
        self.agent_session_id = agent_session_id;
        self.status = SessionStatus::Active;
        Ok(())
    }

    /// Apply the single terminal transition.
    pub fn finish(&mut self, status: SessionStatus, error: Option<String>) -> Result<(), CoreError> {
        self.ensure_open()?;
        if !status.is_terminal() {
            return Err(CoreError::InvalidTransition {
                session_id: self.session_id.to_string(),
                from: self.status,
                to: status,
            });
        }
        self.status = status;
        self.error = error;
        self.completed_at = Some(now_ms());
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), CoreError> {
        if self.status.is_terminal() {
            return Err(CoreError::SessionClosed {
                session_id: self.session_id.to_string(),
                status: self.status,
            });
        }
        Ok(())
    }
}

/// A plan the agent produced when leaving plan mode.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanArtifact {
    /// The `ExitPlanMode` invocation that carried the plan.
    pub tool_use_id: String,
    /// Session that produced it.
    pub session_id: SessionId,
    /// Markdown plan text.
    pub plan: String,
    /// Unix milliseconds.
    pub created_at: i64,
}

/// Task metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMeta {
    /// Task id.
    pub task_id: TaskId,
    /// Lifecycle state.
    pub status: TaskStatus,
    /// Unix milliseconds of the last status change.
    pub updated_at: i64,
}

/// Replicated state of a single task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDocument {
    /// Metadata.
    pub meta: TaskMeta,
    /// Conversation, oldest first.
    #[serde(default)]
    pub conversation: Vec<Message>,
    /// Session records, oldest first.
    #[serde(default)]
    pub sessions: Vec<SessionRecord>,
    /// Extracted plans.
    #[serde(default)]
    pub plans: Vec<PlanArtifact>,
}

impl TaskDocument {
    /// An empty `submitted` document.
    #[must_use]
    pub fn new(task_id: TaskId) -> Self {
        Self {
            meta: TaskMeta {
                task_id,
                status: TaskStatus::Submitted,
                updated_at: now_ms(),
            },
            conversation: Vec::new(),
            sessions: Vec::new(),
            plans: Vec::new(),
        }
    }

    /// Set `meta.status`, bumping `updated_at` only on change.
    pub fn set_status(&mut self, status: TaskStatus) {
        if self.meta.status != status {
            self.meta.status = status;
            self.meta.updated_at = now_ms();
        }
    }

    /// Look up a session record by id.
    #[must_use]
    pub fn session(&self, id: &SessionId) -> Option<&SessionRecord> {
        self.sessions.iter().find(|s| &s.session_id == id)
    }

    /// Mutable lookup by id.
    pub fn session_mut(&mut self, id: &SessionId) -> Option<&mut SessionRecord> {
        self.sessions.iter_mut().find(|s| &s.session_id == id)
    }

    /// Most recent session a new turn may resume.
    #[must_use]
    pub fn latest_resumable_session(&self) -> Option<&SessionRecord> {
        self.sessions
            .iter()
            .rev()
            .find(|s| s.status.is_resumable() && s.agent_session_id.is_assigned())
    }

    /// Whether a plan was already extracted for this invocation.
    #[must_use]
    pub fn has_plan(&self, tool_use_id: &str) -> bool {
        self.plans.iter().any(|p| p.tool_use_id == tool_use_id)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
