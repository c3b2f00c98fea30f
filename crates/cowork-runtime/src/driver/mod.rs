//! Agent runtime seam.
//!
//! An [`AgentDriver`] launches one agent invocation that reads user turns from
//! an [`InputReader`] and reports [`AgentEvent`]s. Tool-permission prompts are
//! routed to the [`PermissionCallback`] supplied in [`DriverOptions`].
//! [`claude::ClaudeCodeDriver`] is the production implementation.

pub mod claude;
pub mod wire;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use cowork_core::AgentSessionId;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::errors::RuntimeError;
use crate::input::InputReader;

/// Terminal report of one agent turn.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AgentResult {
    /// Whether the turn failed.
    pub is_error: bool,
    /// Runtime-specific subtype (`success`, `error_max_turns`, ...).
    pub subtype: String,
    /// Final text or error text.
    pub result: Option<String>,
    /// Cumulative cost.
    pub total_cost_usd: Option<f64>,
    /// Wall duration.
    pub duration_ms: Option<u64>,
    /// Turns taken.
    pub num_turns: Option<u32>,
}

impl AgentResult {
    /// A successful result.
    #[must_use]
    pub fn success() -> Self {
        Self {
            subtype: "success".into(),
            ..Self::default()
        }
    }

    /// A failed result carrying `message`.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            is_error: true,
            subtype: "error_during_execution".into(),
            result: Some(message.into()),
            ..Self::default()
        }
    }

    /// Text recorded on the session when the result is a failure.
    #[must_use]
    pub fn error_message(&self) -> String {
        self.result
            .clone()
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| self.subtype.clone())
    }
}

/// What the agent reports while running.
#[derive(Clone, Debug, PartialEq)]
pub enum AgentEvent {
    /// The runtime assigned its own session id.
    Init {
        /// Runtime session id.
        agent_session_id: AgentSessionId,
        /// Model actually in use.
        model: Option<String>,
    },
    /// Assistant output (raw wire content).
    Assistant {
        /// Raw content blocks.
        content: Vec<Value>,
        /// Sub-agent parent invocation.
        parent_tool_use_id: Option<String>,
    },
    /// User-side content, in practice tool results.
    User {
        /// Raw content blocks.
        content: Vec<Value>,
        /// Sub-agent parent invocation.
        parent_tool_use_id: Option<String>,
    },
    /// A long-running tool is still going.
    ToolProgress {
        /// Invocation id.
        tool_use_id: String,
        /// Tool name.
        tool_name: String,
        /// Seconds elapsed so far.
        elapsed_secs: f64,
    },
    /// The turn finished.
    Result(AgentResult),
}

/// A tool-permission prompt from the agent.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolPermissionRequest {
    /// Tool name.
    pub tool_name: String,
    /// Tool input.
    pub input: Value,
    /// Tool-invocation id used as the tunnel key.
    pub tool_use_id: String,
    /// Path the runtime itself flagged.
    pub blocked_path: Option<String>,
    /// Sub-agent id.
    pub agent_id: Option<String>,
}

/// Answer to a permission prompt.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "behavior", rename_all = "lowercase")]
pub enum PermissionOutcome {
    /// Run the tool with `updated_input`.
    Allow {
        /// Input to run with.
        #[serde(rename = "updatedInput")]
        updated_input: Value,
    },
    /// Refuse with a message for the agent.
    Deny {
        /// Why.
        message: String,
    },
}

impl PermissionOutcome {
    /// Whether this allows the call.
    #[must_use]
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }
}

/// Decides tool-permission prompts.
#[async_trait]
pub trait PermissionCallback: Send + Sync {
    /// Resolve `request`, giving up when `cancel` fires.
    async fn can_use_tool(
        &self,
        request: ToolPermissionRequest,
        cancel: CancellationToken,
    ) -> PermissionOutcome;
}

/// Launch parameters for one invocation.
#[derive(Clone)]
pub struct DriverOptions {
    /// Working directory.
    pub cwd: PathBuf,
    /// Model override.
    pub model: Option<String>,
    /// Runtime permission mode.
    pub permission_mode: String,
    /// Runtime session to resume.
    pub resume: Option<AgentSessionId>,
    /// Permission prompt handler.
    pub permissions: Arc<dyn PermissionCallback>,
    /// Fires when the session is cancelled.
    pub cancel: CancellationToken,
}

/// Stops a running invocation.
pub trait RunControl: Send + Sync {
    /// Request shutdown. Safe to call more than once.
    fn stop(&self);
}

/// Ordered event stream of one invocation.
pub type EventStream = BoxStream<'static, Result<AgentEvent, RuntimeError>>;

/// A launched invocation.
pub struct AgentRun {
    /// OS process id, when there is a process.
    pub pid: Option<u32>,
    /// Events in emission order; ends when the runtime exits.
    pub events: EventStream,
    /// Shutdown control.
    pub control: Arc<dyn RunControl>,
    /// Resolves with the exit code once the invocation is gone.
    pub exit: BoxFuture<'static, Option<i32>>,
}

/// Launches agent invocations.
#[async_trait]
pub trait AgentDriver: Send + Sync {
    /// Start an invocation fed by `input`.
    async fn start(&self, input: InputReader, options: DriverOptions) -> Result<AgentRun, RuntimeError>;
}
