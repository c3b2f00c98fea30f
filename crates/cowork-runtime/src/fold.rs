//! Folding agent events into the task document.
//!
//! Each function applies one event kind to a [`TaskDocument`] inside a single
//! transaction. The session record is looked up by id on every call.

use cowork_core::constants::EXIT_PLAN_MODE_TOOL;
use cowork_core::{
    AgentSessionId, ContentBlock, CoreError, Message, PlanArtifact, Role, SessionId,
    SessionStatus, TaskDocument, TaskStatus, now_ms,
};
use serde_json::Value;
use tracing::{debug, warn};

/// Terminal fields written onto a session record.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Terminal {
    pub(crate) status: SessionStatus,
    pub(crate) error: Option<String>,
    pub(crate) total_cost_usd: Option<f64>,
    pub(crate) duration_ms: Option<u64>,
}

impl Terminal {
    fn task_status(&self) -> TaskStatus {
        match self.status {
            SessionStatus::Completed => TaskStatus::Completed,
            SessionStatus::Interrupted => TaskStatus::Canceled,
            _ => TaskStatus::Failed,
        }
    }
}

/// Record the runtime session id; record `active`, task `working`.
pub(crate) fn apply_init(
    doc: &mut TaskDocument,
    session_id: &SessionId,
    agent_session_id: AgentSessionId,
) -> Result<(), CoreError> {
    let Some(record) = doc.session_mut(session_id) else {
        warn!(%session_id, "session record missing on init");
        return Ok(());
    };
    record.activate(agent_session_id)?;
    doc.set_status(TaskStatus::Working);
    Ok(())
}

/// Append assistant output and extract plans. Returns the number of new plans.
pub(crate) fn apply_assistant(
    doc: &mut TaskDocument,
    session_id: &SessionId,
    blocks: Vec<ContentBlock>,
) -> usize {
    let mut plans = 0;
    for block in &blocks {
        let ContentBlock::ToolUse {
            tool_use_id,
            tool_name,
            input,
            ..
        } = block
        else {
            continue;
        };
        if tool_name != EXIT_PLAN_MODE_TOOL || doc.has_plan(tool_use_id) {
            continue;
        }
        match plan_text(input) {
            Some(plan) => {
                doc.plans.push(PlanArtifact {
                    tool_use_id: tool_use_id.clone(),
                    session_id: session_id.clone(),
                    plan,
                    created_at: now_ms(),
                });
                plans += 1;
            }
            None => debug!(%tool_use_id, "plan-mode exit without plan text"),
        }
    }
    if !blocks.is_empty() {
        doc.conversation.push(Message::assistant(blocks));
    }
    plans
}

fn plan_text(input: &str) -> Option<String> {
    let value: Value = serde_json::from_str(input).ok()?;
    value
        .get("plan")
        .and_then(Value::as_str)
        .filter(|p| !p.trim().is_empty())
        .map(str::to_owned)
}

/// Attach tool results to the trailing assistant message, or start one.
///
/// Blocks other than tool results are ignored.
pub(crate) fn apply_tool_results(doc: &mut TaskDocument, blocks: Vec<ContentBlock>) {
    let results: Vec<ContentBlock> = blocks.into_iter().filter(ContentBlock::is_tool_result).collect();
    if results.is_empty() {
        return;
    }
    match doc.conversation.last_mut() {
        Some(last) if last.role == Role::Assistant => last.content.extend(results),
        _ => doc.conversation.push(Message::assistant(results)),
    }
}

/// Apply the terminal transition and mirror it in `meta.status`.
pub(crate) fn apply_terminal(
    doc: &mut TaskDocument,
    session_id: &SessionId,
    terminal: &Terminal,
) -> Result<(), CoreError> {
    let Some(record) = doc.session_mut(session_id) else {
        warn!(%session_id, "session record missing on finish");
        doc.set_status(terminal.task_status());
        return Ok(());
    };
    record.finish(terminal.status, terminal.error.clone())?;
    if terminal.total_cost_usd.is_some() {
        record.total_cost_usd = terminal.total_cost_usd;
    }
    if terminal.duration_ms.is_some() {
        record.duration_ms = terminal.duration_ms;
    }
    doc.set_status(terminal.task_status());
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
