//! Claude Code `stream-json` wire format.
//!
//! One JSON object per line in both directions. Incoming lines are parsed into
//! [`WireMessage`] and sorted by [`classify`] into agent events, control
//! traffic, or noise. Outgoing lines are built by [`user_turn_line`] and
//! [`control_response_line`].

use cowork_core::AgentSessionId;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{AgentEvent, AgentResult, PermissionOutcome, ToolPermissionRequest};
use crate::input::UserTurn;

/// A line emitted by the agent on stdout.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// `system` messages; `init` carries the session id.
    System {
        /// Subtype.
        subtype: String,
        /// Runtime session id.
        #[serde(default)]
        session_id: Option<String>,
        /// Model in use.
        #[serde(default)]
        model: Option<String>,
    },
    /// Assistant output.
    Assistant {
        /// Sub-agent parent.
        #[serde(default)]
        parent_tool_use_id: Option<String>,
        /// Message body.
        message: WireBody,
    },
    /// User-side content (tool results).
    User {
        /// Sub-agent parent.
        #[serde(default)]
        parent_tool_use_id: Option<String>,
        /// Message body.
        message: WireBody,
    },
    /// Heartbeat for a long-running tool.
    ToolProgress {
        /// Invocation id.
        tool_use_id: String,
        /// Tool name.
        tool_name: String,
        /// Seconds so far.
        #[serde(default)]
        elapsed_time_seconds: f64,
    },
    /// End of a turn.
    Result {
        /// `success` or an error subtype.
        subtype: String,
        /// Final text.
        #[serde(default)]
        result: Option<String>,
        /// Failure flag.
        #[serde(default)]
        is_error: bool,
        /// Cost.
        #[serde(default)]
        total_cost_usd: Option<f64>,
        /// Wall duration.
        #[serde(default)]
        duration_ms: Option<u64>,
        /// Turns taken.
        #[serde(default)]
        num_turns: Option<u32>,
    },
    /// Request from the agent that expects a `control_response`.
    ControlRequest {
        /// Correlation id.
        request_id: String,
        /// Body.
        request: ControlRequestBody,
    },
    /// The agent withdrew an earlier control request.
    ControlCancelRequest {
        /// Correlation id.
        request_id: String,
    },
    /// Anything else (`stream_event`, `log`, acknowledgements).
    #[serde(other)]
    Other,
}

/// `message` payload of assistant/user lines.
#[derive(Debug, Clone, Deserialize)]
pub struct WireBody {
    /// A string or an array of content blocks.
    #[serde(default)]
    pub content: Value,
}

impl WireBody {
    /// Content normalized to a block array.
    #[must_use]
    pub fn blocks(&self) -> Vec<Value> {
        match &self.content {
            Value::Array(items) => items.clone(),
            Value::String(text) => vec![json!({ "type": "text", "text": text })],
            _ => Vec::new(),
        }
    }
}

/// Body of a `control_request`.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlRequestBody {
    /// `can_use_tool`, `hook_callback`, ...
    pub subtype: String,
    /// Tool name for `can_use_tool`.
    #[serde(default)]
    pub tool_name: Option<String>,
    /// Tool input for `can_use_tool`.
    #[serde(default)]
    pub input: Option<Value>,
    /// Invocation id, when the runtime reports it.
    #[serde(default)]
    pub tool_use_id: Option<String>,
    /// Path the runtime flagged.
    #[serde(default)]
    pub blocked_path: Option<String>,
    /// Sub-agent id.
    #[serde(default)]
    pub agent_id: Option<String>,
}

/// What to do with one incoming line.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Forward to the session.
    Event(AgentEvent),
    /// Ask the permission callback, answer with `request_id`.
    Permission {
        /// Correlation id.
        request_id: String,
        /// Prompt.
        request: ToolPermissionRequest,
    },
    /// A control request we do not handle; answer with an error.
    UnsupportedControl {
        /// Correlation id.
        request_id: String,
        /// Its subtype.
        subtype: String,
    },
    /// Withdraw a pending permission prompt.
    Cancel {
        /// Correlation id.
        request_id: String,
    },
    /// Nothing to do.
    Ignore,
}

/// Sort a parsed line.
#[must_use]
pub fn classify(message: WireMessage) -> Incoming {
    match message {
        WireMessage::System {
            subtype,
            session_id,
            model,
        } => match (subtype.as_str(), session_id) {
            ("init", Some(id)) if !id.is_empty() => Incoming::Event(AgentEvent::Init {
                agent_session_id: AgentSessionId::new(id),
                model,
            }),
            _ => Incoming::Ignore,
        },
        WireMessage::Assistant {
            parent_tool_use_id,
            message,
        } => Incoming::Event(AgentEvent::Assistant {
            content: message.blocks(),
            parent_tool_use_id,
        }),
        WireMessage::User {
            parent_tool_use_id,
            message,
        } => Incoming::Event(AgentEvent::User {
            content: message.blocks(),
            parent_tool_use_id,
        }),
        WireMessage::ToolProgress {
            tool_use_id,
            tool_name,
            elapsed_time_seconds,
        } => Incoming::Event(AgentEvent::ToolProgress {
            tool_use_id,
            tool_name,
            elapsed_secs: elapsed_time_seconds,
        }),
        WireMessage::Result {
            subtype,
            result,
            is_error,
            total_cost_usd,
            duration_ms,
            num_turns,
        } => Incoming::Event(AgentEvent::Result(AgentResult {
            is_error: is_error || subtype != "success",
            subtype,
            result,
            total_cost_usd,
            duration_ms,
            num_turns,
        })),
        WireMessage::ControlRequest {
            request_id,
            request,
        } => {
            if request.subtype != "can_use_tool" {
                return Incoming::UnsupportedControl {
                    request_id,
                    subtype: request.subtype,
                };
            }
            let tool_use_id = request
                .tool_use_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| request_id.clone());
            Incoming::Permission {
                request: ToolPermissionRequest {
                    tool_name: request.tool_name.unwrap_or_default(),
                    input: request.input.unwrap_or_else(|| json!({})),
                    tool_use_id,
                    blocked_path: request.blocked_path,
                    agent_id: request.agent_id,
                },
                request_id,
            }
        }
        WireMessage::ControlCancelRequest { request_id } => Incoming::Cancel { request_id },
        WireMessage::Other => Incoming::Ignore,
    }
}

/// Parse and classify one stdout line. `None` for unparseable input.
#[must_use]
pub fn parse_line(line: &str) -> Option<Incoming> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Some(Incoming::Ignore);
    }
    serde_json::from_str::<WireMessage>(trimmed).ok().map(classify)
}

/// Serialize a user turn for stdin.
#[must_use]
pub fn user_turn_line(turn: &UserTurn) -> String {
    let content: Vec<Value> = turn.content.iter().map(cowork_core::ContentBlock::to_wire).collect();
    json!({
        "type": "user",
        "message": { "role": "user", "content": content },
        "parent_tool_use_id": null,
        "session_id": "",
    })
    .to_string()
}

/// Serialize the answer to a `can_use_tool` request.
#[must_use]
pub fn control_response_line(request_id: &str, outcome: &PermissionOutcome) -> String {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": outcome,
        },
    })
    .to_string()
}

/// Serialize an error answer to an unsupported control request.
#[must_use]
pub fn control_error_line(request_id: &str, error: &str) -> String {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "error",
            "request_id": request_id,
            "error": error,
        },
    })
    .to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
