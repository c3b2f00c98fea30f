//! Ephemeral permission payloads.
//!
//! Requests and responses live on two ephemeral channels of the task
//! document, both keyed by the tool-invocation id. They are never persisted.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How dangerous a tool invocation looks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Read-only or otherwise harmless.
    Low,
    /// Mutates the workspace.
    Medium,
    /// Destructive or touches protected paths.
    High,
}

/// A pending approval request published by the local agent host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    /// Tool name.
    pub tool_name: String,
    /// Raw tool input.
    pub tool_input: Value,
    /// Classified risk.
    pub risk_level: RiskLevel,
    /// Why the classifier picked this level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Protected path the invocation touches, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_path: Option<String>,
    /// Sub-agent issuing the call, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Unix milliseconds.
    pub created_at: i64,
}

/// Approve or deny.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionDecision {
    /// Allow the invocation.
    Approved,
    /// Refuse the invocation.
    Denied,
}

/// A decision published by a remote approver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionResponse {
    /// The decision.
    pub decision: PermissionDecision,
    /// Optional note relayed to the agent on denial.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PermissionResponse {
    /// An approval with no message.
    #[must_use]
    pub fn approved() -> Self {
        Self {
            decision: PermissionDecision::Approved,
            message: None,
        }
    }

    /// A denial with a message.
    #[must_use]
    pub fn denied(message: impl Into<String>) -> Self {
        Self {
            decision: PermissionDecision::Denied,
            message: Some(message.into()),
        }
    }
}
