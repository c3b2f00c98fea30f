//! # cowork-core
//!
//! Foundation types shared by every cowork crate.
//!
//! - **Branded IDs**: `TaskId`, `SessionId`, `MessageId`, `AgentSessionId`, `MachineId`
//! - **Content blocks**: `ContentBlock` plus tolerant parsing of agent wire payloads
//! - **Messages**: conversation `Message` with `Role`
//! - **Task document**: `TaskDocument`, `SessionRecord`, `PlanArtifact` and their statuses
//! - **Permissions**: ephemeral `PermissionRequest` / `PermissionResponse` payloads
//! - **Errors**: `CoreError` for validation failures

#![deny(unsafe_code)]

pub mod constants;
pub mod content;
pub mod errors;
pub mod ids;
pub mod messages;
pub mod permissions;
pub mod task;

pub use content::{ContentBlock, parse_content_blocks};
pub use errors::CoreError;
pub use ids::{AgentSessionId, MachineId, MessageId, SessionId, TaskId};
pub use messages::{Message, Role};
pub use permissions::{PermissionDecision, PermissionRequest, PermissionResponse, RiskLevel};
pub use task::{
    PlanArtifact, SessionRecord, SessionStatus, TaskDocument, TaskMeta, TaskStatus, now_ms,
};
