//! # cowork-runtime
//!
//! Agent-session orchestration over a replicated task document.
//!
//! - **Input**: long-lived user-turn queue feeding one agent invocation
//! - **Spawn**: per-task launch lock, at most one tracked subprocess per task
//! - **Session**: `pending -> active -> completed | failed | interrupted`, folding agent events into the document
//! - **Tunnel**: permission prompts round-tripped through the document's ephemeral channels
//! - **Risk**: low / medium / high classification of tool invocations
//! - **Dispatch**: pure gate deciding whether unprocessed human input exists
//! - **Orchestrator**: notifications, follow-ups, resume, re-arm, stop
//! - **Driver**: the agent runtime seam and the Claude Code subprocess driver

#![deny(unsafe_code)]

pub mod dispatch;
pub mod driver;
pub mod errors;
mod fold;
pub mod input;
pub mod orchestrator;
pub mod risk;
pub mod session;
pub mod spawn;
pub mod tunnel;
pub mod watchdog;

#[cfg(test)]
mod test_support;

pub use dispatch::{DispatchDecision, SkipReason};
pub use driver::claude::ClaudeCodeDriver;
pub use driver::{
    AgentDriver, AgentEvent, AgentResult, AgentRun, DriverOptions, PermissionCallback,
    PermissionOutcome, RunControl, ToolPermissionRequest,
};
pub use errors::RuntimeError;
pub use input::{InputChannel, InputReader, UserTurn};
pub use orchestrator::{DispatchResult, TaskOrchestrator};
pub use risk::{RiskAssessment, RiskClassifier};
pub use session::{AgentSession, FailureKind, SessionConfig, SessionDeps, SessionOutcome};
pub use spawn::{AgentProcessInfo, LaunchConfig, ProcessHandle, SpawnCoordinator, SpawnGuard};
pub use tunnel::PermissionTunnel;
pub use watchdog::{ActivityClock, WatchdogResult};
