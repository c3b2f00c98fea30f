//! Runtime error types.

use cowork_doc::DocumentError;

/// Errors raised while coordinating agent sessions.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Input rejected before any subprocess work.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The resume target cannot be resumed.
    #[error("Resume error: {0}")]
    Resume(String),

    /// The agent subprocess could not be launched.
    #[error("Launch error: {0}")]
    Launch(String),

    /// The agent runtime misbehaved after launch.
    #[error("Agent error: {0}")]
    Agent(String),

    /// A turn was pushed after the input channel ended.
    #[error("Input channel closed")]
    InputClosed,

    /// A follow-up was sent to a session that is not streaming.
    #[error("Session not streaming: {0}")]
    NotStreaming(String),

    /// No live session or subprocess for the task.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Document engine failure.
    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    /// Internal / unexpected error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Stable category string for logs and session records.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Resume(_) => "resume",
            Self::Launch(_) | Self::Agent(_) => "subprocess",
            Self::InputClosed | Self::NotStreaming(_) => "input",
            Self::TaskNotFound(_) => "not_found",
            Self::Document(_) => "document",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether the caller may retry the same request.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Launch(_) | Self::Agent(_) | Self::NotStreaming(_) | Self::Document(_)
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
