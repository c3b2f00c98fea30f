//! Validation errors for the core model.

use thiserror::Error;

use crate::task::SessionStatus;

/// Errors raised by model invariants.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A mutation targeted a session that already reached a terminal state.
    #[error("session {session_id} is already {status:?}")]
    SessionClosed {
        /// Offending session.
        session_id: String,
        /// Its terminal status.
        status: SessionStatus,
    },

    /// A transition the session lifecycle does not allow.
    #[error("session {session_id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        /// Offending session.
        session_id: String,
        /// Current status.
        from: SessionStatus,
        /// Requested status.
        to: SessionStatus,
    },
}
