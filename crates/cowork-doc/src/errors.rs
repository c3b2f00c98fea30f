//! Document engine errors.

use thiserror::Error;

/// Errors surfaced by document handles and providers.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// The handle was closed and no longer accepts changes.
    #[error("document {0} is closed")]
    Closed(String),

    /// A document id string could not be parsed.
    #[error("invalid document id: {0}")]
    InvalidId(String),

    /// The provider could not open the document.
    #[error("failed to open document {id}: {message}")]
    Open {
        /// Requested id.
        id: String,
        /// Engine-specific reason.
        message: String,
    },
}
