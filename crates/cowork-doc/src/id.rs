//! Deterministic document naming.
//!
//! Every peer derives the same id from `(kind, task id, schema epoch)`, so a
//! schema migration bumps the epoch and moves everyone to a fresh document.

use std::fmt;
use std::str::FromStr;

use cowork_core::TaskId;
use serde::{Deserialize, Serialize};

use crate::errors::DocumentError;

/// Kind of replicated document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    /// Per-task conversation and session state.
    Task,
}

impl DocumentKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
        }
    }
}

/// `{kind}-{taskId}-v{epoch}`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DocumentId {
    /// Kind.
    pub kind: DocumentKind,
    /// Owning task.
    pub task_id: TaskId,
    /// Schema epoch.
    pub epoch: u32,
}

impl DocumentId {
    /// Id of the task document for `task_id` at `epoch`.
    #[must_use]
    pub fn task(task_id: TaskId, epoch: u32) -> Self {
        Self {
            kind: DocumentKind::Task,
            task_id,
            epoch,
        }
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-v{}", self.kind.as_str(), self.task_id, self.epoch)
    }
}

impl FromStr for DocumentId {
    type Err = DocumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DocumentError::InvalidId(s.to_owned());
        let rest = s.strip_prefix("task-").ok_or_else(invalid)?;
        // Task ids may contain dashes, so split at the last one.
        let (task, epoch) = rest.rsplit_once("-v").ok_or_else(invalid)?;
        if task.is_empty() {
            return Err(invalid());
        }
        let epoch = epoch.parse().map_err(|_| invalid())?;
        Ok(Self::task(TaskId::from(task), epoch))
    }
}
