//! Branded ID newtypes.
//!
//! Tasks, sessions, and messages each get a distinct newtype over `String`
//! so a session id can never be passed where a task id is expected. Locally
//! minted ids are UUID v7 (time-ordered). Ids that arrive from elsewhere
//! (the agent's own session id, a peer's message id) are wrapped verbatim.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

fn new_v7() -> String {
    Uuid::now_v7().to_string()
}

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Mint a fresh id (UUID v7).
            #[must_use]
            pub fn new() -> Self {
                Self(new_v7())
            }

            /// Wrap an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Borrow the inner string.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Identifier of a task (one replicated document, at most one live agent).
    TaskId
}

branded_id! {
    /// Identifier of a session record inside a task document.
    SessionId
}

branded_id! {
    /// Identifier of a conversation message.
    MessageId
}

branded_id! {
    /// Machine that hosts the agent subprocess for a session.
    MachineId
}

/// Session id assigned by the agent runtime itself.
///
/// Empty until the runtime reports it; resumption is only possible once it
/// is non-empty.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentSessionId(String);

impl AgentSessionId {
    /// Wrap an id reported by the agent runtime.
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Whether the runtime has assigned an id yet.
    #[must_use]
    pub fn is_assigned(&self) -> bool {
        !self.0.is_empty()
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentSessionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_new_is_uuid_v7() {
        let id = SessionId::new();
        let parsed = Uuid::parse_str(id.as_str()).expect("should be valid UUID");
        assert_eq!(parsed.get_version(), Some(uuid::Version::SortRand));
    }

    #[test]
    fn ids_are_unique() {
        let a = TaskId::new();
        let b = TaskId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn v7_ids_sort_by_creation() {
        let first = MessageId::new();
        let second = MessageId::new();
        assert!(first.as_str() < second.as_str());
    }

    #[test]
    fn serde_is_transparent() {
        let id = TaskId::from("task-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"task-1\"");
        let back: TaskId = serde_json::from_str("\"task-1\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn deref_and_display() {
        let id = SessionId::from("s-1");
        assert_eq!(&*id, "s-1");
        assert_eq!(id.to_string(), "s-1");
        assert_eq!(String::from(id), "s-1");
    }

    #[test]
    fn agent_session_id_default_is_unassigned() {
        assert!(!AgentSessionId::default().is_assigned());
        assert!(AgentSessionId::new("abc").is_assigned());
    }

    #[test]
    fn agent_session_id_serializes_as_plain_string() {
        let id = AgentSessionId::default();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"\"");
    }
}
