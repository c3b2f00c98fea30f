//! Dispatch gate.
//!
//! Decides from a conversation snapshot whether a new agent turn should
//! start. The watermark is the conversation length already handed to an
//! agent; only the tail past it is considered.

use cowork_core::Message;

/// Why no turn was dispatched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// A session is already running for the task.
    ActiveTask,
    /// Nothing in the conversation.
    EmptyConversation,
    /// Nothing past the watermark.
    NoNewMessages,
    /// The unprocessed tail has no user message.
    NoUserMessages,
}

impl SkipReason {
    /// Stable kebab-case name for logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ActiveTask => "active-task",
            Self::EmptyConversation => "empty-conversation",
            Self::NoNewMessages => "no-new-messages",
            Self::NoUserMessages => "no-user-messages",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gate verdict.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchDecision {
    /// Start a turn triggered by `message`.
    Dispatch {
        /// The most recent unprocessed user message.
        message: Message,
        /// Its position in the conversation.
        index: usize,
    },
    /// Do nothing.
    Skip(SkipReason),
}

/// Evaluate the gate.
#[must_use]
pub fn evaluate(conversation: &[Message], watermark: usize, has_active_session: bool) -> DispatchDecision {
    if has_active_session {
        return DispatchDecision::Skip(SkipReason::ActiveTask);
    }
    if conversation.is_empty() {
        return DispatchDecision::Skip(SkipReason::EmptyConversation);
    }
    if conversation.len() <= watermark {
        return DispatchDecision::Skip(SkipReason::NoNewMessages);
    }
    conversation
        .iter()
        .enumerate()
        .skip(watermark)
        .rev()
        .find(|(_, m)| m.is_user())
        .map_or(DispatchDecision::Skip(SkipReason::NoUserMessages), |(index, message)| {
            DispatchDecision::Dispatch {
                message: message.clone(),
                index,
            }
        })
}

/// User messages past `watermark`, oldest first.
#[must_use]
pub fn new_user_messages(conversation: &[Message], watermark: usize) -> Vec<&Message> {
    conversation
        .iter()
        .skip(watermark)
        .filter(|m| m.is_user())
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
