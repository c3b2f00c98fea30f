//! Conversation messages.

use serde::{Deserialize, Serialize};

use crate::content::ContentBlock;
use crate::ids::MessageId;
use crate::task::now_ms;

/// Who authored a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The human collaborator.
    User,
    /// The agent.
    Assistant,
}

/// One entry in a task's conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Message id.
    pub message_id: MessageId,
    /// Author.
    pub role: Role,
    /// Ordered content.
    pub content: Vec<ContentBlock>,
    /// Unix milliseconds.
    pub timestamp: i64,
}

impl Message {
    /// A user message stamped now.
    #[must_use]
    pub fn user(content: Vec<ContentBlock>) -> Self {
        Self::new(Role::User, content)
    }

    /// An assistant message stamped now.
    #[must_use]
    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self::new(Role::Assistant, content)
    }

    fn new(role: Role, content: Vec<ContentBlock>) -> Self {
        Self {
            message_id: MessageId::new(),
            role,
            content,
            timestamp: now_ms(),
        }
    }

    /// Whether a human wrote this message.
    #[must_use]
    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }

    /// Concatenated text of all text blocks.
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
    }

    #[test]
    fn text_joins_text_blocks_only() {
        let msg = Message::user(vec![
            ContentBlock::text("a"),
            ContentBlock::Thinking { text: "hidden".into() },
            ContentBlock::text("b"),
        ]);
        assert_eq!(msg.text(), "a\nb");
        assert!(msg.is_user());
    }

    #[test]
    fn message_uses_camel_case_keys() {
        let msg = Message::assistant(vec![]);
        let v = serde_json::to_value(&msg).unwrap();
        assert!(v.get("messageId").is_some());
        assert_eq!(v["role"], "assistant");
    }
}
