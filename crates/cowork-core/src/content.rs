//! Content blocks stored in conversation messages.
//!
//! The agent runtime emits content in its own wire shape (snake_case keys,
//! nested `source` objects for images, tool results whose `content` may be a
//! string or an array of parts). [`parse_content_blocks`] normalizes that into
//! [`ContentBlock`]s. Anything unrecognized or structurally invalid is
//! dropped so the replicated document never holds a malformed block.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::constants::SUPPORTED_IMAGE_TYPES;

/// A single block of message content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text.
        text: String,
    },
    /// Base64 image.
    #[serde(rename_all = "camelCase")]
    Image {
        /// Base64-encoded bytes.
        data: String,
        /// One of the supported image media types.
        media_type: String,
    },
    /// A tool invocation made by the agent.
    #[serde(rename_all = "camelCase")]
    ToolUse {
        /// Tool-invocation id, unique per call.
        tool_use_id: String,
        /// Tool name.
        tool_name: String,
        /// Serialized JSON input.
        input: String,
        /// Parent invocation when issued from a sub-agent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_tool_use_id: Option<String>,
    },
    /// The outcome of a tool invocation.
    #[serde(rename_all = "camelCase")]
    ToolResult {
        /// The invocation this result answers.
        tool_use_id: String,
        /// Flattened textual result.
        content: String,
        /// Whether the tool reported failure.
        #[serde(default)]
        is_error: bool,
    },
    /// Model reasoning.
    Thinking {
        /// Reasoning text.
        text: String,
    },
}

impl ContentBlock {
    /// Shorthand for a text block.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Text of a `Text` block.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Whether this is a tool result block.
    #[must_use]
    pub fn is_tool_result(&self) -> bool {
        matches!(self, Self::ToolResult { .. })
    }

    /// Convert back to the agent runtime's wire shape.
    ///
    /// Used when forwarding user turns to the agent's input stream.
    #[must_use]
    pub fn to_wire(&self) -> Value {
        match self {
            Self::Text { text } => json!({ "type": "text", "text": text }),
            Self::Image { data, media_type } => json!({
                "type": "image",
                "source": { "type": "base64", "media_type": media_type, "data": data },
            }),
            Self::ToolUse {
                tool_use_id,
                tool_name,
                input,
                ..
            } => {
                let input: Value =
                    serde_json::from_str(input).unwrap_or_else(|_| Value::Object(Map::new()));
                json!({ "type": "tool_use", "id": tool_use_id, "name": tool_name, "input": input })
            }
            Self::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
                "is_error": is_error,
            }),
            Self::Thinking { text } => json!({ "type": "thinking", "thinking": text }),
        }
    }
}

/// Parse raw agent content into blocks, dropping what can't be represented.
///
/// `parent_tool_use_id` is stamped onto every `tool_use` block, matching the
/// parent reported on the enclosing agent event.
pub fn parse_content_blocks(raw: &[Value], parent_tool_use_id: Option<&str>) -> Vec<ContentBlock> {
    raw.iter()
        .filter_map(|value| {
            let block = parse_block(value, parent_tool_use_id);
            if block.is_none() {
                let block_type = value
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("<none>");
                debug!(block_type, "dropping unsupported content block");
            }
            block
        })
        .collect()
}

fn parse_block(value: &Value, parent_tool_use_id: Option<&str>) -> Option<ContentBlock> {
    let obj = value.as_object()?;
    match obj.get("type")?.as_str()? {
        "text" => Some(ContentBlock::Text {
            text: str_field(obj, "text")?.to_owned(),
        }),
        "thinking" => Some(ContentBlock::Thinking {
            text: str_field(obj, "thinking")
                .or_else(|| str_field(obj, "text"))?
                .to_owned(),
        }),
        "image" => parse_image(obj),
        "tool_use" => {
            let input = match obj.get("input") {
                None | Some(Value::Null) => "{}".to_owned(),
                Some(v) => v.to_string(),
            };
            Some(ContentBlock::ToolUse {
                tool_use_id: non_empty(str_field(obj, "id")?)?,
                tool_name: non_empty(str_field(obj, "name")?)?,
                input,
                parent_tool_use_id: parent_tool_use_id.map(str::to_owned),
            })
        }
        "tool_result" => Some(ContentBlock::ToolResult {
            tool_use_id: non_empty(str_field(obj, "tool_use_id")?)?,
            content: flatten_tool_result(obj.get("content"))?,
            is_error: obj.get("is_error").and_then(Value::as_bool).unwrap_or(false),
        }),
        _ => None,
    }
}

fn parse_image(obj: &Map<String, Value>) -> Option<ContentBlock> {
    let source = obj.get("source")?.as_object()?;
    if source.get("type").and_then(Value::as_str) != Some("base64") {
        return None;
    }
    let media_type = str_field(source, "media_type")?;
    if !SUPPORTED_IMAGE_TYPES.contains(&media_type) {
        return None;
    }
    let data = str_field(source, "data")?;
    if BASE64.decode(data).is_err() {
        return None;
    }
    Some(ContentBlock::Image {
        data: data.to_owned(),
        media_type: media_type.to_owned(),
    })
}

/// Tool result content is a string, an array of parts, or absent.
///
/// Text parts are joined with newlines; non-text parts are skipped. Any other
/// JSON shape is invalid.
fn flatten_tool_result(content: Option<&Value>) -> Option<String> {
    match content {
        None | Some(Value::Null) => Some(String::new()),
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(parts)) => Some(
            parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        Some(_) => None,
    }
}

fn str_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_owned())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
