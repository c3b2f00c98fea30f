//! Prints assistant output as it lands in the document.

use std::sync::Arc;

use cowork_core::{ContentBlock, Role, TaskDocument};
use cowork_doc::{MemoryDocument, TaskDocumentHandle};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

/// Position of the next unprinted block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Cursor {
    message: usize,
    block: usize,
}

impl Cursor {
    pub(crate) fn at_message(message: usize) -> Self {
        Self { message, block: 0 }
    }
}

fn render(block: &ContentBlock) -> Option<String> {
    match block {
        ContentBlock::Text { text } => Some(text.clone()),
        ContentBlock::ToolUse { tool_name, .. } => Some(format!("» {tool_name}")),
        ContentBlock::ToolResult { is_error: true, content, .. } => {
            let first = content.lines().next().unwrap_or_default();
            Some(format!("  ✗ {first}"))
        }
        _ => None,
    }
}

/// Render assistant blocks past `cursor` and advance it. Tool results are
/// appended to the trailing message in place, so the cursor tracks blocks
/// within the last message too.
pub(crate) fn take_new(doc: &TaskDocument, cursor: &mut Cursor) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(message) = doc.conversation.get(cursor.message) {
        if message.role == Role::Assistant {
            lines.extend(message.content.iter().skip(cursor.block).filter_map(render));
        }
        if cursor.message + 1 < doc.conversation.len() {
            cursor.message += 1;
            cursor.block = 0;
        } else {
            cursor.block = message.content.len();
            break;
        }
    }
    lines
}

/// Print new output on every change until `done`, then flush once more.
pub(crate) async fn stream(doc: Arc<MemoryDocument>, first_message: usize, done: CancellationToken) {
    let mut changes = doc.subscribe();
    let mut cursor = Cursor::at_message(first_message);
    loop {
        for line in take_new(&doc.snapshot(), &mut cursor) {
            println!("{line}");
        }
        tokio::select! {
            () = done.cancelled() => break,
            change = changes.recv() => {
                if let Err(RecvError::Closed) = change {
                    break;
                }
            }
        }
    }
    for line in take_new(&doc.snapshot(), &mut cursor) {
        println!("{line}");
    }
}
