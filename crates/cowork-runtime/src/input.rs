//! Streaming input channel.
//!
//! One long-lived agent invocation consumes user turns from an
//! [`InputReader`]. Producers [`push`](InputChannel::push) turns at any time
//! and [`end`](InputChannel::end) the channel when no more will come. Turns
//! queued before `end` are still delivered; the reader then sees end of
//! stream.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use cowork_core::{ContentBlock, MessageId};
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::errors::RuntimeError;

/// One user turn destined for the agent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserTurn {
    /// Conversation message this turn came from, if any.
    pub message_id: Option<MessageId>,
    /// Turn content.
    pub content: Vec<ContentBlock>,
}

impl UserTurn {
    /// A turn holding one text block.
    #[must_use]
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            message_id: None,
            content: vec![ContentBlock::text(text)],
        }
    }

    /// Text blocks joined by newlines.
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Whether the turn has any content to send.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.iter().all(|b| match b {
            ContentBlock::Text { text } => text.trim().is_empty(),
            _ => false,
        })
    }
}

/// Producer side of the channel.
pub struct InputChannel {
    tx: Mutex<Option<mpsc::UnboundedSender<UserTurn>>>,
    reader: Mutex<Option<InputReader>>,
    ended: AtomicBool,
}

impl InputChannel {
    /// Open a channel with its reader ready to be taken.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            reader: Mutex::new(Some(InputReader { rx })),
            ended: AtomicBool::new(false),
        }
    }

    /// Queue a turn.
    ///
    /// Fails once the channel has ended or the reader has gone away.
    pub fn push(&self, turn: UserTurn) -> Result<(), RuntimeError> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(RuntimeError::InputClosed)?;
        tx.send(turn).map_err(|_| RuntimeError::InputClosed)
    }

    /// Signal that no more turns will be pushed. Idempotent.
    pub fn end(&self) {
        self.ended.store(true, Ordering::SeqCst);
        drop(self.tx.lock().take());
    }

    /// Whether [`end`](Self::end) was called.
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Take the single reader. Later calls return `None`.
    pub fn take_reader(&self) -> Option<InputReader> {
        self.reader.lock().take()
    }
}

impl Default for InputChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer side; a `Stream` of turns.
pub struct InputReader {
    rx: mpsc::UnboundedReceiver<UserTurn>,
}

impl Stream for InputReader {
    type Item = UserTurn;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
