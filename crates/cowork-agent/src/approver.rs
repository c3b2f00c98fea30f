//! Terminal approver: answers permission requests as the remote peer.

use std::sync::Arc;

use cowork_core::{PermissionRequest, PermissionResponse, RiskLevel};
use cowork_doc::{EphemeralChannel, EphemeralUpdate, MemoryDocument, Origin};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Oldest request that has no response yet.
fn next_unanswered(doc: &MemoryDocument) -> Option<(String, PermissionRequest)> {
    let responses = doc.responses();
    doc.requests()
        .get_all()
        .into_iter()
        .filter(|(key, entry)| entry.origin == Origin::Local && responses.get(key).is_none())
        .min_by_key(|(_, entry)| entry.value.created_at)
        .map(|(key, entry)| (key, entry.value))
}

/// Map a typed answer to a decision. Anything other than yes denies, and
/// text that is not a plain "no" is relayed as the reason.
pub(crate) fn parse_answer(line: Option<&str>) -> PermissionResponse {
    let Some(line) = line.map(str::trim) else {
        return PermissionResponse::denied("no approver on the terminal");
    };
    match line.to_ascii_lowercase().as_str() {
        "y" | "yes" => PermissionResponse::approved(),
        "" | "n" | "no" => PermissionResponse::denied("denied from the terminal"),
        _ => PermissionResponse::denied(line),
    }
}

fn describe(key: &str, request: &PermissionRequest) -> String {
    let level = match request.risk_level {
        RiskLevel::Low => "low",
        RiskLevel::Medium => "medium",
        RiskLevel::High => "HIGH",
    };
    let mut text = format!("[{level}] {} wants to run ({key})", request.tool_name);
    if let Some(command) = request.tool_input.get("command").and_then(Value::as_str) {
        text.push_str(&format!("\n    $ {command}"));
    } else if let Some(path) = request.tool_input.get("file_path").and_then(Value::as_str) {
        text.push_str(&format!("\n    {path}"));
    }
    if let Some(reason) = &request.reason {
        text.push_str(&format!("\n    {reason}"));
    }
    if let Some(path) = &request.blocked_path {
        text.push_str(&format!("\n    protected path: {path}"));
    }
    text
}

/// Resolves once `key` is no longer requested.
async fn withdrawn(
    doc: &MemoryDocument,
    updates: &mut broadcast::Receiver<EphemeralUpdate<PermissionRequest>>,
    key: &str,
) {
    loop {
        if doc.requests().get(key).is_none() {
            return;
        }
        if let Err(RecvError::Closed) = updates.recv().await {
            std::future::pending::<()>().await;
        }
    }
}

/// Prompt for every request the local agent host publishes until `done`.
pub(crate) async fn run(doc: Arc<MemoryDocument>, approve_all: bool, done: CancellationToken) {
    let mut updates = doc.requests().subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let Some((key, request)) = next_unanswered(&doc) else {
            tokio::select! {
                () = done.cancelled() => return,
                update = updates.recv() => {
                    if let Err(RecvError::Closed) = update {
                        return;
                    }
                }
            }
            continue;
        };

        eprintln!("{}", describe(&key, &request));
        let response = if approve_all {
            eprintln!("    approved (--yes)");
            PermissionResponse::approved()
        } else {
            eprint!("    allow? [y/N/reason] ");
            tokio::select! {
                () = done.cancelled() => return,
                line = lines.next_line() => parse_answer(line.ok().flatten().as_deref()),
                () = withdrawn(&doc, &mut updates, &key) => {
                    eprintln!("\n    (request withdrawn)");
                    continue;
                }
            }
        };
        debug!(tool_use_id = %key, decision = ?response.decision, "answering permission request");
        doc.responses().apply_remote_set(&key, response);
    }
}
