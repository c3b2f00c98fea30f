//! Permission tunnel: local approval callback to remote human decision.
//!
//! Each prompt is published as a [`PermissionRequest`] on the document's
//! request channel under the tool-invocation id, and the task moves to
//! `input-required`. The tunnel then waits for a remote-origin
//! [`PermissionResponse`] under the same key. Local writes, other keys, and
//! responses that arrive after the request is gone are ignored. Once resolved,
//! request and response are deleted together.
//!
//! Cancellation resolves `deny("aborted")`; an optional timeout resolves a
//! denial too. The tunnel never allows by default.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cowork_core::constants::ABORTED_MESSAGE;
use cowork_core::{
    PermissionDecision, PermissionRequest, PermissionResponse, RiskLevel, TaskStatus, now_ms,
};
use cowork_doc::{Origin, TaskDocumentExt, TaskDocumentHandle};
use cowork_settings::PermissionSettings;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::driver::{PermissionCallback, PermissionOutcome, ToolPermissionRequest};
use crate::risk::RiskClassifier;

enum Wait {
    Decided(PermissionResponse),
    Closed,
}

/// A published request. Dropping it deletes request and response, so a
/// prompt abandoned with its session does not linger in the document.
struct Published {
    doc: Arc<dyn TaskDocumentHandle>,
    key: String,
}

impl Drop for Published {
    fn drop(&mut self) {
        self.doc.permission_requests().delete(&self.key);
        self.doc.permission_responses().delete(&self.key);
    }
}

/// [`PermissionCallback`] backed by the task document's ephemeral channels.
pub struct PermissionTunnel {
    doc: Arc<dyn TaskDocumentHandle>,
    classifier: Arc<RiskClassifier>,
    auto_approve: HashSet<String>,
    timeout: Option<Duration>,
}

impl PermissionTunnel {
    /// Tunnel over `doc` configured by `settings`.
    #[must_use]
    pub fn new(
        doc: Arc<dyn TaskDocumentHandle>,
        classifier: Arc<RiskClassifier>,
        settings: &PermissionSettings,
    ) -> Self {
        Self {
            doc,
            classifier,
            auto_approve: settings.auto_approve_tools.iter().cloned().collect(),
            timeout: settings.response_timeout(),
        }
    }

    /// Publish `request` and wait for its resolution.
    #[instrument(skip_all, fields(tool = %request.tool_name, tool_use_id = %request.tool_use_id))]
    async fn round_trip(
        &self,
        request: ToolPermissionRequest,
        cancel: CancellationToken,
    ) -> PermissionOutcome {
        let key = request.tool_use_id.clone();
        let mut assessment = self.classifier.classify(&request.tool_name, &request.input);
        if let Some(path) = request.blocked_path.clone() {
            assessment.level = RiskLevel::High;
            assessment.blocked_path = Some(path);
        }

        // Subscribe before publishing so no response can slip past.
        let mut updates = self.doc.permission_responses().subscribe();
        self.doc.permission_responses().delete(&key);
        self.doc.permission_requests().set(
            &key,
            PermissionRequest {
                tool_name: request.tool_name.clone(),
                tool_input: request.input.clone(),
                risk_level: assessment.level,
                reason: assessment.reason,
                blocked_path: assessment.blocked_path,
                agent_id: request.agent_id.clone(),
                created_at: now_ms(),
            },
        );
        let published = Published {
            doc: Arc::clone(&self.doc),
            key: key.clone(),
        };
        self.set_status_if(TaskStatus::InputRequired, |_| true);
        info!(risk = ?assessment.level, "permission requested");

        let wait = async {
            loop {
                match updates.recv().await {
                    Ok(update) if update.key == key && update.origin == Origin::Remote => {
                        if let Some(response) = update.value {
                            if self.doc.permission_requests().get(&key).is_some() {
                                return Wait::Decided(response);
                            }
                            debug!("response arrived after request was withdrawn");
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "permission updates lagged, re-reading");
                        let pending = self.doc.permission_requests().get(&key).is_some();
                        match self.doc.permission_responses().get(&key) {
                            Some(entry) if pending && entry.origin == Origin::Remote => {
                                return Wait::Decided(entry.value);
                            }
                            _ => {}
                        }
                    }
                    Err(RecvError::Closed) => return Wait::Closed,
                }
            }
        };
        let deadline = async {
            match self.timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            waited = wait => match waited {
                Wait::Decided(response) => {
                    drop(published);
                    self.resume_working();
                    info!(decision = ?response.decision, "permission resolved");
                    to_outcome(response, request.input)
                }
                Wait::Closed => {
                    drop(published);
                    deny("document closed")
                }
            },
            () = cancel.cancelled() => {
                drop(published);
                info!("permission request aborted");
                deny(ABORTED_MESSAGE)
            }
            () = deadline => {
                drop(published);
                self.resume_working();
                warn!("permission request timed out");
                deny("timed out waiting for approval")
            }
        }
    }

    /// Back to `working` once no other request is pending.
    fn resume_working(&self) {
        if self.doc.permission_requests().get_all().is_empty() {
            self.set_status_if(TaskStatus::Working, |s| s == TaskStatus::InputRequired);
        }
    }

    fn set_status_if(&self, status: TaskStatus, pred: impl Fn(TaskStatus) -> bool) {
        let result = self.doc.update(|doc| {
            if pred(doc.meta.status) {
                doc.set_status(status);
            }
        });
        if let Err(e) = result {
            warn!(error = %e, ?status, "failed to update task status");
        }
    }
}

fn deny(message: &str) -> PermissionOutcome {
    PermissionOutcome::Deny {
        message: message.to_owned(),
    }
}

fn to_outcome(response: PermissionResponse, input: serde_json::Value) -> PermissionOutcome {
    match response.decision {
        PermissionDecision::Approved => PermissionOutcome::Allow {
            updated_input: input,
        },
        PermissionDecision::Denied => PermissionOutcome::Deny {
            message: response
                .message
                .unwrap_or_else(|| "denied by user".to_owned()),
        },
    }
}

#[async_trait]
impl PermissionCallback for PermissionTunnel {
    async fn can_use_tool(
        &self,
        request: ToolPermissionRequest,
        cancel: CancellationToken,
    ) -> PermissionOutcome {
        if self.auto_approve.contains(&request.tool_name) {
            debug!(tool = %request.tool_name, "auto-approved");
            return PermissionOutcome::Allow {
                updated_input: request.input,
            };
        }
        if cancel.is_cancelled() {
            return deny(ABORTED_MESSAGE);
        }
        self.round_trip(request, cancel).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use cowork_core::TaskId;
    use cowork_doc::{DocumentId, EphemeralChannel, MemoryDocument};
    use serde_json::json;

    fn setup(settings: PermissionSettings) -> (Arc<MemoryDocument>, Arc<PermissionTunnel>) {
        let doc = Arc::new(MemoryDocument::new(DocumentId::task(TaskId::from("t"), 1)));
        let classifier = Arc::new(RiskClassifier::new("/work", &[]).unwrap());
        let tunnel = Arc::new(PermissionTunnel::new(doc.clone(), classifier, &settings));
        (doc, tunnel)
    }

    fn no_auto() -> PermissionSettings {
        PermissionSettings {
            auto_approve_tools: vec![],
            ..PermissionSettings::default()
        }
    }

    fn bash(id: &str, cmd: &str) -> ToolPermissionRequest {
        ToolPermissionRequest {
            tool_name: "Bash".into(),
            input: json!({ "command": cmd }),
            tool_use_id: id.into(),
            blocked_path: None,
            agent_id: None,
        }
    }

    async fn wait_for_request(doc: &MemoryDocument, key: &str) -> PermissionRequest {
        for _ in 0..100 {
            if let Some(entry) = doc.permission_requests().get(key) {
                return entry.value;
            }
            tokio::task::yield_now().await;
        }
        panic!("request {key} never published");
    }

    #[tokio::test]
    async fn remote_approval_allows_and_cleans_up() {
        let (doc, tunnel) = setup(no_auto());
        let t = tunnel.clone();
        let pending = tokio::spawn(async move {
            t.can_use_tool(bash("tu_1", "ls"), CancellationToken::new()).await
        });

        let req = wait_for_request(&doc, "tu_1").await;
        assert_eq!(req.risk_level, RiskLevel::Medium);
        assert_eq!(doc.snapshot().meta.status, TaskStatus::InputRequired);

        doc.responses().apply_remote_set("tu_1", PermissionResponse::approved());
        let outcome = pending.await.unwrap();
        assert_eq!(outcome, PermissionOutcome::Allow { updated_input: json!({"command": "ls"}) });
        assert!(doc.permission_requests().get("tu_1").is_none());
        assert!(doc.permission_responses().get("tu_1").is_none());
        assert_eq!(doc.snapshot().meta.status, TaskStatus::Working);
    }

    #[tokio::test]
    async fn remote_denial_carries_message() {
        let (doc, tunnel) = setup(no_auto());
        let t = tunnel.clone();
        let pending = tokio::spawn(async move {
            t.can_use_tool(bash("tu_1", "rm -rf /"), CancellationToken::new()).await
        });
        let req = wait_for_request(&doc, "tu_1").await;
        assert_eq!(req.risk_level, RiskLevel::High);
        doc.responses().apply_remote_set("tu_1", PermissionResponse::denied("not on my watch"));
        assert_eq!(
            pending.await.unwrap(),
            PermissionOutcome::Deny { message: "not on my watch".into() }
        );
    }

    #[tokio::test]
    async fn local_and_foreign_responses_are_ignored() {
        let (doc, tunnel) = setup(no_auto());
        let t = tunnel.clone();
        let pending = tokio::spawn(async move {
            t.can_use_tool(bash("tu_1", "ls"), CancellationToken::new()).await
        });
        let _ = wait_for_request(&doc, "tu_1").await;

        doc.permission_responses().set("tu_1", PermissionResponse::approved());
        doc.responses().apply_remote_set("tu_other", PermissionResponse::approved());
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        doc.responses().apply_remote_set("tu_1", PermissionResponse::denied("no"));
        assert!(!pending.await.unwrap().is_allow());
    }

    #[tokio::test]
    async fn cancellation_denies_aborted_and_deletes_request() {
        let (doc, tunnel) = setup(no_auto());
        let cancel = CancellationToken::new();
        let t = tunnel.clone();
        let c = cancel.clone();
        let pending = tokio::spawn(async move { t.can_use_tool(bash("tu_1", "ls"), c).await });
        let _ = wait_for_request(&doc, "tu_1").await;

        cancel.cancel();
        assert_eq!(
            pending.await.unwrap(),
            PermissionOutcome::Deny { message: "aborted".into() }
        );
        assert!(doc.permission_requests().get("tu_1").is_none());
    }

    #[tokio::test]
    async fn abandoned_wait_deletes_request() {
        let (doc, tunnel) = setup(no_auto());
        let t = tunnel.clone();
        let pending = tokio::spawn(async move {
            t.can_use_tool(bash("tu_1", "make deploy"), CancellationToken::new()).await
        });
        let _ = wait_for_request(&doc, "tu_1").await;
        doc.permission_responses().set("tu_1", PermissionResponse::approved());

        pending.abort();
        assert!(pending.await.unwrap_err().is_cancelled());
        assert!(doc.permission_requests().get_all().is_empty());
        assert!(doc.permission_responses().get_all().is_empty());
    }

    #[tokio::test]
    async fn lagged_reader_ignores_response_to_withdrawn_request() {
        let (doc, tunnel) = setup(no_auto());
        let t = tunnel.clone();
        let pending = tokio::spawn(async move {
            t.can_use_tool(bash("tu_1", "ls"), CancellationToken::new()).await
        });
        let _ = wait_for_request(&doc, "tu_1").await;

        // Withdraw, then flood the channel so the waiter lags past the answer.
        doc.permission_requests().delete("tu_1");
        doc.responses().apply_remote_set("tu_1", PermissionResponse::approved());
        for i in 0..1_000 {
            doc.responses().apply_remote_set(&format!("noise_{i}"), PermissionResponse::approved());
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!pending.is_finished());
        pending.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_denies() {
        let (doc, tunnel) = setup(PermissionSettings {
            response_timeout_ms: Some(1_000),
            auto_approve_tools: vec![],
            protected_paths: vec![],
        });
        let outcome = tunnel.can_use_tool(bash("tu_1", "ls"), CancellationToken::new()).await;
        assert!(matches!(outcome, PermissionOutcome::Deny { message } if message.contains("timed out")));
        assert!(doc.permission_requests().get_all().is_empty());
        assert_eq!(doc.snapshot().meta.status, TaskStatus::Working);
    }

    #[tokio::test]
    async fn concurrent_requests_resolve_independently() {
        let (doc, tunnel) = setup(no_auto());
        let (t1, t2) = (tunnel.clone(), tunnel.clone());
        let first = tokio::spawn(async move { t1.can_use_tool(bash("a", "ls"), CancellationToken::new()).await });
        let second = tokio::spawn(async move { t2.can_use_tool(bash("b", "pwd"), CancellationToken::new()).await });
        let _ = wait_for_request(&doc, "a").await;
        let _ = wait_for_request(&doc, "b").await;

        doc.responses().apply_remote_set("b", PermissionResponse::approved());
        assert!(second.await.unwrap().is_allow());
        // "a" is still pending, so the task stays blocked.
        assert_eq!(doc.snapshot().meta.status, TaskStatus::InputRequired);
        assert!(!first.is_finished());

        doc.responses().apply_remote_set("a", PermissionResponse::denied("no"));
        assert!(!first.await.unwrap().is_allow());
        assert_eq!(doc.snapshot().meta.status, TaskStatus::Working);
    }

    #[tokio::test]
    async fn auto_approved_tools_skip_the_round_trip() {
        let (doc, tunnel) = setup(PermissionSettings::default());
        let req = ToolPermissionRequest {
            tool_name: "Read".into(),
            input: json!({"file_path": "a.rs"}),
            tool_use_id: "tu_r".into(),
            blocked_path: None,
            agent_id: None,
        };
        assert!(tunnel.can_use_tool(req, CancellationToken::new()).await.is_allow());
        assert!(doc.permission_requests().get_all().is_empty());
        assert_eq!(doc.snapshot().meta.status, TaskStatus::Submitted);
    }

    #[tokio::test]
    async fn runtime_flagged_path_raises_risk() {
        let (doc, tunnel) = setup(no_auto());
        let mut req = bash("tu_p", "cat x");
        req.blocked_path = Some("/etc/shadow".into());
        let t = tunnel.clone();
        let pending = tokio::spawn(async move { t.can_use_tool(req, CancellationToken::new()).await });
        let published = wait_for_request(&doc, "tu_p").await;
        assert_eq!(published.risk_level, RiskLevel::High);
        assert_eq!(published.blocked_path.as_deref(), Some("/etc/shadow"));
        doc.responses().apply_remote_set("tu_p", PermissionResponse::approved());
        assert!(pending.await.unwrap().is_allow());
    }
}
