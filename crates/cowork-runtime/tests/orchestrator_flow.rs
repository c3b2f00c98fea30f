//! End-to-end flows: a remote peer writes to the task document, the
//! orchestrator dispatches, and an echoing agent answers through the
//! document, including permission prompts answered by the peer.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cowork_core::{
    AgentSessionId, ContentBlock, Message, PermissionResponse, Role, SessionStatus, TaskId,
    TaskStatus,
};
use cowork_doc::{DocumentId, EphemeralChannel, MemoryDocument, MemoryDocumentStore, TaskDocumentHandle};
use cowork_runtime::{
    AgentDriver, AgentEvent, AgentResult, AgentRun, DriverOptions, InputReader, PermissionOutcome,
    RunControl, RuntimeError, TaskOrchestrator, ToolPermissionRequest,
};
use cowork_settings::CoworkSettings;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;

struct StopToken(CancellationToken);

impl RunControl for StopToken {
    fn stop(&self) {
        self.0.cancel();
    }
}

/// Replies `echo: <text>` to every turn. A turn `run <cmd>` first asks
/// permission to run `<cmd>` through Bash.
#[derive(Default)]
struct EchoDriver {
    launches: AtomicUsize,
    resumes: Mutex<Vec<Option<String>>>,
}

#[async_trait]
impl AgentDriver for EchoDriver {
    async fn start(&self, mut input: InputReader, options: DriverOptions) -> Result<AgentRun, RuntimeError> {
        let n = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
        self.resumes
            .lock()
            .push(options.resume.as_ref().map(|r| r.as_str().to_owned()));

        let stopped = CancellationToken::new();
        let done = CancellationToken::new();
        let done_on_drop = done.clone();
        let permissions = Arc::clone(&options.permissions);
        let cancel = options.cancel.clone();

        let events = async_stream::stream! {
            let _done = done_on_drop.drop_guard();
            yield Ok(AgentEvent::Init {
                agent_session_id: AgentSessionId::new(format!("agent-{n}")),
                model: Some("echo".into()),
            });
            while let Some(turn) = input.next().await {
                let text = turn.text();
                let reply = match text.strip_prefix("run ") {
                    Some(command) => {
                        let request = ToolPermissionRequest {
                            tool_name: "Bash".into(),
                            input: json!({"command": command}),
                            tool_use_id: format!("tu-{n}"),
                            blocked_path: None,
                            agent_id: None,
                        };
                        match permissions.can_use_tool(request, cancel.child_token()).await {
                            PermissionOutcome::Allow { .. } => format!("ran {command}"),
                            PermissionOutcome::Deny { message } => format!("refused: {message}"),
                        }
                    }
                    None => format!("echo: {text}"),
                };
                yield Ok(AgentEvent::Assistant {
                    content: vec![json!({"type": "text", "text": reply})],
                    parent_tool_use_id: None,
                });
                yield Ok(AgentEvent::Result(AgentResult::success()));
            }
        }
        .take_until(stopped.clone().cancelled_owned())
        .boxed();

        Ok(AgentRun {
            pid: u32::try_from(4000 + n).ok(),
            events,
            control: Arc::new(StopToken(stopped)),
            exit: async move {
                done.cancelled().await;
                Some(0)
            }
            .boxed(),
        })
    }
}

struct Flow {
    store: Arc<MemoryDocumentStore>,
    driver: Arc<EchoDriver>,
    orch: Arc<TaskOrchestrator>,
    task: TaskId,
    _dir: tempfile::TempDir,
}

impl Flow {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryDocumentStore::new());
        let driver = Arc::new(EchoDriver::default());
        let orch = TaskOrchestrator::new(
            store.clone(),
            driver.clone(),
            CoworkSettings::default(),
            dir.path(),
        );
        let task = TaskId::from("task-e2e");
        orch.watch_task(&task).await.unwrap();
        Self {
            store,
            driver,
            orch,
            task,
            _dir: dir,
        }
    }

    fn doc(&self) -> Arc<MemoryDocument> {
        self.store.open_memory(&DocumentId::task(self.task.clone(), 1))
    }

    fn say(&self, text: &str) {
        self.doc()
            .apply_remote(|d| d.conversation.push(Message::user(vec![ContentBlock::text(text)])))
            .unwrap();
    }

    async fn wait_for(&self, what: &str, check: impl Fn(&MemoryDocument) -> bool) {
        let doc = self.doc();
        for _ in 0..400 {
            if check(&doc) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    async fn wait_status(&self, status: TaskStatus) {
        self.wait_for(&format!("status {status:?}"), |d| {
            d.snapshot().meta.status == status && self.orch.active_session(&self.task).is_none()
        })
        .await;
    }

    fn last_assistant_text(&self) -> Option<String> {
        self.doc()
            .snapshot()
            .conversation
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(Message::text)
    }
}

#[tokio::test]
async fn remote_message_is_answered_through_the_document() {
    let (logs, _guard) = cowork_logging::capture_logs();
    let flow = Flow::new().await;

    flow.say("hello");
    flow.wait_status(TaskStatus::Completed).await;

    assert_eq!(flow.last_assistant_text().as_deref(), Some("echo: hello"));
    let snap = flow.doc().snapshot();
    assert_eq!(snap.sessions.len(), 1);
    assert_eq!(snap.sessions[0].status, SessionStatus::Completed);
    assert_eq!(snap.sessions[0].agent_session_id.as_str(), "agent-1");
    assert!(logs.has_message("dispatching"));
}

#[tokio::test]
async fn approval_from_peer_lets_the_tool_run() {
    let flow = Flow::new().await;
    let doc = flow.doc();
    let mut requests = doc.requests().subscribe();

    flow.say("run cargo test");
    let update = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let update = requests.recv().await.unwrap();
            if update.value.is_some() {
                return update;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(update.key, "tu-1");
    assert_eq!(update.value.unwrap().tool_name, "Bash");
    assert_eq!(doc.snapshot().meta.status, TaskStatus::InputRequired);

    doc.responses().apply_remote_set(&update.key, PermissionResponse::approved());
    flow.wait_status(TaskStatus::Completed).await;

    assert_eq!(flow.last_assistant_text().as_deref(), Some("ran cargo test"));
    assert!(doc.requests().get_all().is_empty());
    assert!(doc.responses().get_all().is_empty());
}

#[tokio::test]
async fn denial_message_reaches_the_agent() {
    let flow = Flow::new().await;
    let doc = flow.doc();

    flow.say("run rm -rf build");
    flow.wait_for("permission request", |d| d.requests().get("tu-1").is_some())
        .await;
    doc.responses()
        .apply_remote_set("tu-1", PermissionResponse::denied("not on main"));
    flow.wait_status(TaskStatus::Completed).await;

    assert_eq!(flow.last_assistant_text().as_deref(), Some("refused: not on main"));
}

#[tokio::test]
async fn next_message_resumes_the_runtime_session() {
    let flow = Flow::new().await;

    flow.say("one");
    flow.wait_status(TaskStatus::Completed).await;
    flow.say("two");
    flow.wait_for("second answer", |d| {
        d.snapshot()
            .conversation
            .iter()
            .any(|m| m.text() == "echo: two")
    })
    .await;
    flow.wait_status(TaskStatus::Completed).await;

    assert_eq!(flow.driver.launches.load(Ordering::SeqCst), 2);
    assert_eq!(
        *flow.driver.resumes.lock(),
        vec![None, Some("agent-1".to_owned())]
    );
    let snap = flow.doc().snapshot();
    assert_eq!(snap.sessions.len(), 2);
    assert!(snap.sessions.iter().all(|s| s.status == SessionStatus::Completed));
}

#[tokio::test]
async fn stop_interrupts_a_session_waiting_for_approval() {
    let flow = Flow::new().await;
    let doc = flow.doc();

    flow.say("run make deploy");
    flow.wait_for("permission request", |d| d.requests().get("tu-1").is_some())
        .await;
    assert!(flow.orch.stop_agent(&flow.task));
    flow.wait_status(TaskStatus::Canceled).await;

    let snap = doc.snapshot();
    assert_eq!(snap.sessions[0].status, SessionStatus::Interrupted);
    flow.wait_for("request cleared", |d| d.requests().get_all().is_empty())
        .await;
    flow.wait_for("process untracked", |_| flow.orch.list_agents().is_empty())
        .await;
}

#[tokio::test]
async fn local_writes_do_not_trigger_dispatch() {
    let flow = Flow::new().await;
    let handle = flow.orch.open_task(&flow.task).await.unwrap();
    handle
        .change(&mut |d| d.conversation.push(Message::user(vec![ContentBlock::text("mine")])))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(flow.driver.launches.load(Ordering::SeqCst), 0);
}
