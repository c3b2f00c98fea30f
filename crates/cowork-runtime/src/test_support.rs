//! Scripted drivers and controls shared by unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::driver::{
    AgentDriver, AgentEvent, AgentResult, AgentRun, DriverOptions, PermissionCallback,
    PermissionOutcome, RunControl, ToolPermissionRequest,
};
use crate::errors::RuntimeError;
use crate::input::InputReader;

/// Counts stops; stopping kills the fake process.
pub(crate) struct FakeControl {
    stops: AtomicUsize,
    killed: CancellationToken,
    exit_tx: Mutex<Option<oneshot::Sender<Option<i32>>>>,
}

impl FakeControl {
    pub(crate) fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub(crate) fn exit(&self, code: i32) {
        if let Some(tx) = self.exit_tx.lock().take() {
            let _ = tx.send(Some(code));
        }
    }

    pub(crate) fn killed(&self) -> CancellationToken {
        self.killed.clone()
    }
}

impl RunControl for FakeControl {
    fn stop(&self) {
        let _ = self.stops.fetch_add(1, Ordering::SeqCst);
        self.killed.cancel();
        self.exit(-9);
    }
}

fn fake_control() -> (Arc<FakeControl>, oneshot::Receiver<Option<i32>>) {
    let (tx, rx) = oneshot::channel();
    let ctl = Arc::new(FakeControl {
        stops: AtomicUsize::new(0),
        killed: CancellationToken::new(),
        exit_tx: Mutex::new(Some(tx)),
    });
    (ctl, rx)
}

/// A run with no events whose exit is driven by the returned control.
pub(crate) fn fake_run(pid: Option<u32>) -> (AgentRun, Arc<FakeControl>) {
    let (ctl, exit_rx) = fake_control();
    let run = AgentRun {
        pid,
        events: futures::stream::pending().boxed(),
        control: ctl.clone(),
        exit: async move { exit_rx.await.ok().flatten() }.boxed(),
    };
    (run, ctl)
}

/// Permission callback that always allows.
pub(crate) struct AllowAll;

#[async_trait]
impl PermissionCallback for AllowAll {
    async fn can_use_tool(
        &self,
        request: ToolPermissionRequest,
        _cancel: CancellationToken,
    ) -> PermissionOutcome {
        PermissionOutcome::Allow {
            updated_input: request.input,
        }
    }
}

pub(crate) fn allow_all() -> Arc<dyn PermissionCallback> {
    Arc::new(AllowAll)
}

/// One invocation started through [`ScriptedDriver`].
pub(crate) struct ScriptedRun {
    pub(crate) input: InputReader,
    pub(crate) options: DriverOptions,
    pub(crate) control: Arc<FakeControl>,
    events: mpsc::UnboundedSender<Result<AgentEvent, RuntimeError>>,
}

impl ScriptedRun {
    pub(crate) fn emit(&self, event: AgentEvent) {
        let _ = self.events.send(Ok(event));
    }

    pub(crate) fn fail(&self, message: &str) {
        let _ = self.events.send(Err(RuntimeError::Agent(message.to_owned())));
    }

    pub(crate) fn init(&self, agent_session_id: &str) {
        self.emit(AgentEvent::Init {
            agent_session_id: agent_session_id.into(),
            model: None,
        });
    }

    pub(crate) fn assistant(&self, content: Vec<Value>) {
        self.emit(AgentEvent::Assistant {
            content,
            parent_tool_use_id: None,
        });
    }

    pub(crate) fn succeed(&self) {
        self.emit(AgentEvent::Result(AgentResult::success()));
    }

    /// Close the event stream without a result, as if the process died.
    pub(crate) fn hang_up(self) {
        drop(self.events);
    }
}

/// Driver that hands each started run to the test.
pub(crate) struct ScriptedDriver {
    runs_tx: mpsc::UnboundedSender<ScriptedRun>,
    runs_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ScriptedRun>>,
    fail_next: AtomicBool,
    started: AtomicUsize,
}

impl ScriptedDriver {
    pub(crate) fn new() -> Arc<Self> {
        let (runs_tx, runs_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            runs_tx,
            runs_rx: tokio::sync::Mutex::new(runs_rx),
            fail_next: AtomicBool::new(false),
            started: AtomicUsize::new(0),
        })
    }

    pub(crate) fn fail_next_launch(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub(crate) fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) async fn next_run(&self) -> ScriptedRun {
        self.runs_rx
            .lock()
            .await
            .recv()
            .await
            .expect("driver dropped")
    }
}

#[async_trait]
impl AgentDriver for ScriptedDriver {
    async fn start(&self, input: InputReader, options: DriverOptions) -> Result<AgentRun, RuntimeError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(RuntimeError::Launch("scripted launch failure".into()));
        }
        let _ = self.started.fetch_add(1, Ordering::SeqCst);
        let (ctl, exit_rx) = fake_control();
        let (tx, rx) = mpsc::unbounded_channel();
        let events = UnboundedReceiverStream::new(rx)
            .take_until(ctl.killed().cancelled_owned())
            .boxed();
        let pid = u32::try_from(self.started()).ok();
        let _ = self.runs_tx.send(ScriptedRun {
            input,
            options,
            control: ctl.clone(),
            events: tx,
        });
        Ok(AgentRun {
            pid,
            events,
            control: ctl,
            exit: async move { exit_rx.await.ok().flatten() }.boxed(),
        })
    }
}
