//! Spawn coordination: at most one live agent subprocess per task.
//!
//! Launches for the same task queue on a per-task FIFO mutex. Whoever holds
//! the lock first stops and deregisters any subprocess already tracked for the
//! task, then launches its own. The lock covers only the launch; it is
//! released on every path, including launch failure.
//!
//! Tracked entries carry a generation number so the exit watcher of a
//! superseded subprocess never removes its successor's entry.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use cowork_core::TaskId;
use cowork_settings::AgentSettings;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::driver::{AgentRun, DriverOptions, EventStream, RunControl};
use crate::errors::RuntimeError;

/// Fully resolved command line for one agent launch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Executable.
    pub executable: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: PathBuf,
    /// Environment variables to strip from the child.
    pub env_remove: Vec<String>,
}

impl LaunchConfig {
    /// Resolve the launch for `options` under `settings`.
    ///
    /// The caller's model wins over the configured default. The working
    /// directory must exist.
    pub fn resolve(settings: &AgentSettings, options: &DriverOptions) -> Result<Self, RuntimeError> {
        ensure_dir(&options.cwd)?;

        let mut args: Vec<String> = [
            "--output-format",
            "stream-json",
            "--input-format",
            "stream-json",
            "--verbose",
            "--permission-prompt-tool",
            "stdio",
        ]
        .iter()
        .map(|s| (*s).to_string())
        .collect();

        if let Some(model) = options.model.as_ref().or(settings.default_model.as_ref()) {
            args.push("--model".into());
            args.push(model.clone());
        }
        let mode = if options.permission_mode.is_empty() {
            &settings.permission_mode
        } else {
            &options.permission_mode
        };
        if !mode.is_empty() && mode != "default" {
            args.push("--permission-mode".into());
            args.push(mode.clone());
        }
        if let Some(resume) = options.resume.as_ref().filter(|r| r.is_assigned()) {
            args.push("--resume".into());
            args.push(resume.to_string());
        }
        args.extend(settings.extra_args.iter().cloned());

        Ok(Self {
            executable: settings.executable.clone(),
            args,
            cwd: options.cwd.clone(),
            // Nested launches refuse to start when this is set.
            env_remove: vec!["CLAUDECODE".into()],
        })
    }
}

fn ensure_dir(path: &Path) -> Result<(), RuntimeError> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(RuntimeError::Validation(format!(
            "working directory does not exist: {}",
            path.display()
        )))
    }
}

/// Identity of a launched subprocess.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessHandle {
    /// Owning task.
    pub task_id: TaskId,
    /// OS pid.
    pub pid: Option<u32>,
    /// Unix milliseconds at launch.
    pub started_at: i64,
    /// Launch generation for the task.
    pub generation: u64,
}

/// A launched subprocess handed back to the session.
pub struct RunningAgent {
    /// Identity.
    pub handle: ProcessHandle,
    /// Event stream.
    pub events: EventStream,
    /// Shutdown control.
    pub control: Arc<dyn RunControl>,
}

/// Entry returned by [`SpawnCoordinator::list`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentProcessInfo {
    /// Owning task.
    pub task_id: TaskId,
    /// OS pid.
    pub pid: Option<u32>,
    /// Milliseconds since launch.
    pub uptime_ms: u64,
}

struct TrackedProcess {
    handle: ProcessHandle,
    launched: Instant,
    control: Arc<dyn RunControl>,
}

/// Serializes launches per task and tracks live subprocesses.
#[derive(Default)]
pub struct SpawnCoordinator {
    locks: DashMap<TaskId, Arc<Mutex<()>>>,
    tracked: Arc<DashMap<TaskId, TrackedProcess>>,
    generation: AtomicU64,
}

impl SpawnCoordinator {
    /// Empty coordinator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the task's spawn lock, waiting behind earlier callers.
    ///
    /// Any subprocess already tracked for the task is stopped and
    /// deregistered before this returns.
    pub async fn acquire(&self, task_id: &TaskId) -> SpawnGuard<'_> {
        let lock = self.locks.entry(task_id.clone()).or_default().value().clone();
        let guard = lock.lock_owned().await;

        if let Some((_, previous)) = self.tracked.remove(task_id) {
            info!(task_id = %task_id, pid = ?previous.handle.pid, "stopping superseded agent");
            previous.control.stop();
        }

        SpawnGuard {
            coordinator: self,
            task_id: task_id.clone(),
            guard: Some(guard),
        }
    }

    /// Launch a subprocess for `task_id` under the task's spawn lock.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub async fn spawn<F>(&self, task_id: &TaskId, launch: F) -> Result<RunningAgent, RuntimeError>
    where
        F: Future<Output = Result<AgentRun, RuntimeError>> + Send,
    {
        let guard = self.acquire(task_id).await;
        let running = match launch.await {
            Ok(run) => Ok(guard.register(run)),
            Err(e) => {
                warn!(error = %e, "agent launch failed");
                Err(e)
            }
        };
        guard.release();
        running
    }

    fn register(&self, task_id: &TaskId, run: AgentRun) -> RunningAgent {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = ProcessHandle {
            task_id: task_id.clone(),
            pid: run.pid,
            started_at: cowork_core::now_ms(),
            generation,
        };
        let _ = self.tracked.insert(
            task_id.clone(),
            TrackedProcess {
                handle: handle.clone(),
                launched: Instant::now(),
                control: Arc::clone(&run.control),
            },
        );
        info!(pid = ?run.pid, generation, "agent registered");

        let tracked = Arc::clone(&self.tracked);
        let exit = run.exit;
        let task = task_id.clone();
        drop(tokio::spawn(async move {
            let code = exit.await;
            let removed = tracked
                .remove_if(&task, |_, p| p.handle.generation == generation)
                .is_some();
            debug!(task_id = %task, generation, ?code, removed, "agent exited");
        }));

        RunningAgent {
            handle,
            events: run.events,
            control: run.control,
        }
    }

    /// Stop and deregister the task's subprocess. `false` when none is tracked.
    pub fn stop(&self, task_id: &TaskId) -> bool {
        match self.tracked.remove(task_id) {
            Some((_, p)) => {
                info!(task_id = %task_id, pid = ?p.handle.pid, "stopping agent");
                p.control.stop();
                true
            }
            None => false,
        }
    }

    /// Whether a subprocess is tracked for the task.
    pub fn is_tracked(&self, task_id: &TaskId) -> bool {
        self.tracked.contains_key(task_id)
    }

    /// Handle of the task's tracked subprocess.
    pub fn handle(&self, task_id: &TaskId) -> Option<ProcessHandle> {
        self.tracked.get(task_id).map(|p| p.handle.clone())
    }

    /// All tracked subprocesses.
    pub fn list(&self) -> Vec<AgentProcessInfo> {
        let mut out: Vec<AgentProcessInfo> = self
            .tracked
            .iter()
            .map(|entry| AgentProcessInfo {
                task_id: entry.key().clone(),
                pid: entry.handle.pid,
                uptime_ms: u64::try_from(entry.launched.elapsed().as_millis()).unwrap_or(u64::MAX),
            })
            .collect();
        out.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        out
    }

    /// Stop every tracked subprocess.
    pub fn stop_all(&self) -> usize {
        let tasks: Vec<TaskId> = self.tracked.iter().map(|e| e.key().clone()).collect();
        tasks.iter().filter(|t| self.stop(t)).count()
    }
}

/// Exclusive launch right for one task. Released on drop.
pub struct SpawnGuard<'a> {
    coordinator: &'a SpawnCoordinator,
    task_id: TaskId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl SpawnGuard<'_> {
    /// Track `run` as the task's live subprocess.
    pub fn register(&self, run: AgentRun) -> RunningAgent {
        self.coordinator.register(&self.task_id, run)
    }

    /// Release the lock to the next waiter.
    pub fn release(self) {}
}

impl Drop for SpawnGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let _ = self
            .coordinator
            .locks
            .remove_if(&self.task_id, |_, m| Arc::strong_count(m) == 1);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{allow_all, fake_run};
    use assert_matches::assert_matches;
    use cowork_core::AgentSessionId;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn options(cwd: &Path) -> DriverOptions {
        DriverOptions {
            cwd: cwd.to_path_buf(),
            model: None,
            permission_mode: String::new(),
            resume: None,
            permissions: allow_all(),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn launch_config_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = LaunchConfig::resolve(&AgentSettings::default(), &options(dir.path())).unwrap();
        assert_eq!(cfg.executable, "claude");
        assert!(cfg.args.windows(2).any(|w| w == ["--input-format", "stream-json"]));
        assert!(!cfg.args.contains(&"--model".to_string()));
        assert!(!cfg.args.contains(&"--permission-mode".to_string()));
        assert_eq!(cfg.env_remove, vec!["CLAUDECODE".to_string()]);
    }

    #[test]
    fn launch_config_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let settings = AgentSettings {
            default_model: Some("settings-model".into()),
            extra_args: vec!["--max-turns".into(), "5".into()],
            ..AgentSettings::default()
        };
        let mut opts = options(dir.path());
        opts.model = Some("caller-model".into());
        opts.permission_mode = "plan".into();
        opts.resume = Some(AgentSessionId::new("agent-7"));
        let cfg = LaunchConfig::resolve(&settings, &opts).unwrap();
        assert!(cfg.args.windows(2).any(|w| w == ["--model", "caller-model"]));
        assert!(cfg.args.windows(2).any(|w| w == ["--permission-mode", "plan"]));
        assert!(cfg.args.windows(2).any(|w| w == ["--resume", "agent-7"]));
        assert!(cfg.args.ends_with(&["--max-turns".to_string(), "5".to_string()]));
    }

    #[test]
    fn launch_config_rejects_missing_cwd() {
        let err = LaunchConfig::resolve(
            &AgentSettings::default(),
            &options(Path::new("/definitely/not/here")),
        )
        .unwrap_err();
        assert_matches!(err, RuntimeError::Validation(_));
    }

    #[tokio::test]
    async fn spawn_tracks_and_exit_deregisters() {
        let coord = SpawnCoordinator::new();
        let task = TaskId::from("t1");
        let (run, ctl) = fake_run(Some(42));
        let running = coord.spawn(&task, async { Ok(run) }).await.unwrap();
        assert_eq!(running.handle.pid, Some(42));
        assert!(coord.is_tracked(&task));
        assert_eq!(coord.list().len(), 1);

        ctl.exit(0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!coord.is_tracked(&task));
    }

    #[tokio::test]
    async fn second_spawn_stops_first_and_keeps_successor() {
        let coord = SpawnCoordinator::new();
        let task = TaskId::from("t1");

        let (run1, ctl1) = fake_run(Some(1));
        let _first = coord.spawn(&task, async { Ok(run1) }).await.unwrap();
        let (run2, ctl2) = fake_run(Some(2));
        let second = coord.spawn(&task, async { Ok(run2) }).await.unwrap();

        assert_eq!(ctl1.stop_count(), 1);
        assert_eq!(ctl2.stop_count(), 0);

        // The superseded process exiting must not remove the successor.
        ctl1.exit(143);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(coord.handle(&task).unwrap().generation, second.handle.generation);
    }

    #[tokio::test]
    async fn launch_failure_releases_lock() {
        let coord = SpawnCoordinator::new();
        let task = TaskId::from("t1");
        let err = coord
            .spawn(&task, async { Err(RuntimeError::Launch("enoent".into())) })
            .await
            .err()
            .unwrap();
        assert_matches!(err, RuntimeError::Launch(_));

        let (run, _ctl) = fake_run(Some(3));
        let ok = tokio::time::timeout(Duration::from_secs(1), coord.spawn(&task, async { Ok(run) }))
            .await
            .expect("lock must be free after a failed launch");
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn concurrent_spawns_leave_one_tracked() {
        let coord = Arc::new(SpawnCoordinator::new());
        let task = TaskId::from("busy");
        let mut controls = Vec::new();
        let mut joins = Vec::new();
        for pid in 0..8u32 {
            let (run, ctl) = fake_run(Some(pid));
            controls.push(ctl);
            let coord = Arc::clone(&coord);
            let task = task.clone();
            joins.push(tokio::spawn(async move {
                coord
                    .spawn(&task, async move {
                        tokio::task::yield_now().await;
                        Ok(run)
                    })
                    .await
                    .map(|r| r.handle.pid)
            }));
        }
        for j in joins {
            let _ = j.await.unwrap().unwrap();
        }
        assert_eq!(coord.list().len(), 1);
        let stopped = controls.iter().filter(|c| c.stop_count() > 0).count();
        assert_eq!(stopped, 7);
    }

    #[tokio::test]
    async fn stop_reports_whether_tracked() {
        let coord = SpawnCoordinator::new();
        let task = TaskId::from("t1");
        assert!(!coord.stop(&task));
        let (run, ctl) = fake_run(None);
        let _r = coord.spawn(&task, async { Ok(run) }).await.unwrap();
        assert!(coord.stop(&task));
        assert_eq!(ctl.stop_count(), 1);
        assert!(!coord.is_tracked(&task));
    }

    #[tokio::test]
    async fn different_tasks_do_not_interfere() {
        let coord = SpawnCoordinator::new();
        let (a, ca) = fake_run(Some(1));
        let (b, cb) = fake_run(Some(2));
        let _ = coord.spawn(&TaskId::from("a"), async { Ok(a) }).await.unwrap();
        let _ = coord.spawn(&TaskId::from("b"), async { Ok(b) }).await.unwrap();
        assert_eq!(coord.list().len(), 2);
        assert_eq!(ca.stop_count() + cb.stop_count(), 0);
        assert_eq!(coord.stop_all(), 2);
    }

    #[tokio::test]
    async fn acquire_queues_second_caller_until_release() {
        let coord = Arc::new(SpawnCoordinator::new());
        let task = TaskId::from("t1");
        let first = coord.acquire(&task).await;

        let waiter = {
            let coord = Arc::clone(&coord);
            let task = task.clone();
            tokio::spawn(async move {
                let _guard = coord.acquire(&task).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        first.release();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter must acquire after release")
            .unwrap();
        assert!(coord.locks.is_empty());
    }
}
