//! Process manager — process-wide owner of all tracked subprocesses.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ChorusHome;
use crate::error::Error;
use crate::process::monitor::run_monitor;
use crate::process::{ProcessCallback, ProcessStatus, SpawnKind, TrackedProcess};
use crate::store::Store;
use crate::tool::bash::sanitized_env;

const DEFAULT_SIGTERM_GRACE: Duration = Duration::from_secs(5);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Hook-evaluation sink wired in by the dispatcher.
pub trait ProcessEvents: Send + Sync {
    fn on_line<'a>(
        &'a self,
        pid: u32,
        stream: &'a str,
        line: &'a str,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

    fn on_exit<'a>(
        &'a self,
        pid: u32,
        exit_code: Option<i32>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

    /// Called synchronously right after a spawn (starts timeout watchers).
    fn on_spawn(&self, pid: u32);
}

/// Outcome of startup recovery.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Rows whose pid is still alive but unobservable; marked LOST.
    pub lost: usize,
    /// Rows whose pid died while the host was down; marked EXITED and
    /// their ON_EXIT callbacks fired.
    pub exited: usize,
}

/// Central manager for tracked subprocess lifecycle. One per process, with
/// explicit construction and [`shutdown`](Self::shutdown).
pub struct ProcessManager {
    home: ChorusHome,
    store: Option<Arc<Store>>,
    processes: Mutex<HashMap<u32, Arc<TrackedProcess>>>,
    monitors: Mutex<HashMap<u32, JoinHandle<()>>>,
    events: RwLock<Option<Arc<dyn ProcessEvents>>>,
}

impl ProcessManager {
    pub fn new(home: ChorusHome, store: Option<Arc<Store>>) -> Arc<Self> {
        Arc::new(Self {
            home,
            store,
            processes: Mutex::new(HashMap::new()),
            monitors: Mutex::new(HashMap::new()),
            events: RwLock::new(None),
        })
    }

    /// Wire the hook dispatcher in. Processes spawned with callbacks before
    /// this is called would never fire them, so wiring happens at startup.
    pub fn set_events(&self, events: Arc<dyn ProcessEvents>) {
        *self.events.write().expect("events lock") = Some(events);
    }

    fn events(&self) -> Option<Arc<dyn ProcessEvents>> {
        self.events.read().expect("events lock").clone()
    }

    /// Spawn a subprocess and begin monitoring it.
    #[allow(clippy::too_many_arguments)]
    pub async fn spawn(
        self: &Arc<Self>,
        command: &str,
        workspace: &Path,
        agent: &str,
        spawn_kind: SpawnKind,
        callbacks: Vec<ProcessCallback>,
        context: &str,
        parent_branch: Option<u64>,
        recursion_depth: usize,
    ) -> Result<Arc<TrackedProcess>, Error> {
        let env = sanitized_env(workspace, None);

        // Force line-buffered stdout where stdbuf exists; otherwise most
        // programs buffer ~4-8KB on pipes and output-match hooks only see
        // lines at exit.
        let wrapped = match find_in_path("stdbuf") {
            Some(_) => format!("stdbuf -oL {command}"),
            None => command.to_string(),
        };

        let child = tokio::process::Command::new("bash")
            .arg("-c")
            .arg(&wrapped)
            .current_dir(workspace)
            .env_clear()
            .envs(&env)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .stdin(std::process::Stdio::null())
            .spawn()
            .map_err(|e| Error::Agent(format!("failed to spawn process: {e}")))?;

        let pid = child
            .id()
            .ok_or_else(|| Error::Agent("failed to get PID from subprocess".into()))?;

        let log_dir = self.home.process_log_dir(agent, pid);
        let tracked = Arc::new(TrackedProcess::new(
            pid,
            command,
            workspace.to_path_buf(),
            agent,
            spawn_kind,
            log_dir.join("stdout.log"),
            log_dir.join("stderr.log"),
            callbacks,
            context,
            parent_branch,
            recursion_depth,
        ));

        if !tracked.callbacks_snapshot().is_empty() && self.events().is_none() {
            warn!(
                pid,
                "process spawned with callbacks but no hook dispatcher wired — hooks will not fire"
            );
        }

        // Register before the monitor starts so on_line/on_exit can find it.
        self.processes
            .lock()
            .expect("processes lock")
            .insert(pid, tracked.clone());

        let monitor = tokio::spawn(run_monitor(child, tracked.clone(), self.clone()));
        self.monitors
            .lock()
            .expect("monitors lock")
            .insert(pid, monitor);

        if let Some(store) = &self.store
            && let Err(e) = store.insert_process(&tracked).await
        {
            warn!(pid, error = %e, "failed to persist process row");
        }

        info!(
            pid,
            agent,
            kind = spawn_kind.as_str(),
            command,
            callbacks = tracked.callbacks_snapshot().len(),
            "spawned process"
        );

        if let Some(events) = self.events() {
            events.on_spawn(pid);
        }

        Ok(tracked)
    }

    /// Kill a tracked process: SIGTERM, grace period, SIGKILL.
    ///
    /// Returns `false` if the pid is unknown or already finished.
    pub async fn kill(&self, pid: u32) -> Result<bool, Error> {
        self.kill_with_grace(pid, DEFAULT_SIGTERM_GRACE).await
    }

    pub async fn kill_with_grace(&self, pid: u32, grace: Duration) -> Result<bool, Error> {
        let tracked = {
            let processes = self.processes.lock().expect("processes lock");
            processes.get(&pid).cloned()
        };
        let Some(tracked) = tracked else {
            return Ok(false);
        };
        if !tracked.is_running() {
            return Ok(false);
        }

        // Mark first so the monitor's exit observation keeps KILLED.
        tracked.mark_killed(None);

        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if tracked.exit_code().is_some() || !pid_alive(pid) {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                unsafe {
                    libc::kill(pid as i32, libc::SIGKILL);
                }
                break;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }

        if let Some(store) = &self.store
            && let Err(e) = store
                .update_process_status(pid, ProcessStatus::Killed, tracked.exit_code())
                .await
        {
            warn!(pid, error = %e, "failed to persist kill status");
        }

        info!(pid, "killed process");
        Ok(true)
    }

    pub fn list(&self, agent: Option<&str>) -> Vec<Arc<TrackedProcess>> {
        let processes = self.processes.lock().expect("processes lock");
        let mut list: Vec<_> = processes
            .values()
            .filter(|p| agent.is_none_or(|a| p.agent == a))
            .cloned()
            .collect();
        list.sort_by_key(|p| p.started_at);
        list
    }

    pub fn list_running(&self, agent: Option<&str>) -> Vec<Arc<TrackedProcess>> {
        self.list(agent)
            .into_iter()
            .filter(|p| p.is_running())
            .collect()
    }

    pub fn get(&self, pid: u32) -> Option<Arc<TrackedProcess>> {
        self.processes.lock().expect("processes lock").get(&pid).cloned()
    }

    /// Attach additional callbacks to a still-running process.
    pub async fn add_callbacks(
        &self,
        pid: u32,
        callbacks: Vec<ProcessCallback>,
    ) -> Option<Arc<TrackedProcess>> {
        let tracked = self.get(pid)?;
        if !tracked.is_running() {
            return None;
        }
        tracked.add_callbacks(callbacks);
        if let Some(store) = &self.store
            && let Err(e) = store
                .update_process_callbacks(pid, &tracked.callbacks_snapshot())
                .await
        {
            warn!(pid, error = %e, "failed to persist callbacks");
        }
        Some(tracked)
    }

    /// Reconcile persisted RUNNING rows with reality after a restart.
    ///
    /// A pid still alive is unobservable (the pipe fds died with the old
    /// host process) and is marked LOST. A dead pid is marked EXITED and
    /// its ON_EXIT callbacks fire now, so "notify me when it finishes"
    /// survives a restart.
    pub async fn recover_on_startup(self: &Arc<Self>) -> Result<RecoveryReport, Error> {
        let Some(store) = &self.store else {
            return Ok(RecoveryReport::default());
        };

        let mut report = RecoveryReport::default();
        for row in store.list_processes_with_status(ProcessStatus::Running).await? {
            let tracked = Arc::new(row.into_tracked());
            let pid = tracked.pid;
            self.processes
                .lock()
                .expect("processes lock")
                .insert(pid, tracked.clone());

            if pid_alive(pid) {
                tracked.mark_lost();
                store
                    .update_process_status(pid, ProcessStatus::Lost, None)
                    .await?;
                report.lost += 1;
            } else {
                tracked.mark_exited(None);
                store
                    .update_process_status(pid, ProcessStatus::Exited, None)
                    .await?;
                report.exited += 1;
                if let Some(events) = self.events() {
                    events.on_exit(pid, None).await;
                }
            }
        }

        if report.lost + report.exited > 0 {
            info!(lost = report.lost, exited = report.exited, "process recovery complete");
        }
        Ok(report)
    }

    /// Drain: abort all monitor tasks. Child processes are left running —
    /// they are persisted and recovered (or declared LOST) on next startup.
    pub async fn shutdown(&self) {
        let monitors: Vec<_> = self
            .monitors
            .lock()
            .expect("monitors lock")
            .drain()
            .collect();
        for (_pid, handle) in monitors {
            handle.abort();
        }
    }

    // -- monitor plumbing ---------------------------------------------------

    pub(crate) async fn dispatch_line(&self, pid: u32, stream: &str, line: &str) {
        if let Some(events) = self.events() {
            events.on_line(pid, stream, line).await;
        }
    }

    pub(crate) async fn finalize_exit(&self, pid: u32, exit_code: Option<i32>) {
        let Some(tracked) = self.get(pid) else { return };
        tracked.mark_exited(exit_code);

        if let Some(store) = &self.store
            && let Err(e) = store
                .update_process_status(pid, tracked.status(), exit_code)
                .await
        {
            warn!(pid, error = %e, "failed to persist exit status");
        }

        self.monitors.lock().expect("monitors lock").remove(&pid);

        if let Some(events) = self.events() {
            events.on_exit(pid, exit_code).await;
        }

        info!(pid, exit_code, "process exited");
    }
}

pub(crate) fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{ExitFilter, HookAction, HookTrigger};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager() -> (tempfile::TempDir, Arc<ProcessManager>) {
        let dir = tempfile::tempdir().unwrap();
        let home = ChorusHome::new(dir.path());
        home.ensure().unwrap();
        let pm = ProcessManager::new(home, None);
        (dir, pm)
    }

    struct CountingEvents {
        lines: AtomicUsize,
        exits: AtomicUsize,
        spawns: AtomicUsize,
    }

    impl CountingEvents {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                lines: AtomicUsize::new(0),
                exits: AtomicUsize::new(0),
                spawns: AtomicUsize::new(0),
            })
        }
    }

    impl ProcessEvents for CountingEvents {
        fn on_line<'a>(
            &'a self,
            _pid: u32,
            _stream: &'a str,
            _line: &'a str,
        ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
            self.lines.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }

        fn on_exit<'a>(
            &'a self,
            _pid: u32,
            _exit_code: Option<i32>,
        ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
            self.exits.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }

        fn on_spawn(&self, _pid: u32) {
            self.spawns.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn wait_for_exit(tracked: &TrackedProcess) {
        for _ in 0..100 {
            if !tracked.is_running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("process did not exit in time");
    }

    #[tokio::test]
    async fn spawn_captures_output_and_exit() {
        let (dir, pm) = manager();
        let tracked = pm
            .spawn(
                "echo one; echo two",
                dir.path(),
                "alpha",
                SpawnKind::Concurrent,
                vec![],
                "",
                Some(1),
                0,
            )
            .await
            .unwrap();

        wait_for_exit(&tracked).await;
        assert_eq!(tracked.status(), ProcessStatus::Exited);
        assert_eq!(tracked.exit_code(), Some(0));
        assert_eq!(tracked.tail(10), vec!["one", "two"]);

        let log = std::fs::read_to_string(&tracked.stdout_log).unwrap();
        assert_eq!(log, "one\ntwo\n");
    }

    #[tokio::test]
    async fn stderr_lines_are_prefixed_in_tail() {
        let (dir, pm) = manager();
        let tracked = pm
            .spawn(
                "echo boom >&2",
                dir.path(),
                "alpha",
                SpawnKind::Concurrent,
                vec![],
                "",
                None,
                0,
            )
            .await
            .unwrap();
        wait_for_exit(&tracked).await;
        assert_eq!(tracked.tail(10), vec!["err: boom"]);
        let log = std::fs::read_to_string(&tracked.stderr_log).unwrap();
        assert_eq!(log, "boom\n");
    }

    #[tokio::test]
    async fn events_fire_for_lines_and_exit() {
        let (dir, pm) = manager();
        let events = CountingEvents::new();
        pm.set_events(events.clone());

        let tracked = pm
            .spawn(
                "echo a; echo b; exit 3",
                dir.path(),
                "alpha",
                SpawnKind::Background,
                vec![ProcessCallback::new(
                    HookTrigger::on_exit(ExitFilter::Failure),
                    HookAction::NotifyChannel,
                )],
                "",
                None,
                0,
            )
            .await
            .unwrap();

        wait_for_exit(&tracked).await;
        // Let the finalize path run
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(events.spawns.load(Ordering::SeqCst), 1);
        assert_eq!(events.lines.load(Ordering::SeqCst), 2);
        assert_eq!(events.exits.load(Ordering::SeqCst), 1);
        assert_eq!(tracked.exit_code(), Some(3));
    }

    #[tokio::test]
    async fn kill_terminates_and_marks_killed() {
        let (dir, pm) = manager();
        let tracked = pm
            .spawn(
                "sleep 30",
                dir.path(),
                "alpha",
                SpawnKind::Concurrent,
                vec![],
                "",
                None,
                0,
            )
            .await
            .unwrap();

        let killed = pm
            .kill_with_grace(tracked.pid, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(killed);
        wait_for_exit(&tracked).await;
        assert_eq!(tracked.status(), ProcessStatus::Killed);
        assert!(!pid_alive(tracked.pid) || tracked.exit_code().is_some());
    }

    #[tokio::test]
    async fn kill_unknown_pid_is_false() {
        let (_dir, pm) = manager();
        assert!(!pm.kill(999_999).await.unwrap());
    }

    #[tokio::test]
    async fn list_filters_by_agent() {
        let (dir, pm) = manager();
        pm.spawn("sleep 5", dir.path(), "alpha", SpawnKind::Concurrent, vec![], "", None, 0)
            .await
            .unwrap();
        pm.spawn("sleep 5", dir.path(), "beta", SpawnKind::Concurrent, vec![], "", None, 0)
            .await
            .unwrap();

        assert_eq!(pm.list(None).len(), 2);
        assert_eq!(pm.list(Some("alpha")).len(), 1);
        assert_eq!(pm.list_running(Some("beta")).len(), 1);

        pm.shutdown().await;
        for p in pm.list(None) {
            let _ = pm.kill_with_grace(p.pid, Duration::from_millis(100)).await;
        }
    }

    #[tokio::test]
    async fn add_callbacks_only_while_running() {
        let (dir, pm) = manager();
        let tracked = pm
            .spawn("sleep 5", dir.path(), "alpha", SpawnKind::Concurrent, vec![], "", None, 0)
            .await
            .unwrap();

        let cb = ProcessCallback::new(HookTrigger::on_exit(ExitFilter::Any), HookAction::NotifyChannel);
        assert!(pm.add_callbacks(tracked.pid, vec![cb.clone()]).await.is_some());
        assert_eq!(tracked.callbacks_snapshot().len(), 1);

        pm.kill_with_grace(tracked.pid, Duration::from_millis(200)).await.unwrap();
        wait_for_exit(&tracked).await;
        assert!(pm.add_callbacks(tracked.pid, vec![cb]).await.is_none());
    }

    #[test]
    fn pid_probe_detects_self() {
        assert!(pid_alive(std::process::id()));
    }
}
