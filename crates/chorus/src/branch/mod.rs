//! Execution branches — per-agent concurrent tool-loop tasks with reply
//! routing, injection queues, per-file write locks, and step metrics.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::store::Store;

/// Injected user messages kept per branch; oldest dropped beyond this.
const INJECT_QUEUE_CAP: usize = 32;

/// Default wait for a per-file write lock.
pub const FILE_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Seed summaries are the first ~50 characters of the seeding message.
const SUMMARY_LEN: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    Running,
    WaitingForPermission,
    Idle,
    Completed,
    Cancelled,
    Errored,
}

impl BranchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BranchStatus::Running => "running",
            BranchStatus::WaitingForPermission => "waiting_for_permission",
            BranchStatus::Idle => "idle",
            BranchStatus::Completed => "completed",
            BranchStatus::Cancelled => "cancelled",
            BranchStatus::Errored => "errored",
        }
    }

    /// A terminal branch can be resumed by a reply but runs no task.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BranchStatus::Idle | BranchStatus::Completed | BranchStatus::Cancelled | BranchStatus::Errored
        )
    }
}

/// A single step in a branch's execution history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchStep {
    pub step_number: u32,
    pub description: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

/// Timing and step tracking for a branch.
#[derive(Debug, Clone)]
pub struct BranchMetrics {
    pub created_at: DateTime<Utc>,
    pub step_number: u32,
    pub current_step: String,
    pub history: Vec<BranchStep>,
}

impl BranchMetrics {
    fn new() -> Self {
        Self {
            created_at: Utc::now(),
            step_number: 0,
            current_step: "Starting".into(),
            history: Vec::new(),
        }
    }

    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.created_at).num_milliseconds()
    }

    /// End the current step (if open) and start a new one. Returns the
    /// completed step, if any, for persistence.
    fn begin_step(&mut self, description: &str) -> Option<BranchStep> {
        let completed = self.close_open_step();
        self.step_number += 1;
        self.current_step = description.to_string();
        self.history.push(BranchStep {
            step_number: self.step_number,
            description: description.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
        });
        completed
    }

    fn close_open_step(&mut self) -> Option<BranchStep> {
        let last = self.history.last_mut()?;
        if last.ended_at.is_some() {
            return None;
        }
        let now = Utc::now();
        last.ended_at = Some(now);
        last.duration_ms = Some((now - last.started_at).num_milliseconds());
        Some(last.clone())
    }
}

/// A single execution branch within an agent.
pub struct ExecutionBranch {
    pub id: u64,
    pub agent: String,
    pub summary: String,
    pub parent_branch: Option<u64>,
    pub recursion_depth: usize,
    status: Mutex<BranchStatus>,
    metrics: Mutex<BranchMetrics>,
    inject_queue: Mutex<VecDeque<String>>,
    outbound_ids: Mutex<Vec<u64>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    completed_at: Mutex<Option<DateTime<Utc>>>,
}

impl ExecutionBranch {
    pub fn status(&self) -> BranchStatus {
        *self.status.lock().expect("branch status lock")
    }

    pub fn set_status(&self, status: BranchStatus) {
        *self.status.lock().expect("branch status lock") = status;
        if status.is_terminal() {
            *self.completed_at.lock().expect("completed_at lock") = Some(Utc::now());
        }
    }

    pub fn metrics(&self) -> BranchMetrics {
        self.metrics.lock().expect("branch metrics lock").clone()
    }

    pub fn outbound_ids(&self) -> Vec<u64> {
        self.outbound_ids.lock().expect("outbound ids lock").clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn completed_at(&self) -> Option<DateTime<Utc>> {
        *self.completed_at.lock().expect("completed_at lock")
    }
}

fn summarize_seed(seed: &str) -> String {
    let trimmed = seed.trim();
    let mut cut = SUMMARY_LEN.min(trimmed.len());
    while cut < trimmed.len() && !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut summary = trimmed[..cut].trim_end().to_string();
    if cut < trimmed.len() {
        summary.push_str("...");
    }
    summary
}

/// Per-agent owner of execution branches, the reply-routing index, and the
/// per-file write-lock table.
pub struct BranchManager {
    pub agent: String,
    store: Option<Arc<Store>>,
    branches: Mutex<HashMap<u64, Arc<ExecutionBranch>>>,
    outbound_index: Mutex<HashMap<u64, u64>>,
    next_id: AtomicU64,
    /// Canonical path → lock. Entries are created lazily and never removed
    /// (bounded by distinct paths touched), which avoids acquire/release
    /// races on map membership.
    file_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
    held_guards: Mutex<HashMap<(u64, PathBuf), OwnedMutexGuard<()>>>,
}

impl BranchManager {
    pub fn new(agent: impl Into<String>, store: Option<Arc<Store>>) -> Arc<Self> {
        Arc::new(Self {
            agent: agent.into(),
            store,
            branches: Mutex::new(HashMap::new()),
            outbound_index: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            file_locks: Mutex::new(HashMap::new()),
            held_guards: Mutex::new(HashMap::new()),
        })
    }

    /// Seed the id counter from persisted state (called once at startup so
    /// branch ids stay unique across restarts).
    pub fn seed_next_id(&self, next: u64) {
        self.next_id.fetch_max(next, Ordering::SeqCst);
    }

    /// Create a new branch seeded by a user message.
    pub fn create_branch(
        &self,
        seed: &str,
        parent_branch: Option<u64>,
        recursion_depth: usize,
    ) -> Arc<ExecutionBranch> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let branch = Arc::new(ExecutionBranch {
            id,
            agent: self.agent.clone(),
            summary: summarize_seed(seed),
            parent_branch,
            recursion_depth,
            status: Mutex::new(BranchStatus::Idle),
            metrics: Mutex::new(BranchMetrics::new()),
            inject_queue: Mutex::new(VecDeque::new()),
            outbound_ids: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            completed_at: Mutex::new(None),
        });
        self.branches
            .lock()
            .expect("branches lock")
            .insert(id, branch.clone());
        info!(agent = %self.agent, branch = id, "created branch");

        if let Some(store) = self.store.clone() {
            let b = branch.clone();
            let agent = self.agent.clone();
            tokio::spawn(async move {
                if let Err(e) = store.insert_branch(&agent, &b).await {
                    warn!(branch = b.id, error = %e, "failed to persist branch");
                }
            });
        }
        branch
    }

    /// Start (or resume) a branch's loop task. At most one task per branch:
    /// a still-running task makes this a no-op.
    pub fn start(
        self: &Arc<Self>,
        branch: &Arc<ExecutionBranch>,
        fut: impl Future<Output = ()> + Send + 'static,
    ) {
        let mut task = branch.task.lock().expect("branch task lock");
        if let Some(handle) = task.as_ref()
            && !handle.is_finished()
        {
            warn!(branch = branch.id, "branch already has a running task");
            return;
        }

        branch.set_status(BranchStatus::Running);
        self.persist_status(branch);

        let manager = self.clone();
        let b = branch.clone();
        let cancel = branch.cancel.clone();
        *task = Some(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    manager.begin_step(b.id, "cancelled");
                    manager.finalize_steps(b.id);
                    b.set_status(BranchStatus::Cancelled);
                    manager.persist_status(&b);
                }
                _ = fut => {}
            }
            manager.release_all_locks(b.id);
        }));
    }

    /// Look up the branch that produced a given outbound message.
    pub fn route(&self, outbound_message_id: u64) -> Option<Arc<ExecutionBranch>> {
        let branch_id = *self
            .outbound_index
            .lock()
            .expect("outbound index lock")
            .get(&outbound_message_id)?;
        self.get(branch_id)
    }

    /// Map an outbound message id to a branch for reply routing.
    pub fn register_outbound(&self, branch_id: u64, message_id: u64) {
        self.outbound_index
            .lock()
            .expect("outbound index lock")
            .insert(message_id, branch_id);
        if let Some(branch) = self.get(branch_id) {
            branch
                .outbound_ids
                .lock()
                .expect("outbound ids lock")
                .push(message_id);
        }
    }

    pub fn get(&self, branch_id: u64) -> Option<Arc<ExecutionBranch>> {
        self.branches
            .lock()
            .expect("branches lock")
            .get(&branch_id)
            .cloned()
    }

    pub fn list_all(&self) -> Vec<Arc<ExecutionBranch>> {
        let mut list: Vec<_> = self
            .branches
            .lock()
            .expect("branches lock")
            .values()
            .cloned()
            .collect();
        list.sort_by_key(|b| b.id);
        list
    }

    pub fn list_active(&self) -> Vec<Arc<ExecutionBranch>> {
        self.list_all()
            .into_iter()
            .filter(|b| !b.status().is_terminal())
            .collect()
    }

    /// Push a user message into a branch's injection queue (drop-oldest —
    /// the latest reply wins).
    pub fn inject(&self, branch_id: u64, message: String) -> bool {
        let Some(branch) = self.get(branch_id) else {
            return false;
        };
        let mut queue = branch.inject_queue.lock().expect("inject queue lock");
        if queue.len() == INJECT_QUEUE_CAP {
            queue.pop_front();
        }
        queue.push_back(message);
        true
    }

    /// Drain all queued injections for a branch, oldest first.
    pub fn drain_injections(&self, branch_id: u64) -> Vec<String> {
        let Some(branch) = self.get(branch_id) else {
            return Vec::new();
        };
        let mut queue = branch.inject_queue.lock().expect("inject queue lock");
        queue.drain(..).collect()
    }

    /// Record a new metrics step; the completed previous step is persisted
    /// in the background.
    pub fn begin_step(&self, branch_id: u64, description: &str) {
        let Some(branch) = self.get(branch_id) else { return };
        let completed = branch
            .metrics
            .lock()
            .expect("branch metrics lock")
            .begin_step(description);
        self.persist_step(branch_id, completed);
    }

    /// Close the open step at loop end.
    pub fn finalize_steps(&self, branch_id: u64) {
        let Some(branch) = self.get(branch_id) else { return };
        let completed = branch
            .metrics
            .lock()
            .expect("branch metrics lock")
            .close_open_step();
        self.persist_step(branch_id, completed);
    }

    fn persist_step(&self, branch_id: u64, step: Option<BranchStep>) {
        let (Some(store), Some(step)) = (self.store.clone(), step) else {
            return;
        };
        let agent = self.agent.clone();
        tokio::spawn(async move {
            if let Err(e) = store.insert_branch_step(&agent, branch_id, &step).await {
                warn!(branch = branch_id, error = %e, "failed to persist branch step");
            }
        });
    }

    pub fn persist_status(&self, branch: &Arc<ExecutionBranch>) {
        let Some(store) = self.store.clone() else { return };
        let agent = self.agent.clone();
        let id = branch.id;
        let status = branch.status();
        tokio::spawn(async move {
            if let Err(e) = store.update_branch_status(&agent, id, status).await {
                warn!(branch = id, error = %e, "failed to persist branch status");
            }
        });
    }

    // -- File locks ---------------------------------------------------------

    /// Acquire the write lock for a canonical path on behalf of a branch.
    /// Returns `false` on timeout. Re-acquiring a lock the branch already
    /// holds succeeds immediately.
    pub async fn acquire_file_lock(
        &self,
        branch_id: u64,
        path: &Path,
        timeout: Option<Duration>,
    ) -> bool {
        let key = (branch_id, path.to_path_buf());
        {
            let held = self.held_guards.lock().expect("held guards lock");
            if held.contains_key(&key) {
                return true;
            }
        }

        let lock = {
            let mut locks = self.file_locks.lock().expect("file locks lock");
            locks
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        let timeout = timeout.unwrap_or(FILE_LOCK_TIMEOUT);
        match tokio::time::timeout(timeout, lock.lock_owned()).await {
            Ok(guard) => {
                self.held_guards
                    .lock()
                    .expect("held guards lock")
                    .insert(key, guard);
                true
            }
            Err(_) => false,
        }
    }

    /// Release a file lock held by a branch. Safe to call when not held.
    pub fn release_file_lock(&self, branch_id: u64, path: &Path) {
        self.held_guards
            .lock()
            .expect("held guards lock")
            .remove(&(branch_id, path.to_path_buf()));
    }

    /// Release every lock a branch holds (kill/cancel/terminal safety net).
    pub fn release_all_locks(&self, branch_id: u64) {
        self.held_guards
            .lock()
            .expect("held guards lock")
            .retain(|(owner, _), _| *owner != branch_id);
    }

    pub fn is_file_locked(&self, path: &Path) -> bool {
        let locks = self.file_locks.lock().expect("file locks lock");
        locks
            .get(path)
            .is_some_and(|lock| lock.try_lock().is_err())
    }

    // -- Kill ---------------------------------------------------------------

    /// Cancel a branch's loop task cooperatively, release its locks, and
    /// mark it CANCELLED. Child processes it spawned keep running.
    pub async fn kill(&self, branch_id: u64) -> bool {
        let Some(branch) = self.get(branch_id) else {
            return false;
        };

        branch.cancel.cancel();
        let handle = branch.task.lock().expect("branch task lock").take();
        if let Some(handle) = handle {
            if !handle.is_finished()
                && tokio::time::timeout(Duration::from_secs(5), handle)
                    .await
                    .is_err()
            {
                warn!(branch = branch_id, "branch task did not stop within 5s");
            }
        }

        branch.set_status(BranchStatus::Cancelled);
        self.release_all_locks(branch_id);
        if let Some(store) = self.store.clone() {
            let agent = self.agent.clone();
            if let Err(e) = store
                .update_branch_status(&agent, branch_id, BranchStatus::Cancelled)
                .await
            {
                warn!(branch = branch_id, error = %e, "failed to persist cancel");
            }
        }
        info!(agent = %self.agent, branch = branch_id, "killed branch");
        true
    }

    /// Kill all non-terminal branches. Returns the count killed.
    pub async fn kill_all(&self) -> usize {
        let active: Vec<u64> = self.list_active().iter().map(|b| b.id).collect();
        let mut killed = 0;
        for id in active {
            if self.kill(id).await {
                killed += 1;
            }
        }
        killed
    }

    /// Drop terminal branches older than `max_age`. Their outbound index
    /// entries go with them, so late replies fall back to a new branch.
    pub fn cleanup_completed(&self, max_age: Duration) {
        let cutoff =
            Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
        let mut branches = self.branches.lock().expect("branches lock");
        let stale: Vec<u64> = branches
            .values()
            .filter(|b| {
                b.status().is_terminal()
                    && b.completed_at().is_some_and(|t| t < cutoff)
            })
            .map(|b| b.id)
            .collect();
        if stale.is_empty() {
            return;
        }
        for id in &stale {
            branches.remove(id);
        }
        let mut index = self.outbound_index.lock().expect("outbound index lock");
        index.retain(|_, branch_id| !stale.contains(branch_id));
        info!(agent = %self.agent, count = stale.len(), "cleaned up completed branches");
    }
}

/// Format the active-branch block injected into sibling system prompts.
pub fn build_branch_status(manager: &BranchManager, current_branch_id: u64) -> String {
    let active = manager.list_active();
    if active.is_empty() {
        return "No active branches.".into();
    }
    let mut lines = vec!["Active branches:".to_string()];
    for branch in active {
        let marker = if branch.id == current_branch_id {
            " (this branch)"
        } else {
            ""
        };
        let metrics = branch.metrics();
        let summary = if branch.summary.is_empty() {
            "Starting..."
        } else {
            &branch.summary
        };
        lines.push(format!(
            "  #{}{marker}: {summary} — step {}, {}s elapsed, currently: {} [{}]",
            branch.id,
            metrics.step_number,
            metrics.elapsed_ms() / 1000,
            metrics.current_step,
            branch.status().as_str(),
        ));
    }
    lines.join("\n")
}
