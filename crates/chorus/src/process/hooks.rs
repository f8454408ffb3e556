//! Hook dispatcher — evaluates process callbacks and dispatches actions.
//!
//! Wired into the process manager's event sink. Branch-touching actions
//! never call into the branch layer directly; they post [`HookCommand`]s
//! onto a channel the orchestrator drains, which keeps the
//! process-manager ↔ orchestrator invocation graph one-way.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tracing::{info, warn};

use crate::process::manager::{ProcessEvents, ProcessManager};
use crate::process::{HookAction, TrackedProcess, TriggerType};

pub const DEFAULT_OUTPUT_DELAY_SECS: f64 = 2.0;
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 3;
pub const DEFAULT_SPAWN_CONCURRENCY: usize = 3;

/// Seed for a hook-spawned branch, posted to the orchestrator.
pub struct SpawnBranchRequest {
    pub agent: String,
    /// Fully rendered seed text: instruction, process context, recent output.
    pub seed: String,
    pub recursion_depth: usize,
    /// Held until the spawned branch finishes; bounds hook-spawned branches
    /// in flight.
    pub permit: Option<tokio::sync::OwnedSemaphorePermit>,
}

impl std::fmt::Debug for SpawnBranchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnBranchRequest")
            .field("agent", &self.agent)
            .field("recursion_depth", &self.recursion_depth)
            .finish_non_exhaustive()
    }
}

/// Actions the dispatcher cannot perform itself.
#[derive(Debug)]
pub enum HookCommand {
    StopBranch {
        agent: String,
        branch: u64,
    },
    InjectContext {
        agent: String,
        branch: u64,
        text: String,
    },
    SpawnBranch(SpawnBranchRequest),
    NotifyChannel {
        agent: String,
        pid: u32,
        text: String,
    },
}

pub struct HookDispatcher {
    weak: Weak<HookDispatcher>,
    pm: Arc<ProcessManager>,
    commands: mpsc::Sender<HookCommand>,
    default_output_delay: f64,
    max_recursion_depth: usize,
    spawn_semaphore: Arc<Semaphore>,
    /// (pid, callback index) pairs with a delayed fire already scheduled.
    pending_delays: Mutex<HashSet<(u32, usize)>>,
}

impl HookDispatcher {
    pub fn new(
        pm: Arc<ProcessManager>,
        commands: mpsc::Sender<HookCommand>,
    ) -> Arc<Self> {
        Self::with_limits(
            pm,
            commands,
            DEFAULT_OUTPUT_DELAY_SECS,
            DEFAULT_MAX_RECURSION_DEPTH,
            DEFAULT_SPAWN_CONCURRENCY,
        )
    }

    pub fn with_limits(
        pm: Arc<ProcessManager>,
        commands: mpsc::Sender<HookCommand>,
        default_output_delay: f64,
        max_recursion_depth: usize,
        spawn_concurrency: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            pm,
            commands,
            default_output_delay,
            max_recursion_depth,
            spawn_semaphore: Arc::new(Semaphore::new(spawn_concurrency)),
            pending_delays: Mutex::new(HashSet::new()),
        })
    }

    /// Atomically claim one firing of callback `idx`. Returns the action and
    /// composed context, or `None` when exhausted or out of range.
    fn claim_firing(
        &self,
        tracked: &TrackedProcess,
        idx: usize,
        event_context: &str,
    ) -> Option<(HookAction, String)> {
        let mut callbacks = tracked.callbacks.lock().expect("process callbacks lock");
        let cb = callbacks.get_mut(idx)?;
        if cb.exhausted() {
            return None;
        }
        cb.fire_count += 1;
        info!(
            pid = tracked.pid,
            action = ?cb.action,
            fire = cb.fire_count,
            max = cb.max_fires,
            "firing process callback"
        );
        let context = match (cb.context_message.is_empty(), event_context.is_empty()) {
            (false, false) => format!("{}\n\n{event_context}", cb.context_message),
            (false, true) => cb.context_message.clone(),
            (true, _) => event_context.to_string(),
        };
        Some((cb.action, context))
    }

    async fn fire(&self, pid: u32, idx: usize, event_context: &str) {
        let Some(tracked) = self.pm.get(pid) else { return };
        let Some((action, context)) = self.claim_firing(&tracked, idx, event_context) else {
            return;
        };

        match action {
            HookAction::StopProcess => {
                if let Err(e) = self.pm.kill(pid).await {
                    warn!(pid, error = %e, "stop_process hook failed");
                }
            }
            HookAction::StopBranch => {
                if let Some(branch) = tracked.parent_branch {
                    self.send(HookCommand::StopBranch {
                        agent: tracked.agent.clone(),
                        branch,
                    })
                    .await;
                }
            }
            HookAction::InjectContext => {
                if let Some(branch) = tracked.parent_branch {
                    self.send(HookCommand::InjectContext {
                        agent: tracked.agent.clone(),
                        branch,
                        text: context,
                    })
                    .await;
                }
            }
            HookAction::NotifyChannel => {
                self.send(HookCommand::NotifyChannel {
                    agent: tracked.agent.clone(),
                    pid,
                    text: context,
                })
                .await;
            }
            HookAction::SpawnBranch => {
                self.spawn_branch(&tracked, context);
            }
        }
    }

    fn spawn_branch(&self, tracked: &TrackedProcess, context: String) {
        let depth = tracked.recursion_depth + 1;
        if depth > self.max_recursion_depth {
            warn!(
                pid = tracked.pid,
                depth,
                max = self.max_recursion_depth,
                "hook recursion depth exceeded, dropping spawn_branch"
            );
            return;
        }

        let exit_note = tracked
            .exit_code()
            .map(|c| format!(" (exit {c})"))
            .unwrap_or_default();
        let recent = tracked.tail(crate::process::ROLLING_TAIL_LINES);
        let recent = if recent.is_empty() {
            "(no output)".to_string()
        } else {
            recent.join("\n")
        };
        let seed = format!(
            "A process hook was triggered.\n\n\
             **Process:** PID {}\n\
             **Command:** `{}`\n\
             **Status:** {}{exit_note}\n\
             **Trigger context:** {context}\n\n\
             **Recent output:**\n```\n{recent}\n```\n\n\
             Respond to this event as instructed.",
            tracked.pid,
            tracked.command,
            tracked.status().as_str(),
        );

        let request_base = (tracked.agent.clone(), seed, depth);
        let semaphore = self.spawn_semaphore.clone();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let (agent, seed, recursion_depth) = request_base;
            if commands
                .send(HookCommand::SpawnBranch(SpawnBranchRequest {
                    agent,
                    seed,
                    recursion_depth,
                    permit: Some(permit),
                }))
                .await
                .is_err()
            {
                warn!("hook command channel closed, dropping spawn_branch");
            }
        });
    }

    async fn send(&self, command: HookCommand) {
        if self.commands.send(command).await.is_err() {
            warn!("hook command channel closed, dropping command");
        }
    }

    fn schedule_delayed_fire(&self, pid: u32, idx: usize, trigger_line: String, delay: f64) {
        {
            let mut pending = self.pending_delays.lock().expect("pending delays lock");
            if !pending.insert((pid, idx)) {
                // A delay window is already accumulating for this callback
                return;
            }
        }

        let Some(this) = self.weak.upgrade() else { return };
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            this.pending_delays
                .lock()
                .expect("pending delays lock")
                .remove(&(pid, idx));

            let Some(tracked) = this.pm.get(pid) else { return };
            let tail = tracked.tail(20);
            let context = format!(
                "Output matched pattern: {trigger_line}\nRecent output after delay:\n{}",
                tail.join("\n")
            );
            this.fire(pid, idx, &context).await;
        });
    }

    fn start_timeout_watchers(&self, pid: u32) {
        let Some(tracked) = self.pm.get(pid) else { return };
        let callbacks = tracked.callbacks_snapshot();
        for (idx, cb) in callbacks.iter().enumerate() {
            if cb.trigger.trigger_type != TriggerType::OnTimeout || cb.exhausted() {
                continue;
            }
            let Some(seconds) = cb.trigger.timeout_seconds else { continue };
            let Some(this) = self.weak.upgrade() else { return };
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
                let Some(tracked) = this.pm.get(pid) else { return };
                if !tracked.is_running() {
                    return;
                }
                this.fire(pid, idx, "Process timed out").await;
            });
        }
    }
}

impl ProcessEvents for HookDispatcher {
    fn on_line<'a>(
        &'a self,
        pid: u32,
        _stream: &'a str,
        line: &'a str,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let Some(tracked) = self.pm.get(pid) else { return };
            let callbacks = tracked.callbacks_snapshot();
            for (idx, cb) in callbacks.iter().enumerate() {
                if cb.trigger.trigger_type != TriggerType::OnOutputMatch || cb.exhausted() {
                    continue;
                }
                let Some(pattern) = cb.trigger.compiled_pattern() else { continue };
                if !pattern.is_match(line) {
                    continue;
                }

                let delay = if cb.output_delay_seconds > 0.0 {
                    cb.output_delay_seconds
                } else {
                    self.default_output_delay
                };
                if delay > 0.0 {
                    self.schedule_delayed_fire(pid, idx, line.to_string(), delay);
                } else {
                    self.fire(pid, idx, &format!("Output matched: {line}")).await;
                }
            }
        })
    }

    fn on_exit<'a>(
        &'a self,
        pid: u32,
        exit_code: Option<i32>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let Some(tracked) = self.pm.get(pid) else { return };
            let callbacks = tracked.callbacks_snapshot();
            for (idx, cb) in callbacks.iter().enumerate() {
                if cb.trigger.trigger_type != TriggerType::OnExit || cb.exhausted() {
                    continue;
                }
                if !cb.trigger.exit_filter.matches(exit_code) {
                    continue;
                }
                let context = format!(
                    "Process exited with code {}. Command: {}",
                    exit_code.map_or("none".to_string(), |c| c.to_string()),
                    tracked.command
                );
                self.fire(pid, idx, &context).await;
            }
        })
    }

    fn on_spawn(&self, pid: u32) {
        self.start_timeout_watchers(pid);
    }
}
