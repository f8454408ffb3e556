//! Tracked subprocess models — statuses, hook triggers, callbacks.

pub mod hooks;
pub mod manager;
pub mod monitor;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Lines kept in the in-memory rolling tail of a process's output.
pub const ROLLING_TAIL_LINES: usize = 100;

/// Lifecycle status of a tracked process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Exited,
    Killed,
    /// Still (or last seen) alive, but unobservable — typically after a
    /// host restart lost the pipe file descriptors.
    Lost,
}

impl ProcessStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessStatus::Running => "running",
            ProcessStatus::Exited => "exited",
            ProcessStatus::Killed => "killed",
            ProcessStatus::Lost => "lost",
        }
    }
}

/// How the process relates to the branch that spawned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpawnKind {
    /// Runs alongside the spawning branch, which continues immediately.
    Concurrent,
    /// Outlives the branch; surfaces as a live status card in the channel.
    Background,
}

impl SpawnKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SpawnKind::Concurrent => "concurrent",
            SpawnKind::Background => "background",
        }
    }
}

/// Which exit codes satisfy an `on_exit` trigger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitFilter {
    #[default]
    Any,
    Success,
    Failure,
}

impl ExitFilter {
    pub fn matches(self, exit_code: Option<i32>) -> bool {
        match self {
            ExitFilter::Any => true,
            ExitFilter::Success => exit_code == Some(0),
            ExitFilter::Failure => exit_code != Some(0),
        }
    }
}

/// What event fires a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    OnExit,
    OnOutputMatch,
    OnTimeout,
}

/// Describes when a callback should fire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookTrigger {
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub exit_filter: ExitFilter,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<f64>,
    #[serde(skip)]
    compiled: OnceLock<Option<Regex>>,
}

impl HookTrigger {
    pub fn on_exit(filter: ExitFilter) -> Self {
        Self {
            trigger_type: TriggerType::OnExit,
            exit_filter: filter,
            pattern: None,
            timeout_seconds: None,
            compiled: OnceLock::new(),
        }
    }

    pub fn on_output_match(pattern: impl Into<String>) -> Self {
        Self {
            trigger_type: TriggerType::OnOutputMatch,
            exit_filter: ExitFilter::Any,
            pattern: Some(pattern.into()),
            timeout_seconds: None,
            compiled: OnceLock::new(),
        }
    }

    pub fn on_timeout(seconds: f64) -> Self {
        Self {
            trigger_type: TriggerType::OnTimeout,
            exit_filter: ExitFilter::Any,
            pattern: None,
            timeout_seconds: Some(seconds),
            compiled: OnceLock::new(),
        }
    }

    /// Compiled regex for `on_output_match` triggers; `None` for other
    /// trigger types or invalid patterns (logged, then inert).
    pub fn compiled_pattern(&self) -> Option<&Regex> {
        self.compiled
            .get_or_init(|| {
                if self.trigger_type != TriggerType::OnOutputMatch {
                    return None;
                }
                let pattern = self.pattern.as_deref()?;
                match Regex::new(pattern) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        tracing::warn!(pattern, error = %e, "invalid hook pattern, disabling");
                        None
                    }
                }
            })
            .as_ref()
    }
}

/// What happens when a callback fires. Free-form payloads (the injected
/// text, the spawn instruction, the notification body) ride in the
/// callback's `context_message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookAction {
    StopProcess,
    StopBranch,
    InjectContext,
    SpawnBranch,
    NotifyChannel,
}

fn default_max_fires() -> u32 {
    1
}

/// A single callback attached to a tracked process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessCallback {
    pub trigger: HookTrigger,
    pub action: HookAction,
    #[serde(default)]
    pub context_message: String,
    /// Seconds to keep accumulating output after an `on_output_match` hit
    /// before firing. Zero means fire immediately.
    #[serde(default)]
    pub output_delay_seconds: f64,
    #[serde(default = "default_max_fires")]
    pub max_fires: u32,
    #[serde(default)]
    pub fire_count: u32,
}

impl ProcessCallback {
    pub fn new(trigger: HookTrigger, action: HookAction) -> Self {
        Self {
            trigger,
            action,
            context_message: String::new(),
            output_delay_seconds: 0.0,
            max_fires: 1,
            fire_count: 0,
        }
    }

    pub fn with_context(mut self, message: impl Into<String>) -> Self {
        self.context_message = message.into();
        self
    }

    pub fn exhausted(&self) -> bool {
        self.fire_count >= self.max_fires
    }
}

#[derive(Debug, Clone, Copy)]
struct ProcessState {
    status: ProcessStatus,
    exit_code: Option<i32>,
}

/// A process being tracked by the process manager.
///
/// Mutable fields sit behind `std::sync::Mutex` — they are touched briefly
/// from the monitor task, the hook dispatcher, and status rendering, never
/// across an await point.
#[derive(Debug)]
pub struct TrackedProcess {
    pub pid: u32,
    pub command: String,
    pub cwd: PathBuf,
    pub agent: String,
    pub spawn_kind: SpawnKind,
    pub started_at: DateTime<Utc>,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
    pub parent_branch: Option<u64>,
    pub recursion_depth: usize,
    /// Free-form context supplied at spawn (the instructions string).
    pub context: String,
    state: Mutex<ProcessState>,
    pub(crate) callbacks: Mutex<Vec<ProcessCallback>>,
    tail: Mutex<VecDeque<String>>,
    outbound_message_id: Mutex<Option<u64>>,
}

impl TrackedProcess {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pid: u32,
        command: impl Into<String>,
        cwd: PathBuf,
        agent: impl Into<String>,
        spawn_kind: SpawnKind,
        stdout_log: PathBuf,
        stderr_log: PathBuf,
        callbacks: Vec<ProcessCallback>,
        context: impl Into<String>,
        parent_branch: Option<u64>,
        recursion_depth: usize,
    ) -> Self {
        Self {
            pid,
            command: command.into(),
            cwd,
            agent: agent.into(),
            spawn_kind,
            started_at: Utc::now(),
            stdout_log,
            stderr_log,
            parent_branch,
            recursion_depth,
            context: context.into(),
            state: Mutex::new(ProcessState {
                status: ProcessStatus::Running,
                exit_code: None,
            }),
            callbacks: Mutex::new(callbacks),
            tail: Mutex::new(VecDeque::with_capacity(ROLLING_TAIL_LINES)),
            outbound_message_id: Mutex::new(None),
        }
    }

    pub fn status(&self) -> ProcessStatus {
        self.state.lock().expect("process state lock").status
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.state.lock().expect("process state lock").exit_code
    }

    pub fn is_running(&self) -> bool {
        self.status() == ProcessStatus::Running
    }

    /// Record an exit observed by the monitor. A kill that already marked
    /// the process KILLED keeps that status; only the code is updated.
    pub(crate) fn mark_exited(&self, exit_code: Option<i32>) {
        let mut state = self.state.lock().expect("process state lock");
        state.exit_code = exit_code;
        if state.status != ProcessStatus::Killed {
            state.status = ProcessStatus::Exited;
        }
    }

    pub(crate) fn mark_killed(&self, exit_code: Option<i32>) {
        let mut state = self.state.lock().expect("process state lock");
        state.status = ProcessStatus::Killed;
        if exit_code.is_some() {
            state.exit_code = exit_code;
        }
    }

    pub(crate) fn mark_lost(&self) {
        self.state.lock().expect("process state lock").status = ProcessStatus::Lost;
    }

    pub(crate) fn push_tail_line(&self, line: String) {
        let mut tail = self.tail.lock().expect("process tail lock");
        if tail.len() == ROLLING_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    /// The most recent `n` output lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let tail = self.tail.lock().expect("process tail lock");
        tail.iter()
            .skip(tail.len().saturating_sub(n))
            .cloned()
            .collect()
    }

    pub fn last_output_line(&self) -> Option<String> {
        self.tail.lock().expect("process tail lock").back().cloned()
    }

    pub fn callbacks_snapshot(&self) -> Vec<ProcessCallback> {
        self.callbacks.lock().expect("process callbacks lock").clone()
    }

    pub fn add_callbacks(&self, extra: Vec<ProcessCallback>) {
        self.callbacks
            .lock()
            .expect("process callbacks lock")
            .extend(extra);
    }

    pub fn set_outbound_message_id(&self, id: u64) {
        *self.outbound_message_id.lock().expect("outbound id lock") = Some(id);
    }

    pub fn outbound_message_id(&self) -> Option<u64> {
        *self.outbound_message_id.lock().expect("outbound id lock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_filter_matching() {
        assert!(ExitFilter::Any.matches(Some(0)));
        assert!(ExitFilter::Any.matches(Some(1)));
        assert!(ExitFilter::Any.matches(None));
        assert!(ExitFilter::Success.matches(Some(0)));
        assert!(!ExitFilter::Success.matches(Some(1)));
        assert!(!ExitFilter::Success.matches(None));
        assert!(ExitFilter::Failure.matches(Some(2)));
        assert!(ExitFilter::Failure.matches(None));
        assert!(!ExitFilter::Failure.matches(Some(0)));
    }

    #[test]
    fn callback_json_contract() {
        // The shape the run_* tool schemas accept from the LLM.
        let json = r#"{
            "trigger": {"type": "on_exit", "exit_filter": "failure"},
            "action": "spawn_branch",
            "context_message": "the tests failed; propose a fix"
        }"#;
        let cb: ProcessCallback = serde_json::from_str(json).unwrap();
        assert_eq!(cb.trigger.trigger_type, TriggerType::OnExit);
        assert_eq!(cb.trigger.exit_filter, ExitFilter::Failure);
        assert_eq!(cb.action, HookAction::SpawnBranch);
        assert_eq!(cb.max_fires, 1);
        assert_eq!(cb.fire_count, 0);
    }

    #[test]
    fn callback_roundtrips_with_fire_count() {
        let mut cb = ProcessCallback::new(
            HookTrigger::on_output_match("error|ERROR"),
            HookAction::StopProcess,
        );
        cb.fire_count = 1;
        cb.max_fires = 3;
        let json = serde_json::to_string(&cb).unwrap();
        let back: ProcessCallback = serde_json::from_str(&json).unwrap();
        assert_eq!(back.fire_count, 1);
        assert_eq!(back.max_fires, 3);
        assert_eq!(back.trigger.pattern.as_deref(), Some("error|ERROR"));
    }

    #[test]
    fn trigger_compiles_pattern_once() {
        let trigger = HookTrigger::on_output_match(r"PASS|FAIL");
        let re = trigger.compiled_pattern().unwrap();
        assert!(re.is_match("12 tests PASS"));
        assert!(trigger.compiled_pattern().is_some());
    }

    #[test]
    fn invalid_pattern_disables_trigger() {
        let trigger = HookTrigger::on_output_match("(unclosed");
        assert!(trigger.compiled_pattern().is_none());
    }

    #[test]
    fn non_output_triggers_have_no_pattern() {
        assert!(HookTrigger::on_exit(ExitFilter::Any).compiled_pattern().is_none());
        assert!(HookTrigger::on_timeout(30.0).compiled_pattern().is_none());
    }

    #[test]
    fn exhausted_after_max_fires() {
        let mut cb = ProcessCallback::new(HookTrigger::on_exit(ExitFilter::Any), HookAction::NotifyChannel);
        assert!(!cb.exhausted());
        cb.fire_count = 1;
        assert!(cb.exhausted());
    }

    fn tracked() -> TrackedProcess {
        TrackedProcess::new(
            4242,
            "make test",
            "/tmp".into(),
            "alpha",
            SpawnKind::Background,
            "/tmp/stdout.log".into(),
            "/tmp/stderr.log".into(),
            vec![],
            "",
            Some(1),
            0,
        )
    }

    #[test]
    fn tail_is_bounded() {
        let p = tracked();
        for i in 0..250 {
            p.push_tail_line(format!("line {i}"));
        }
        let tail = p.tail(ROLLING_TAIL_LINES);
        assert_eq!(tail.len(), ROLLING_TAIL_LINES);
        assert_eq!(tail.first().unwrap(), "line 150");
        assert_eq!(tail.last().unwrap(), "line 249");
        assert_eq!(p.last_output_line().unwrap(), "line 249");
    }

    #[test]
    fn kill_status_survives_exit_observation() {
        let p = tracked();
        p.mark_killed(None);
        // The monitor observes the exit afterwards
        p.mark_exited(Some(137));
        assert_eq!(p.status(), ProcessStatus::Killed);
        assert_eq!(p.exit_code(), Some(137));
    }

    #[test]
    fn plain_exit_sets_exited() {
        let p = tracked();
        p.mark_exited(Some(0));
        assert_eq!(p.status(), ProcessStatus::Exited);
        assert_eq!(p.exit_code(), Some(0));
    }
}
