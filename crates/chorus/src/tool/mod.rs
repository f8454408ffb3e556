pub mod agent_comm;
pub mod bash;
pub mod file_ops;
pub mod git;
pub mod run_process;
pub mod self_edit;

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use crate::branch::BranchManager;
use crate::config::ChorusHome;
use crate::error::Error;
use crate::llm::types::ToolDefinition;
use crate::permission::{self, Decision, PermissionProfile};
use crate::process::manager::ProcessManager;
use crate::store::Store;
use crate::workspace::Workspace;

/// Output of a tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }

    /// Render an [`Error`] as its `{"error": kind, "message": ...}` payload.
    pub fn from_error(error: &Error) -> Self {
        Self {
            content: error.to_tool_payload(),
            is_error: true,
        }
    }
}

/// Delivery path for inter-agent messages, implemented by the orchestrator.
pub trait CommBus: Send + Sync {
    /// Enqueue `message` as a new-branch seed in the target agent's channel.
    fn deliver(
        &self,
        from_agent: &str,
        target_agent: &str,
        message: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + '_>>;
}

/// Everything a tool handler may need, threaded through the tool loop.
///
/// The optional handles are absent only in narrow unit-test setups; the
/// orchestrator always wires all of them.
#[derive(Clone)]
pub struct ExecContext {
    pub agent: String,
    pub branch_id: u64,
    pub workspace: Workspace,
    pub profile: Arc<PermissionProfile>,
    pub home: ChorusHome,
    pub is_admin: bool,
    /// The chat user who triggered this branch; recorded in audit rows.
    pub invoker_user_id: Option<i64>,
    pub scope_path: Option<PathBuf>,
    pub store: Option<Arc<Store>>,
    pub branches: Option<Arc<BranchManager>>,
    pub processes: Option<Arc<ProcessManager>>,
    pub comm: Option<Arc<dyn CommBus>>,
}

impl ExecContext {
    pub fn new(
        agent: impl Into<String>,
        workspace: Workspace,
        profile: Arc<PermissionProfile>,
        home: ChorusHome,
    ) -> Self {
        Self {
            agent: agent.into(),
            branch_id: 0,
            workspace,
            profile,
            home,
            is_admin: false,
            invoker_user_id: None,
            scope_path: None,
            store: None,
            branches: None,
            processes: None,
            comm: None,
        }
    }

    pub fn with_branch(mut self, branch_id: u64) -> Self {
        self.branch_id = branch_id;
        self
    }

    pub fn with_store(mut self, store: Arc<Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_branches(mut self, branches: Arc<BranchManager>) -> Self {
        self.branches = Some(branches);
        self
    }

    pub fn with_processes(mut self, processes: Arc<ProcessManager>) -> Self {
        self.processes = Some(processes);
        self
    }

    pub fn with_comm(mut self, comm: Arc<dyn CommBus>) -> Self {
        self.comm = Some(comm);
        self
    }

    pub fn with_admin(mut self, is_admin: bool) -> Self {
        self.is_admin = is_admin;
        self
    }

    pub fn with_invoker(mut self, user_id: i64) -> Self {
        self.invoker_user_id = Some(user_id);
        self
    }
}

/// Trait for tools the agent loop can invoke.
///
/// `Pin<Box<dyn Future>>` keeps the trait dyn-compatible so tools live
/// behind `Arc<dyn Tool>` in the registry.
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    /// Build the `<detail>` part of the action string for a call.
    fn detail(&self, input: &serde_json::Value) -> String;

    /// Representative detail strings used by the registry's profile
    /// projection to decide whether any action of this tool could be
    /// non-denied. Purely an optimization probe — the runtime permission
    /// check stays authoritative.
    fn sample_details(&self) -> Vec<String> {
        vec![String::new(), "x".into()]
    }

    fn execute(
        &self,
        ctx: Arc<ExecContext>,
        input: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, Error>> + Send + '_>>;
}

/// Build the full action string for a tool call.
pub fn action_for(tool: &dyn Tool, input: &serde_json::Value) -> String {
    permission::format_action(&tool.definition().name, &tool.detail(input))
}

/// Central catalog of tools available to an agent.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.definition().name;
        if self.by_name.contains_key(&name) {
            tracing::warn!(tool = %name, "duplicate tool name, keeping first registration");
            return;
        }
        self.by_name.insert(name, self.tools.len());
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.by_name.get(name).map(|&i| self.tools[i].clone())
    }

    pub fn list(&self) -> Vec<Arc<dyn Tool>> {
        self.tools.clone()
    }

    /// Project tool definitions for a profile, omitting tools whose every
    /// probed action would be denied. Shrinks the schema block sent to the
    /// provider; the per-call check remains authoritative.
    pub fn project_for(&self, profile: &PermissionProfile) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .filter(|tool| {
                let name = tool.definition().name;
                tool.sample_details().iter().any(|detail| {
                    let action = permission::format_action(&name, detail);
                    permission::decide(&action, profile) != Decision::Deny
                })
            })
            .map(|tool| tool.definition())
            .collect()
    }
}

/// Build the default registry with all built-in tools.
pub fn default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(file_ops::CreateFileTool));
    registry.register(Arc::new(file_ops::StrReplaceTool));
    registry.register(Arc::new(file_ops::ViewTool));
    registry.register(Arc::new(file_ops::StrReplaceAllTool));
    registry.register(Arc::new(file_ops::InsertAtTool));
    registry.register(Arc::new(file_ops::ReplaceLinesTool));
    registry.register(Arc::new(bash::BashTool));
    registry.register(Arc::new(git::GitTool));
    registry.register(Arc::new(run_process::RunConcurrentTool));
    registry.register(Arc::new(run_process::RunBackgroundTool));
    registry.register(Arc::new(self_edit::SelfEditTool));
    registry.register(Arc::new(agent_comm::AgentCommTool));
    registry
}
