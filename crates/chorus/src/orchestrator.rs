//! The orchestrator — routes inbound chat messages to execution branches,
//! wires the tool loop to the gateway, ask UI, stores, and process hooks,
//! and owns branch creation for hook re-entry and inter-agent sends.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::agent::events::{LoopEvent, OnEvent};
use crate::agent::tool_loop::{
    AskFn, AskOutcome, AskRequest, LoopResult, ToolLoopConfig, run_tool_loop,
};
use crate::agent::{Agent, read_agent_docs};
use crate::branch::{BranchManager, BranchStatus, ExecutionBranch};
use crate::channel::{AskBroker, AskPrompt, ChannelId, ChatGateway, MessageId, OutboundMessage};
use crate::config::{ChorusHome, GlobalConfig};
use crate::context::{ContextStore, build_system_text, window_to_messages};
use crate::error::Error;
use crate::llm::BoxedProvider;
use crate::llm::types::Usage;
use crate::process::hooks::{HookCommand, SpawnBranchRequest};
use crate::process::manager::ProcessManager;
use crate::status::{
    LiveStatusView, PresenceTracker, RateLimitedSender, chunk_with_footer,
};
use crate::store::{MessageRole, NewMessage, Store};
use crate::tool::{CommBus, ExecContext, ToolRegistry, default_registry};

const FALLBACK_MODEL: &str = "claude-sonnet-4-20250514";
const OUTBOUND_LIMIT: usize = 4000;

/// Builds a provider for a model id (injected so tests can script one).
pub type ProviderFactory = dyn Fn(&str) -> Result<BoxedProvider, Error> + Send + Sync;

/// An inbound chat message delivered by the gateway.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub channel: ChannelId,
    pub message_id: MessageId,
    pub author_id: i64,
    pub author_is_admin: bool,
    pub content: String,
    /// The message this one replies to, if any.
    pub reply_to: Option<MessageId>,
}

/// Where a branch run came from; controls invoker binding and depth.
#[derive(Debug, Clone, Default)]
struct RunOrigin {
    author_id: Option<i64>,
    is_admin: bool,
    reply_to: Option<MessageId>,
}

pub struct Orchestrator {
    weak: Weak<Orchestrator>,
    home: ChorusHome,
    config: GlobalConfig,
    store: Arc<Store>,
    gateway: Arc<dyn ChatGateway>,
    sender: Arc<RateLimitedSender>,
    ask: Arc<AskBroker>,
    presence: Arc<PresenceTracker>,
    processes: Arc<ProcessManager>,
    providers: Arc<ProviderFactory>,
    registry: ToolRegistry,
    branch_managers: Mutex<HashMap<String, Arc<BranchManager>>>,
    contexts: Mutex<HashMap<String, Arc<ContextStore>>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        home: ChorusHome,
        config: GlobalConfig,
        store: Arc<Store>,
        gateway: Arc<dyn ChatGateway>,
        ask: Arc<AskBroker>,
        processes: Arc<ProcessManager>,
        providers: Arc<ProviderFactory>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            home,
            config,
            sender: Arc::new(RateLimitedSender::new(gateway.clone())),
            presence: PresenceTracker::new(gateway.clone()),
            store,
            gateway,
            ask,
            processes,
            providers,
            registry: default_registry(),
            branch_managers: Mutex::new(HashMap::new()),
            contexts: Mutex::new(HashMap::new()),
        })
    }

    fn strong(&self) -> Arc<Self> {
        self.weak.upgrade().expect("orchestrator dropped")
    }

    /// Drain hook commands from the dispatcher. Spawned once at startup;
    /// runs until the sender side closes.
    pub fn spawn_hook_worker(self: &Arc<Self>, mut rx: mpsc::Receiver<HookCommand>) {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                this.handle_hook_command(command).await;
            }
        });
    }

    async fn handle_hook_command(self: &Arc<Self>, command: HookCommand) {
        match command {
            HookCommand::StopBranch { agent, branch } => {
                let bm = self.branch_manager(&agent).await;
                bm.kill(branch).await;
            }
            HookCommand::InjectContext { agent, branch, text } => {
                let bm = self.branch_manager(&agent).await;
                if bm.inject(branch, text.clone()) {
                    // Persist so the rolling window matches what the loop saw
                    if let Err(e) = self
                        .store
                        .persist_message(
                            &agent,
                            MessageRole::User,
                            NewMessage {
                                branch: Some(branch as i64),
                                content: Some(text),
                                ..Default::default()
                            },
                        )
                        .await
                    {
                        warn!(agent = %agent, branch, error = %e, "failed to persist injected context");
                    }
                }
            }
            HookCommand::SpawnBranch(request) => {
                if let Err(e) = self.spawn_hook_branch(request).await {
                    warn!(error = %e, "failed to spawn hook branch");
                }
            }
            HookCommand::NotifyChannel { agent, pid, text } => {
                if let Err(e) = self.notify_channel(&agent, pid, &text).await {
                    warn!(agent, pid, error = %e, "failed to notify channel");
                }
            }
        }
    }

    async fn notify_channel(&self, agent: &str, pid: u32, text: &str) -> Result<(), Error> {
        let agent_record = Agent::load(&self.home, agent)?;
        let message = format!("Process PID {pid}: {text}");
        self.sender
            .send(agent_record.channel_id, OutboundMessage::text(message))
            .await?;
        Ok(())
    }

    /// Branch creation for hook-triggered re-entries. Depth is re-checked
    /// here — the orchestrator owns branch creation exclusively.
    pub async fn spawn_hook_branch(
        self: &Arc<Self>,
        request: SpawnBranchRequest,
    ) -> Result<(), Error> {
        const MAX_DEPTH: usize = crate::process::hooks::DEFAULT_MAX_RECURSION_DEPTH;
        if request.recursion_depth > MAX_DEPTH {
            return Err(Error::RecursionDepthExceeded(request.recursion_depth));
        }

        let agent = Agent::load(&self.home, &request.agent)?;
        let bm = self.branch_manager(&agent.name).await;
        let branch = bm.create_branch(&request.seed, None, request.recursion_depth);

        self.store
            .persist_message(
                &agent.name,
                MessageRole::User,
                NewMessage {
                    branch: Some(branch.id as i64),
                    content: Some(request.seed.clone()),
                    ..Default::default()
                },
            )
            .await?;

        let permit = request.permit;
        self.run_branch(agent, branch, RunOrigin::default(), permit)
            .await;
        Ok(())
    }

    /// Handle one inbound message. Returns `false` when the channel has no
    /// agent bound (the control plane owns it).
    pub async fn handle_inbound(self: &Arc<Self>, inbound: InboundMessage) -> Result<bool, Error> {
        let Some(agent_name) = self.store.agent_name_by_channel(inbound.channel).await? else {
            return Ok(false);
        };
        let agent = Agent::load(&self.home, &agent_name)?;
        let bm = self.branch_manager(&agent_name).await;

        let origin = RunOrigin {
            author_id: Some(inbound.author_id),
            is_admin: inbound.author_is_admin,
            reply_to: Some(inbound.message_id),
        };

        // Reply-based routing: a reply joins its target branch; a live
        // branch gets the message injected, a finished one resumes.
        if let Some(reply_to) = inbound.reply_to
            && let Some(branch) = bm.route(reply_to)
        {
            self.store
                .persist_message(
                    &agent_name,
                    MessageRole::User,
                    NewMessage {
                        branch: Some(branch.id as i64),
                        content: Some(inbound.content.clone()),
                        outbound_message_id: Some(inbound.message_id as i64),
                        ..Default::default()
                    },
                )
                .await?;

            if branch.status().is_terminal() {
                info!(agent = %agent_name, branch = branch.id, "resuming branch from reply");
                self.run_branch(agent, branch, origin, None).await;
            } else {
                info!(agent = %agent_name, branch = branch.id, "injecting reply into live branch");
                bm.inject(branch.id, inbound.content);
            }
            return Ok(true);
        }

        // Non-reply (or expired route): always a fresh branch.
        let branch = bm.create_branch(&inbound.content, None, 0);
        self.store
            .persist_message(
                &agent_name,
                MessageRole::User,
                NewMessage {
                    branch: Some(branch.id as i64),
                    content: Some(inbound.content),
                    outbound_message_id: Some(inbound.message_id as i64),
                    ..Default::default()
                },
            )
            .await?;
        self.run_branch(agent, branch, origin, None).await;
        Ok(true)
    }

    /// The branch manager for an agent, created (and id-seeded from the
    /// store) on first use. Also the control plane's path to branch
    /// listing and kills.
    pub async fn branch_manager(&self, agent: &str) -> Arc<BranchManager> {
        let existing = {
            let managers = self.branch_managers.lock().expect("branch managers lock");
            managers.get(agent).cloned()
        };
        if let Some(bm) = existing {
            return bm;
        }

        let bm = BranchManager::new(agent, Some(self.store.clone()));
        match self.store.max_branch_id(agent).await {
            Ok(max_id) => bm.seed_next_id(max_id + 1),
            Err(e) => warn!(agent, error = %e, "failed to seed branch ids"),
        }
        self.branch_managers
            .lock()
            .expect("branch managers lock")
            .entry(agent.to_string())
            .or_insert(bm)
            .clone()
    }

    fn context_store(&self, agent: &Agent) -> Arc<ContextStore> {
        self.contexts
            .lock()
            .expect("contexts lock")
            .entry(agent.name.clone())
            .or_insert_with(|| {
                Arc::new(ContextStore::new(
                    agent.name.clone(),
                    self.store.clone(),
                    self.home.sessions_dir(&agent.name),
                    agent.window_seconds,
                ))
            })
            .clone()
    }

    /// Spawn a branch's tool-loop task.
    async fn run_branch(
        self: &Arc<Self>,
        agent: Agent,
        branch: Arc<ExecutionBranch>,
        origin: RunOrigin,
        permit: Option<tokio::sync::OwnedSemaphorePermit>,
    ) {
        let bm = self.branch_manager(&agent.name).await;
        let this = self.clone();
        let branch_for_task = branch.clone();
        bm.start(&branch, async move {
            let _permit = permit;
            this.drive_branch(agent, branch_for_task, origin).await;
        });
    }

    async fn drive_branch(self: Arc<Self>, agent: Agent, branch: Arc<ExecutionBranch>, origin: RunOrigin) {
        let bm = self.branch_manager(&agent.name).await;
        let contexts = self.context_store(&agent);

        let view = Arc::new(LiveStatusView::new(
            self.gateway.clone(),
            agent.channel_id,
            agent.name.clone(),
            branch.id,
            origin.reply_to,
        ));
        if let Some(message_id) = view.start().await {
            bm.register_outbound(branch.id, message_id);
        }
        self.presence.branch_started(&agent.name, branch.id).await;

        let outcome = self
            .execute_loop(&agent, &branch, &bm, &contexts, &origin, view.clone())
            .await;

        match outcome {
            Ok(result) => {
                branch.set_status(BranchStatus::Completed);
                bm.persist_status(&branch);
                bm.finalize_steps(branch.id);

                let metrics = branch.metrics();
                view.update(|s| {
                    s.step_number = metrics.step_number;
                    s.token_usage = result.total_usage;
                    s.llm_iterations = result.iterations;
                    s.tool_calls_made = result.tool_calls_made;
                })
                .await;
                view.finalize("completed", None, None).await;

                if let Err(e) = self
                    .deliver_response(&agent, &branch, &bm, &contexts, &result)
                    .await
                {
                    warn!(agent = %agent.name, branch = branch.id, error = %e, "failed to deliver response");
                }
            }
            Err(e) => {
                warn!(agent = %agent.name, branch = branch.id, error = %e, "branch errored");
                branch.set_status(BranchStatus::Errored);
                bm.persist_status(&branch);
                bm.finalize_steps(branch.id);
                view.finalize("error", Some(format!("{}: {e}", e.kind())), None).await;
            }
        }

        self.presence.branch_finished(&agent.name, branch.id).await;
    }

    async fn execute_loop(
        &self,
        agent: &Agent,
        branch: &Arc<ExecutionBranch>,
        bm: &Arc<BranchManager>,
        contexts: &Arc<ContextStore>,
        origin: &RunOrigin,
        view: Arc<LiveStatusView>,
    ) -> Result<LoopResult, Error> {
        let profile = Arc::new(agent.permissions.compile()?);
        let model = agent
            .model
            .clone()
            .or_else(|| self.config.default_model.clone())
            .unwrap_or_else(|| FALLBACK_MODEL.to_string());
        let provider = (self.providers)(&model)?;

        self.home.ensure_agent_dirs(&agent.name)?;
        let workspace = crate::workspace::Workspace::open(self.home.workspace_dir(&agent.name))?;

        let docs = read_agent_docs(&self.home, &agent.name);
        let mut system = build_system_text(
            &agent.system_prompt,
            &docs,
            branch.id,
            bm,
            Some(&self.processes),
        );
        if let Some(scope) = &self.config.scope_path {
            system.push_str(&format!(
                "\n\nHost scope path (exposed to shells as SCOPE_PATH): {}",
                scope.display()
            ));
        }

        let window = contexts.get_window(Some(branch.id as i64)).await?;
        let messages = window_to_messages(&window);

        let mut ctx = ExecContext::new(
            agent.name.clone(),
            workspace,
            profile,
            self.home.clone(),
        )
        .with_branch(branch.id)
        .with_store(self.store.clone())
        .with_branches(bm.clone())
        .with_processes(self.processes.clone())
        .with_comm(self.clone_comm())
        .with_admin(origin.is_admin);
        if let Some(author) = origin.author_id {
            ctx = ctx.with_invoker(author);
        }
        ctx.scope_path = self.config.scope_path.clone();

        // Ask prompts bind to the invoking user's channel; branches with no
        // invoker (hook re-entries, agent sends) deny on ASK.
        let ask_fn: Option<Box<AskFn>> = origin.author_id.map(|author| {
            let broker = self.ask.clone();
            let channel = agent.channel_id;
            let boxed: Box<AskFn> = Box::new(move |request: AskRequest| {
                let broker = broker.clone();
                let prompt = AskPrompt {
                    channel,
                    requester: author,
                    action: request.action,
                    tool: request.tool,
                    arguments: request.arguments,
                };
                Box::pin(async move { broker.ask(prompt).await })
                    as Pin<Box<dyn Future<Output = AskOutcome> + Send>>
            });
            boxed
        });

        let on_event: Arc<OnEvent> = {
            let view = view.clone();
            Arc::new(move |event: LoopEvent| {
                let view = view.clone();
                tokio::spawn(async move {
                    match event {
                        LoopEvent::LlmCallStart { iteration, .. } => {
                            view.update(|s| {
                                s.status = "processing".into();
                                s.llm_iterations = iteration;
                                s.current_step = format!("Thinking (call {iteration})");
                                s.step_number += 1;
                            })
                            .await;
                        }
                        LoopEvent::LlmCallComplete { total_usage, .. } => {
                            view.update(|s| s.token_usage = total_usage).await;
                        }
                        LoopEvent::ToolCallStart { tool, .. } => {
                            view.update(|s| {
                                s.status = "processing".into();
                                s.current_step = format!("Running {tool}");
                                s.step_number += 1;
                                s.tool_calls_made += 1;
                            })
                            .await;
                        }
                        LoopEvent::PermissionAsk { action, .. } => {
                            view.update(|s| {
                                s.status = "waiting".into();
                                s.current_step = format!("Awaiting permission: {action}");
                            })
                            .await;
                        }
                        _ => {}
                    }
                });
            })
        };

        let loop_config = ToolLoopConfig {
            max_iterations: self.config.max_tool_loop_iterations,
            ..Default::default()
        };
        run_tool_loop(
            &provider,
            system,
            messages,
            &self.registry,
            Arc::new(ctx),
            &loop_config,
            ask_fn.as_deref(),
            Some(on_event),
        )
        .await
    }

    /// Send the final response, chunked, with the footer on the last chunk;
    /// register every outbound id for reply routing; persist the assistant
    /// message.
    async fn deliver_response(
        &self,
        agent: &Agent,
        branch: &Arc<ExecutionBranch>,
        bm: &Arc<BranchManager>,
        contexts: &Arc<ContextStore>,
        result: &LoopResult,
    ) -> Result<(), Error> {
        if result.content.is_empty() {
            return Ok(());
        }

        let metrics = branch.metrics();
        let footer = format_footer(branch.id, metrics.step_number, result.total_usage, metrics.elapsed_ms());
        let chunks = chunk_with_footer(&result.content, &footer, OUTBOUND_LIMIT);

        let mut first_id: Option<MessageId> = None;
        for chunk in chunks {
            let id = self
                .sender
                .send(agent.channel_id, OutboundMessage::text(chunk))
                .await?;
            bm.register_outbound(branch.id, id);
            first_id.get_or_insert(id);
        }

        contexts
            .persist(
                MessageRole::Assistant,
                NewMessage {
                    branch: Some(branch.id as i64),
                    content: Some(result.content.clone()),
                    outbound_message_id: first_id.map(|id| id as i64),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    fn clone_comm(&self) -> Arc<dyn CommBus> {
        self.strong()
    }
}

fn format_footer(branch_id: u64, steps: u32, usage: Usage, elapsed_ms: i64) -> String {
    format!(
        "-# branch #{branch_id} · {steps} steps · {} in / {} out · {:.1}s",
        usage.input_tokens,
        usage.output_tokens,
        elapsed_ms as f64 / 1000.0
    )
}

impl CommBus for Orchestrator {
    /// Deliver an inter-agent message: seed a new branch in the target
    /// agent's channel under the target's own profile, with no invoker
    /// (ASK prompts deny, permissions are never elevated).
    fn deliver(
        &self,
        _from_agent: &str,
        target_agent: &str,
        message: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + '_>> {
        let target = target_agent.to_string();
        let message = message.to_string();
        let this = self.strong();
        Box::pin(async move {
            let agent = Agent::load(&this.home, &target)?;
            let bm = this.branch_manager(&target).await;
            let branch = bm.create_branch(&message, None, 0);
            this.store
                .persist_message(
                    &target,
                    MessageRole::User,
                    NewMessage {
                        branch: Some(branch.id as i64),
                        content: Some(message),
                        ..Default::default()
                    },
                )
                .await?;
            this.run_branch(agent, branch, RunOrigin::default(), None).await;
            Ok(())
        })
    }
}
