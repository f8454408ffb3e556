//! The agentic tool loop — message → LLM → tools → LLM until terminal.
//!
//! Each tool call is mediated by the permission engine. DENY synthesizes an
//! error tool result; ASK suspends on the ask callback (timeout denies).
//! A batch containing any ASK runs sequentially so the approval UI stays
//! serialized; otherwise calls execute in parallel, joined in call order.
//! Every decision lands in the audit log. Tool failures become structured
//! error payloads and the loop continues so the model can adapt.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::agent::events::{LoopEvent, OnEvent};
use crate::branch::BranchStatus;
use crate::error::Error;
use crate::llm::types::{ChatRequest, Message, Role, StopReason, ToolCall, ToolResult, Usage};
use crate::llm::{BoxedProvider, LlmProvider};
use crate::permission::{Decision, decide, format_action};
use crate::store::{MessageRole, NewMessage};
use crate::tool::{ExecContext, Tool, ToolRegistry};

pub const DEFAULT_MAX_ITERATIONS: usize = 25;

/// Outcome of an ask prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AskOutcome {
    Approved,
    Denied,
    TimedOut,
}

/// A pending approval handed to the ask callback.
#[derive(Debug, Clone)]
pub struct AskRequest {
    pub agent: String,
    pub branch: u64,
    pub action: String,
    pub tool: String,
    pub arguments: String,
}

/// Async callback resolving an ASK decision (the orchestrator binds this
/// to the channel's approval UI; timeouts resolve to `TimedOut`).
pub type AskFn =
    dyn Fn(AskRequest) -> Pin<Box<dyn Future<Output = AskOutcome> + Send>> + Send + Sync;

/// Loop tuning knobs.
#[derive(Debug, Clone)]
pub struct ToolLoopConfig {
    pub max_iterations: usize,
    pub max_tokens: u32,
    /// Request prompt-cache hints for the static prefix.
    pub cache: bool,
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_tokens: 4096,
            cache: true,
        }
    }
}

/// Result of a complete loop run.
#[derive(Debug, Clone)]
pub struct LoopResult {
    pub content: String,
    pub iterations: usize,
    pub tool_calls_made: usize,
    pub total_usage: Usage,
    pub truncated: bool,
}

fn emit(on_event: Option<&Arc<OnEvent>>, event: LoopEvent) {
    let Some(on_event) = on_event else { return };
    if std::panic::catch_unwind(AssertUnwindSafe(|| on_event(event))).is_err() {
        warn!("loop event handler panicked");
    }
}

fn set_branch_status(ctx: &ExecContext, status: BranchStatus) {
    if let Some(branches) = &ctx.branches
        && let Some(branch) = branches.get(ctx.branch_id)
    {
        branch.set_status(status);
    }
}

fn begin_step(ctx: &ExecContext, description: &str) {
    if let Some(branches) = &ctx.branches {
        branches.begin_step(ctx.branch_id, description);
    }
}

async fn audit_decision(ctx: &ExecContext, action: &str, decision: &str, detail: &str) {
    let Some(store) = &ctx.store else { return };
    if let Err(e) = store
        .append_audit(&ctx.agent, action, decision, ctx.invoker_user_id, detail)
        .await
    {
        warn!(agent = %ctx.agent, error = %e, "failed to append audit row");
    }
}

async fn persist(ctx: &ExecContext, role: MessageRole, message: NewMessage) {
    let Some(store) = &ctx.store else { return };
    if let Err(e) = store.persist_message(&ctx.agent, role, message).await {
        warn!(agent = %ctx.agent, error = %e, "failed to persist loop message");
    }
}

fn summarize_args(detail: &str) -> String {
    let mut cut = 60.min(detail.len());
    while cut < detail.len() && !detail.is_char_boundary(cut) {
        cut += 1;
    }
    if cut < detail.len() {
        format!("{}...", &detail[..cut])
    } else {
        detail.to_string()
    }
}

/// Run the agentic tool loop to completion.
///
/// `messages` is the seeded conversation (window + the triggering user
/// message). Provider errors propagate — the caller marks the branch
/// ERRORED.
pub async fn run_tool_loop(
    provider: &BoxedProvider,
    system: String,
    mut messages: Vec<Message>,
    registry: &ToolRegistry,
    ctx: Arc<ExecContext>,
    config: &ToolLoopConfig,
    ask: Option<&AskFn>,
    on_event: Option<Arc<OnEvent>>,
) -> Result<LoopResult, Error> {
    let projected = registry.project_for(&ctx.profile);
    let mut total_usage = Usage::default();
    let mut tool_calls_made = 0usize;
    let mut last_text = String::new();

    for iteration in 1..=config.max_iterations {
        // Replies that arrived mid-loop become user messages now, so the
        // model sees them on this call.
        if let Some(branches) = &ctx.branches {
            for injected in branches.drain_injections(ctx.branch_id) {
                messages.push(Message::user(injected));
            }
        }

        begin_step(&ctx, "Calling LLM");
        emit(
            on_event.as_ref(),
            LoopEvent::LlmCallStart {
                agent: ctx.agent.clone(),
                branch: ctx.branch_id,
                iteration,
            },
        );

        let request = ChatRequest {
            system: system.clone(),
            messages: messages.clone(),
            tools: projected.clone(),
            max_tokens: config.max_tokens,
            cache: config.cache,
        };
        let started = Instant::now();
        let response = provider.chat(request).await?;
        total_usage += response.usage;

        let tool_calls = response.tool_calls();
        debug!(
            agent = %ctx.agent,
            branch = ctx.branch_id,
            iteration,
            tool_calls = tool_calls.len(),
            stop_reason = ?response.stop_reason,
            "llm call complete"
        );
        emit(
            on_event.as_ref(),
            LoopEvent::LlmCallComplete {
                agent: ctx.agent.clone(),
                branch: ctx.branch_id,
                iteration,
                usage: response.usage,
                total_usage,
                stop_reason: response.stop_reason,
                tool_call_count: tool_calls.len(),
                latency_ms: started.elapsed().as_millis() as u64,
            },
        );

        let text = response.text();
        if !text.is_empty() {
            last_text = text.clone();
        }

        if tool_calls.is_empty() {
            if response.stop_reason == StopReason::MaxTokens {
                warn!(agent = %ctx.agent, branch = ctx.branch_id, "response truncated at max_tokens");
            }
            emit(
                on_event.as_ref(),
                LoopEvent::LoopComplete {
                    agent: ctx.agent.clone(),
                    branch: ctx.branch_id,
                    iterations: iteration,
                    tool_calls_made,
                    total_usage,
                    truncated: false,
                },
            );
            return Ok(LoopResult {
                content: text,
                iterations: iteration,
                tool_calls_made,
                total_usage,
                truncated: false,
            });
        }

        // Append the assistant turn (with tool_use records) and persist it.
        messages.push(Message {
            role: Role::Assistant,
            content: response.content.clone(),
            raw_content: response.raw_blocks.clone(),
        });
        persist(
            &ctx,
            MessageRole::Assistant,
            NewMessage {
                branch: Some(ctx.branch_id as i64),
                content: (!text.is_empty()).then_some(text),
                tool_calls: Some(serde_json::to_value(&tool_calls)?),
                ..Default::default()
            },
        )
        .await;

        // Server-side calls were already executed by the vendor; only
        // registry tools run locally.
        let local_calls: Vec<ToolCall> = tool_calls
            .iter()
            .filter(|call| {
                registry.get(&call.name).is_some() || response.raw_blocks.is_none()
            })
            .cloned()
            .collect();

        let decisions: Vec<(ToolCall, Option<Arc<dyn Tool>>, Decision, String)> = local_calls
            .into_iter()
            .map(|call| {
                let tool = registry.get(&call.name);
                let (action, decision) = match &tool {
                    Some(tool) => {
                        let action = format_action(&call.name, &tool.detail(&call.input));
                        let decision = decide(&action, &ctx.profile);
                        (action, decision)
                    }
                    // Unknown tools never execute; the decision is moot.
                    None => (format_action(&call.name, ""), Decision::Deny),
                };
                (call, tool, decision, action)
            })
            .collect();

        let any_ask = decisions
            .iter()
            .any(|(_, tool, decision, _)| tool.is_some() && *decision == Decision::Ask);

        let results: Vec<ToolResult> = if any_ask {
            // Approval prompts must serialize, so the whole batch runs
            // sequentially.
            let mut results = Vec::with_capacity(decisions.len());
            for (call, tool, decision, action) in decisions {
                results.push(
                    handle_call(&ctx, call, tool, decision, action, ask, on_event.clone()).await,
                );
            }
            results
        } else {
            execute_parallel(&ctx, decisions, on_event.clone()).await
        };

        tool_calls_made += results.len();
        for result in &results {
            persist(
                &ctx,
                MessageRole::ToolResult,
                NewMessage {
                    branch: Some(ctx.branch_id as i64),
                    content: Some(result.content.clone()),
                    tool_call_id: Some(result.tool_use_id.clone()),
                    ..Default::default()
                },
            )
            .await;
        }
        if !results.is_empty() {
            messages.push(Message::tool_results(results));
        }
    }

    emit(
        on_event.as_ref(),
        LoopEvent::LoopComplete {
            agent: ctx.agent.clone(),
            branch: ctx.branch_id,
            iterations: config.max_iterations,
            tool_calls_made,
            total_usage,
            truncated: true,
        },
    );
    let marker = format!(
        "Stopped after max iterations ({}). The task may be incomplete.",
        config.max_iterations
    );
    Ok(LoopResult {
        content: if last_text.is_empty() {
            marker
        } else {
            format!("{last_text}\n\n{marker}")
        },
        iterations: config.max_iterations,
        tool_calls_made,
        total_usage,
        truncated: true,
    })
}

/// Execute a homogeneous (no-ASK) batch in parallel, joining results back
/// into call order so tool_result order matches tool_use order.
async fn execute_parallel(
    ctx: &Arc<ExecContext>,
    decisions: Vec<(ToolCall, Option<Arc<dyn Tool>>, Decision, String)>,
    on_event: Option<Arc<OnEvent>>,
) -> Vec<ToolResult> {
    let call_ids: Vec<String> = decisions.iter().map(|(c, ..)| c.id.clone()).collect();
    let mut join_set = JoinSet::new();

    for (idx, (call, tool, decision, action)) in decisions.into_iter().enumerate() {
        let ctx = ctx.clone();
        let on_event = on_event.clone();
        join_set.spawn(async move {
            let result = handle_call(&ctx, call, tool, decision, action, None, on_event).await;
            (idx, result)
        });
    }

    let mut slots: Vec<Option<ToolResult>> = call_ids.iter().map(|_| None).collect();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((idx, result)) => slots[idx] = Some(result),
            Err(e) => warn!(error = %e, "tool task panicked"),
        }
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(idx, slot)| {
            slot.unwrap_or_else(|| {
                ToolResult::error(
                    call_ids[idx].clone(),
                    Error::Agent("tool execution panicked".into()).to_tool_payload(),
                )
            })
        })
        .collect()
}

/// Handle a single tool call: permission gate, optional ask, execution.
async fn handle_call(
    ctx: &Arc<ExecContext>,
    call: ToolCall,
    tool: Option<Arc<dyn Tool>>,
    decision: Decision,
    action: String,
    ask: Option<&AskFn>,
    on_event: Option<Arc<OnEvent>>,
) -> ToolResult {
    let Some(tool) = tool else {
        return ToolResult::error(
            call.id,
            Error::UnknownTool(call.name.clone()).to_tool_payload(),
        );
    };

    match decision {
        Decision::Deny => {
            audit_decision(ctx, &action, "deny", "").await;
            ToolResult::error(call.id, Error::PermissionDenied(action).to_tool_payload())
        }
        Decision::Ask => {
            begin_step(ctx, &format!("Awaiting permission: {action}"));
            set_branch_status(ctx, BranchStatus::WaitingForPermission);

            let outcome = match ask {
                Some(ask) => {
                    ask(AskRequest {
                        agent: ctx.agent.clone(),
                        branch: ctx.branch_id,
                        action: action.clone(),
                        tool: call.name.clone(),
                        arguments: call.input.to_string(),
                    })
                    .await
                }
                None => AskOutcome::Denied,
            };
            set_branch_status(ctx, BranchStatus::Running);
            emit(
                on_event.as_ref(),
                LoopEvent::PermissionAsk {
                    agent: ctx.agent.clone(),
                    branch: ctx.branch_id,
                    action: action.clone(),
                    approved: outcome == AskOutcome::Approved,
                },
            );

            match outcome {
                AskOutcome::Approved => {
                    audit_decision(ctx, &action, "ask", "approved").await;
                    execute_tool(ctx, call, tool, &action, on_event).await
                }
                AskOutcome::Denied => {
                    audit_decision(ctx, &action, "ask", "denied").await;
                    ToolResult::error(call.id, Error::PermissionDenied(action).to_tool_payload())
                }
                AskOutcome::TimedOut => {
                    audit_decision(ctx, &action, "ask", "timeout").await;
                    ToolResult::error(call.id, Error::AskTimeout(action).to_tool_payload())
                }
            }
        }
        Decision::Allow => {
            audit_decision(ctx, &action, "allow", "").await;
            execute_tool(ctx, call, tool, &action, on_event).await
        }
    }
}

async fn execute_tool(
    ctx: &Arc<ExecContext>,
    call: ToolCall,
    tool: Arc<dyn Tool>,
    action: &str,
    on_event: Option<Arc<OnEvent>>,
) -> ToolResult {
    let detail = action.splitn(3, ':').nth(2).unwrap_or_default();
    begin_step(
        ctx,
        &format!("Executing {}: {}", call.name, summarize_args(detail)),
    );
    emit(
        on_event.as_ref(),
        LoopEvent::ToolCallStart {
            agent: ctx.agent.clone(),
            branch: ctx.branch_id,
            tool: call.name.clone(),
            tool_call_id: call.id.clone(),
            action: action.to_string(),
        },
    );

    let started = Instant::now();
    let result = match tool.execute(ctx.clone(), call.input).await {
        Ok(output) if output.is_error => ToolResult::error(call.id.clone(), output.content),
        Ok(output) => ToolResult::success(call.id.clone(), output.content),
        Err(e) => {
            warn!(agent = %ctx.agent, tool = %call.name, error = %e, "tool handler failed");
            ToolResult::error(call.id.clone(), e.to_tool_payload())
        }
    };

    emit(
        on_event.as_ref(),
        LoopEvent::ToolCallComplete {
            agent: ctx.agent.clone(),
            branch: ctx.branch_id,
            tool: call.name,
            tool_call_id: result.tool_use_id.clone(),
            is_error: result.is_error,
            duration_ms: started.elapsed().as_millis() as u64,
        },
    );
    result
}
