// --- Core modules ---
pub mod agent;
pub mod branch;
pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod permission;
pub mod process;
pub mod status;
pub mod store;
pub mod tool;
pub mod workspace;

// --- Error re-exports ---
pub use error::Error;

// --- Config re-exports ---
pub use config::{ChorusHome, GlobalConfig};

// --- Agent re-exports ---
pub use agent::events::{LoopEvent, OnEvent};
pub use agent::tool_loop::{
    AskFn, AskOutcome, AskRequest, LoopResult, ToolLoopConfig, run_tool_loop,
};
pub use agent::{Agent, read_agent_docs, validate_name};

// --- Permission re-exports ---
pub use permission::{
    Decision, PRESET_NAMES, PermissionProfile, ProfileSpec, decide, format_action, preset,
};

// --- Workspace re-exports ---
pub use workspace::Workspace;

// --- LLM re-exports ---
pub use llm::anthropic::AnthropicProvider;
pub use llm::openai::OpenAiProvider;
pub use llm::retry::{RetryConfig, RetryingProvider};
pub use llm::types::{
    ChatRequest, ChatResponse, ContentBlock, Message, Role, StopReason, ToolCall, ToolDefinition,
    ToolResult, Usage,
};
pub use llm::{BoxedProvider, DynLlmProvider, LlmProvider, ProviderKeys, provider_for_model};

// --- Tool re-exports ---
pub use tool::bash::{BashResult, bash_execute};
pub use tool::file_ops::FileResult;
pub use tool::git::GitResult;
pub use tool::{CommBus, ExecContext, Tool, ToolOutput, ToolRegistry, default_registry};

// --- Branch re-exports ---
pub use branch::{
    BranchManager, BranchMetrics, BranchStatus, BranchStep, ExecutionBranch, build_branch_status,
};

// --- Context re-exports ---
pub use context::{
    ContextStore, ProviderSummarizer, SessionSnapshot, Summarizer, build_system_text,
    window_to_messages,
};

// --- Process re-exports ---
pub use process::hooks::{HookCommand, HookDispatcher, SpawnBranchRequest};
pub use process::manager::{ProcessEvents, ProcessManager, RecoveryReport};
pub use process::{
    ExitFilter, HookAction, HookTrigger, ProcessCallback, ProcessStatus, SpawnKind,
    TrackedProcess, TriggerType,
};

// --- Channel re-exports ---
pub use channel::{
    AskBroker, AskPrompt, AskUi, CardTone, ChannelId, ChatGateway, MessageId, OutboundMessage,
    StatusCard,
};

// --- Status re-exports ---
pub use status::{
    LiveStatusView, PresenceTracker, RateLimitedSender, StatusSnapshot, build_status_card,
    chunk_message, chunk_with_footer,
};

// --- Store re-exports ---
pub use store::{
    AuditRecord, MessageRole, NewMessage, SessionMeta, Store, StoredMessage, now_iso,
};

// --- Orchestrator re-exports ---
pub use orchestrator::{InboundMessage, Orchestrator, ProviderFactory};
