//! Live status feedback — snapshot rendering, throttled status cards,
//! outbound chunking, the per-channel rate-limited sender, and the
//! debounced presence aggregator.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::warn;

use crate::channel::{CardTone, ChannelId, ChatGateway, MessageId, OutboundMessage, StatusCard};
use crate::error::Error;
use crate::llm::types::Usage;

/// Minimum interval between status card edits.
pub const EDIT_THROTTLE: Duration = Duration::from_millis(1500);

/// Outbound channel rate limit: at most 5 sends per rolling 5 seconds.
pub const RATE_LIMIT_MAX: usize = 5;
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(5);

/// Presence updates are debounced to one per 5 seconds.
pub const PRESENCE_DEBOUNCE: Duration = Duration::from_secs(5);

/// Point-in-time snapshot of a running branch's status.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub agent: String,
    pub branch_id: u64,
    /// "processing", "waiting", "completed", "error", "cancelled"
    pub status: String,
    pub step_number: u32,
    pub current_step: String,
    pub token_usage: Usage,
    pub llm_iterations: usize,
    pub tool_calls_made: usize,
    pub elapsed_ms: i64,
    pub error_message: Option<String>,
    pub response_content: Option<String>,
}

impl StatusSnapshot {
    pub fn new(agent: impl Into<String>, branch_id: u64) -> Self {
        Self {
            agent: agent.into(),
            branch_id,
            status: "processing".into(),
            step_number: 0,
            current_step: "Starting".into(),
            token_usage: Usage::default(),
            llm_iterations: 0,
            tool_calls_made: 0,
            elapsed_ms: 0,
            error_message: None,
            response_content: None,
        }
    }
}

/// Render a snapshot as a status card.
///
/// Two modes: in-progress (title carries agent and branch, description
/// carries step + metrics) and finalized-with-response (description is the
/// response, footer carries the metrics).
pub fn build_status_card(snapshot: &StatusSnapshot) -> StatusCard {
    let tone = match snapshot.status.as_str() {
        "error" | "cancelled" => CardTone::Error,
        _ => CardTone::Info,
    };
    let elapsed_s = snapshot.elapsed_ms as f64 / 1000.0;
    let tokens = format!(
        "{} in / {} out",
        snapshot.token_usage.input_tokens, snapshot.token_usage.output_tokens
    );

    if let Some(content) = &snapshot.response_content {
        let mut description = content.clone();
        if let Some(error) = &snapshot.error_message {
            description.push_str(&format!("\n**Error:** {error}"));
        }
        return StatusCard {
            title: snapshot.agent.clone(),
            description,
            footer: Some(format!(
                "branch #{} · {} steps · {tokens} · {elapsed_s:.1}s",
                snapshot.branch_id, snapshot.step_number
            )),
            tone,
        };
    }

    let status_label = {
        let mut label = snapshot.status.clone();
        if let Some(first) = label.get_mut(..1) {
            first.make_ascii_uppercase();
        }
        label
    };
    let line1 = if matches!(snapshot.status.as_str(), "completed" | "error" | "cancelled") {
        format!("**{status_label}** · {} steps", snapshot.step_number)
    } else if snapshot.step_number > 0 {
        format!(
            "**{status_label}** · Step {}: {}",
            snapshot.step_number, snapshot.current_step
        )
    } else {
        format!("**{status_label}** · {}", snapshot.current_step)
    };

    let mut parts = vec![tokens];
    if snapshot.llm_iterations > 0 {
        let calls = if snapshot.llm_iterations == 1 { "call" } else { "calls" };
        parts.push(format!("{} {calls}", snapshot.llm_iterations));
    }
    if snapshot.tool_calls_made > 0 {
        parts.push(format!("{} tools", snapshot.tool_calls_made));
    }
    parts.push(format!("{elapsed_s:.1}s"));
    let mut description = format!("{line1}\n{}", parts.join(" · "));
    if let Some(error) = &snapshot.error_message {
        description.push_str(&format!("\n**Error:** {error}"));
    }

    StatusCard {
        title: format!("{} · branch #{}", snapshot.agent, snapshot.branch_id),
        description,
        footer: None,
        tone,
    }
}

// ---------------------------------------------------------------------------
// Chunking
// ---------------------------------------------------------------------------

/// Split outbound text into chunks within `limit` bytes each.
///
/// Preferred split points, in order: paragraph boundary, line boundary,
/// sentence boundary, hard cut at a char boundary. Splits never land
/// inside a fenced code block — the fence is closed at the chunk edge and
/// reopened in the next chunk.
pub fn chunk_message(text: &str, limit: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    if text.len() <= limit {
        return vec![text.to_string()];
    }

    // Reserve room for a closing fence we may need to append.
    let effective = limit.saturating_sub(4).max(8);
    let mut chunks = Vec::new();
    let mut remaining = text.to_string();
    let mut reopen_fence: Option<String> = None;

    while !remaining.is_empty() {
        let mut current = match &reopen_fence {
            Some(fence) => format!("{fence}\n{remaining}"),
            None => remaining.clone(),
        };
        reopen_fence = None;

        if current.len() <= limit {
            chunks.push(current);
            break;
        }

        let split_at = find_split_point(&current, effective);
        let mut chunk = current[..split_at].to_string();
        current = current[split_at..].trim_start_matches('\n').to_string();

        // A split inside an open fence closes it here and reopens it in
        // the next chunk.
        if let Some(fence) = open_fence(&chunk) {
            chunk.push_str("\n```");
            reopen_fence = Some(fence);
        }
        chunks.push(chunk);
        remaining = current;
    }

    chunks
}

/// Chunk a final response, appending the footer only to the last chunk.
pub fn chunk_with_footer(text: &str, footer: &str, limit: usize) -> Vec<String> {
    let mut chunks = chunk_message(text, limit.saturating_sub(footer.len() + 2));
    if footer.is_empty() {
        return chunks;
    }
    match chunks.last_mut() {
        Some(last) => {
            last.push_str("\n\n");
            last.push_str(footer);
        }
        None => chunks.push(footer.to_string()),
    }
    chunks
}

/// The open fence marker (e.g. "```rust") if `text` ends inside a fenced
/// code block.
fn open_fence(text: &str) -> Option<String> {
    let mut fence: Option<String> = None;
    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            fence = match fence {
                Some(_) => None,
                None => Some(trimmed.to_string()),
            };
        }
    }
    fence
}

fn find_split_point(text: &str, max_len: usize) -> usize {
    let safe_len = floor_char_boundary(text, max_len);
    let region = &text[..safe_len];

    // Paragraph boundary, but never inside a code fence
    if let Some(pos) = rfind_outside_fence(region, "\n\n") {
        return pos + 1;
    }
    // Line boundary
    if let Some(pos) = rfind_outside_fence(region, "\n") {
        return pos + 1;
    }
    // Sentence boundary
    for delim in [". ", "! ", "? "] {
        if let Some(pos) = region.rfind(delim)
            && pos > 0
        {
            return pos + delim.len();
        }
    }
    safe_len
}

/// Rightmost occurrence of `needle` in `region` that is not inside an open
/// code fence.
fn rfind_outside_fence(region: &str, needle: &str) -> Option<usize> {
    let mut best: Option<usize> = None;
    let mut search_from = 0;
    while let Some(rel) = region[search_from..].find(needle) {
        let pos = search_from + rel;
        if pos > 0 && open_fence(&region[..pos]).is_none() {
            best = Some(pos);
        }
        search_from = pos + needle.len();
    }
    best
}

pub(crate) fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut i = max;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

// ---------------------------------------------------------------------------
// LiveStatusView — throttled status card editor
// ---------------------------------------------------------------------------

struct ViewState {
    snapshot: StatusSnapshot,
    message_id: Option<MessageId>,
    last_edit: Option<Instant>,
    pending: bool,
    started: Instant,
}

/// One live status card per branch: initial send at start, throttled edits
/// while running, a final edit on terminal state that bypasses the
/// throttle.
pub struct LiveStatusView {
    gateway: Arc<dyn ChatGateway>,
    channel: ChannelId,
    reply_to: Option<MessageId>,
    throttle: Duration,
    state: Arc<AsyncMutex<ViewState>>,
}

impl LiveStatusView {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        channel: ChannelId,
        agent: impl Into<String>,
        branch_id: u64,
        reply_to: Option<MessageId>,
    ) -> Self {
        Self {
            gateway,
            channel,
            reply_to,
            throttle: EDIT_THROTTLE,
            state: Arc::new(AsyncMutex::new(ViewState {
                snapshot: StatusSnapshot::new(agent, branch_id),
                message_id: None,
                last_edit: None,
                pending: false,
                started: Instant::now(),
            })),
        }
    }

    #[cfg(test)]
    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    /// The underlying message id (None until `start` succeeds).
    pub async fn message_id(&self) -> Option<MessageId> {
        self.state.lock().await.message_id
    }

    /// Send the initial status card.
    pub async fn start(&self) -> Option<MessageId> {
        let mut state = self.state.lock().await;
        let card = build_status_card(&state.snapshot);
        let message = OutboundMessage {
            text: String::new(),
            card: Some(card),
            reply_to: self.reply_to,
        };
        match self.gateway.send(self.channel, message).await {
            Ok(id) => {
                state.message_id = Some(id);
                state.last_edit = Some(Instant::now());
                Some(id)
            }
            Err(e) => {
                warn!(error = %e, "failed to send status card");
                None
            }
        }
    }

    /// Merge changes into the snapshot and schedule a throttled edit.
    pub async fn update(&self, apply: impl FnOnce(&mut StatusSnapshot)) {
        let mut state = self.state.lock().await;
        apply(&mut state.snapshot);
        state.snapshot.elapsed_ms = state.started.elapsed().as_millis() as i64;
        if state.message_id.is_none() {
            return;
        }

        let due = state
            .last_edit
            .is_none_or(|last| last.elapsed() >= self.throttle);
        if due {
            self.do_edit(&mut state).await;
        } else if !state.pending {
            // Batch intervening updates into one deferred edit.
            state.pending = true;
            let delay = self
                .throttle
                .saturating_sub(state.last_edit.expect("checked above").elapsed());
            let view_state = self.state.clone();
            let gateway = self.gateway.clone();
            let channel = self.channel;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let mut state = view_state.lock().await;
                if !state.pending {
                    return;
                }
                state.pending = false;
                let Some(message_id) = state.message_id else { return };
                let card = build_status_card(&state.snapshot);
                if let Err(e) = gateway
                    .edit(channel, message_id, OutboundMessage::card(card))
                    .await
                {
                    warn!(error = %e, "failed to edit status card");
                } else {
                    state.last_edit = Some(Instant::now());
                }
            });
        }
    }

    /// Final edit — always happens regardless of the throttle.
    pub async fn finalize(
        &self,
        status: &str,
        error: Option<String>,
        response_content: Option<String>,
    ) {
        let mut state = self.state.lock().await;
        state.pending = false;
        state.snapshot.status = status.to_string();
        state.snapshot.error_message = error;
        state.snapshot.response_content = response_content;
        state.snapshot.elapsed_ms = state.started.elapsed().as_millis() as i64;
        if state.message_id.is_some() {
            self.do_edit(&mut state).await;
        }
    }

    async fn do_edit(&self, state: &mut ViewState) {
        let Some(message_id) = state.message_id else { return };
        let card = build_status_card(&state.snapshot);
        if let Err(e) = self
            .gateway
            .edit(self.channel, message_id, OutboundMessage::card(card))
            .await
        {
            warn!(error = %e, "failed to edit status card");
        } else {
            state.last_edit = Some(Instant::now());
        }
    }
}

// ---------------------------------------------------------------------------
// RateLimitedSender — per-channel outbound queue
// ---------------------------------------------------------------------------

/// Sends outbound messages while respecting the channel rate limit
/// (≤5 sends per rolling 5 s). Senders queue on a per-channel FIFO lock,
/// so concurrent branches drain in arrival order.
pub struct RateLimitedSender {
    gateway: Arc<dyn ChatGateway>,
    max_per_window: usize,
    window: Duration,
    channels: Mutex<HashMap<ChannelId, Arc<AsyncMutex<VecDeque<Instant>>>>>,
}

impl RateLimitedSender {
    pub fn new(gateway: Arc<dyn ChatGateway>) -> Self {
        Self::with_limits(gateway, RATE_LIMIT_MAX, RATE_LIMIT_WINDOW)
    }

    pub fn with_limits(
        gateway: Arc<dyn ChatGateway>,
        max_per_window: usize,
        window: Duration,
    ) -> Self {
        Self {
            gateway,
            max_per_window,
            window,
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn channel_state(&self, channel: ChannelId) -> Arc<AsyncMutex<VecDeque<Instant>>> {
        self.channels
            .lock()
            .expect("channels lock")
            .entry(channel)
            .or_insert_with(|| Arc::new(AsyncMutex::new(VecDeque::new())))
            .clone()
    }

    /// Send one message, waiting for a rate-limit slot first.
    pub async fn send(
        &self,
        channel: ChannelId,
        message: OutboundMessage,
    ) -> Result<MessageId, Error> {
        let state = self.channel_state(channel);
        let mut sends = state.lock().await;

        loop {
            let now = Instant::now();
            while let Some(&front) = sends.front() {
                if now.duration_since(front) >= self.window {
                    sends.pop_front();
                } else {
                    break;
                }
            }
            if sends.len() < self.max_per_window {
                break;
            }
            let wait = self.window - now.duration_since(*sends.front().expect("nonempty"));
            tokio::time::sleep(wait).await;
        }

        sends.push_back(Instant::now());
        // Holding the channel lock through the send keeps ordering strict.
        self.gateway.send(channel, message).await
    }
}

// ---------------------------------------------------------------------------
// PresenceTracker — debounced activity aggregation
// ---------------------------------------------------------------------------

struct PresenceState {
    active: HashMap<String, HashSet<u64>>,
    last_update: Option<Instant>,
    deferred: bool,
}

/// Aggregates running branches across all agents into one presence line,
/// debounced to one gateway update per window.
pub struct PresenceTracker {
    gateway: Arc<dyn ChatGateway>,
    debounce: Duration,
    state: Arc<AsyncMutex<PresenceState>>,
}

impl PresenceTracker {
    pub fn new(gateway: Arc<dyn ChatGateway>) -> Arc<Self> {
        Self::with_debounce(gateway, PRESENCE_DEBOUNCE)
    }

    pub fn with_debounce(gateway: Arc<dyn ChatGateway>, debounce: Duration) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            debounce,
            state: Arc::new(AsyncMutex::new(PresenceState {
                active: HashMap::new(),
                last_update: None,
                deferred: false,
            })),
        })
    }

    pub async fn branch_started(self: &Arc<Self>, agent: &str, branch_id: u64) {
        let mut state = self.state.lock().await;
        state.active.entry(agent.to_string()).or_default().insert(branch_id);
        self.schedule(&mut state).await;
    }

    pub async fn branch_finished(self: &Arc<Self>, agent: &str, branch_id: u64) {
        let mut state = self.state.lock().await;
        if let Some(branches) = state.active.get_mut(agent) {
            branches.remove(&branch_id);
            if branches.is_empty() {
                state.active.remove(agent);
            }
        }
        self.schedule(&mut state).await;
    }

    fn presence_text(state: &PresenceState) -> String {
        let tasks: usize = state.active.values().map(|b| b.len()).sum();
        if tasks == 0 {
            "Idle".to_string()
        } else {
            format!("Processing {tasks} task(s) | {} agent(s)", state.active.len())
        }
    }

    async fn schedule(self: &Arc<Self>, state: &mut PresenceState) {
        let due = state
            .last_update
            .is_none_or(|last| last.elapsed() >= self.debounce);
        if due {
            let text = Self::presence_text(state);
            if let Err(e) = self.gateway.set_presence(&text).await {
                warn!(error = %e, "failed to update presence");
            }
            state.last_update = Some(Instant::now());
        } else if !state.deferred {
            state.deferred = true;
            let delay = self
                .debounce
                .saturating_sub(state.last_update.expect("checked above").elapsed());
            let this = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let mut state = this.state.lock().await;
                state.deferred = false;
                let text = Self::presence_text(&state);
                if let Err(e) = this.gateway.set_presence(&text).await {
                    warn!(error = %e, "failed to update presence");
                }
                state.last_update = Some(Instant::now());
            });
        }
    }
}
