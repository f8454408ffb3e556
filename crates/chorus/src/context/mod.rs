//! Rolling context window — persisted messages, clear markers, snapshots.
//!
//! The window is never materialized: every read queries messages newer
//! than `max(last_clear, now − window)`. Clearing advances the marker and
//! deletes nothing.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::branch::{BranchManager, build_branch_status};
use crate::error::Error;
use crate::llm::LlmProvider;
use crate::llm::types::{ChatRequest, ContentBlock, Message, Role};
use crate::process::manager::ProcessManager;
use crate::store::{MessageRole, NewMessage, SessionMeta, Store, now_iso, to_iso};

/// Budget for snapshot summary generation before the placeholder is used.
const SUMMARY_TIMEOUT: Duration = Duration::from_secs(10);
const SUMMARY_FAILED: &str = "(summary generation failed)";

/// Generates the 2–4 sentence snapshot summary.
pub trait Summarizer: Send + Sync {
    fn summarize(
        &self,
        transcript: String,
    ) -> Pin<Box<dyn Future<Output = Result<String, Error>> + Send + '_>>;
}

/// Summarizer backed by a (typically cheap) provider.
pub struct ProviderSummarizer<P: LlmProvider> {
    provider: Arc<P>,
}

impl<P: LlmProvider> ProviderSummarizer<P> {
    pub fn new(provider: Arc<P>) -> Self {
        Self { provider }
    }
}

impl<P: LlmProvider> Summarizer for ProviderSummarizer<P> {
    fn summarize(
        &self,
        transcript: String,
    ) -> Pin<Box<dyn Future<Output = Result<String, Error>> + Send + '_>> {
        Box::pin(async move {
            let request = ChatRequest {
                system: "Summarize this conversation in 2-4 sentences. Focus on what was \
                         done, key decisions, and any unfinished work."
                    .into(),
                messages: vec![Message::user(transcript)],
                tools: vec![],
                max_tokens: 512,
                cache: false,
            };
            let response = self.provider.chat(request).await?;
            Ok(response.text())
        })
    }
}

/// One message inside a session snapshot file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub timestamp: String,
}

/// The session snapshot file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub timestamp: String,
    pub description: String,
    pub summary: String,
    pub message_count: usize,
    pub window_start: String,
    pub window_end: String,
    pub messages: Vec<SnapshotMessage>,
}

/// Rolling-window context manager for a single agent.
pub struct ContextStore {
    agent: String,
    store: Arc<Store>,
    sessions_dir: PathBuf,
    window_seconds: i64,
}

impl ContextStore {
    pub fn new(
        agent: impl Into<String>,
        store: Arc<Store>,
        sessions_dir: PathBuf,
        window_seconds: i64,
    ) -> Self {
        Self {
            agent: agent.into(),
            store,
            sessions_dir,
            window_seconds,
        }
    }

    /// Append a message; returns (row id, assigned timestamp).
    pub async fn persist(
        &self,
        role: MessageRole,
        message: NewMessage,
    ) -> Result<(i64, String), Error> {
        self.store.persist_message(&self.agent, role, message).await
    }

    /// The effective window cutoff: `max(last_clear, now − window)`.
    async fn cutoff(&self) -> Result<String, Error> {
        let rolling_start = to_iso(Utc::now() - chrono::Duration::seconds(self.window_seconds));
        let last_clear = self.store.last_clear_time(&self.agent).await?;
        Ok(match last_clear {
            Some(clear) if clear > rolling_start => clear,
            _ => rolling_start,
        })
    }

    /// Messages inside the rolling window, optionally scoped to a branch.
    pub async fn get_window(
        &self,
        branch: Option<i64>,
    ) -> Result<Vec<crate::store::StoredMessage>, Error> {
        let cutoff = self.cutoff().await?;
        self.store.messages_since(&self.agent, branch, &cutoff).await
    }

    /// Advance the clear marker to now. No rows are deleted.
    pub async fn clear(&self) -> Result<(), Error> {
        let now = now_iso();
        self.store.set_last_clear_time(&self.agent, &now).await?;
        info!(agent = %self.agent, at = %now, "cleared context");
        Ok(())
    }

    /// Save the current window to a session file plus an index row.
    ///
    /// Summary failure (or timeout) degrades to a placeholder; it never
    /// fails the snapshot.
    pub async fn snapshot(
        &self,
        description: &str,
        summarizer: Option<&dyn Summarizer>,
    ) -> Result<SessionMeta, Error> {
        let messages = self.get_window(None).await?;
        let now = now_iso();
        let session_id = Uuid::new_v4().to_string();

        let window_start = messages
            .first()
            .map(|m| m.timestamp.clone())
            .unwrap_or_else(|| now.clone());
        let window_end = messages
            .last()
            .map(|m| m.timestamp.clone())
            .unwrap_or_else(|| now.clone());

        let summary = match summarizer {
            Some(summarizer) => {
                let transcript = messages
                    .iter()
                    .filter_map(|m| {
                        m.content
                            .as_ref()
                            .map(|c| format!("{}: {c}", m.role.as_str()))
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                match tokio::time::timeout(SUMMARY_TIMEOUT, summarizer.summarize(transcript)).await
                {
                    Ok(Ok(summary)) => summary,
                    Ok(Err(e)) => {
                        warn!(agent = %self.agent, error = %e, "snapshot summary failed");
                        SUMMARY_FAILED.into()
                    }
                    Err(_) => {
                        warn!(agent = %self.agent, "snapshot summary timed out");
                        SUMMARY_FAILED.into()
                    }
                }
            }
            None => String::new(),
        };

        let snapshot = SessionSnapshot {
            session_id: session_id.clone(),
            timestamp: now.clone(),
            description: description.to_string(),
            summary: summary.clone(),
            message_count: messages.len(),
            window_start: window_start.clone(),
            window_end: window_end.clone(),
            messages: messages
                .iter()
                .map(|m| SnapshotMessage {
                    role: m.role.as_str().to_string(),
                    content: m.content.clone(),
                    tool_calls: m.tool_calls.clone(),
                    tool_call_id: m.tool_call_id.clone(),
                    timestamp: m.timestamp.clone(),
                })
                .collect(),
        };

        std::fs::create_dir_all(&self.sessions_dir).map_err(|e| {
            Error::Store(format!(
                "failed to create {}: {e}",
                self.sessions_dir.display()
            ))
        })?;
        let file_path = self.sessions_dir.join(format!("{session_id}.json"));
        std::fs::write(&file_path, serde_json::to_string_pretty(&snapshot)?)
            .map_err(|e| Error::Store(format!("failed to write session file: {e}")))?;

        let meta = SessionMeta {
            session_id,
            agent: self.agent.clone(),
            timestamp: now,
            description: description.to_string(),
            summary,
            message_count: messages.len() as i64,
            file_path: file_path.display().to_string(),
            window_start,
            window_end,
        };
        self.store.save_session(&meta).await?;
        info!(
            agent = %self.agent,
            session = %meta.session_id,
            messages = meta.message_count,
            "saved session snapshot"
        );
        Ok(meta)
    }

    pub async fn list_snapshots(&self, limit: i64) -> Result<Vec<SessionMeta>, Error> {
        self.store.list_sessions(&self.agent, limit).await
    }

    /// Re-insert a snapshot's messages with fresh timestamps so they
    /// re-enter the rolling window.
    pub async fn restore(&self, session_id: &str) -> Result<usize, Error> {
        let meta = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| Error::Store(format!("session {session_id:?} not found")))?;

        let content = std::fs::read_to_string(&meta.file_path).map_err(|e| {
            Error::Store(format!("session file {} unreadable: {e}", meta.file_path))
        })?;
        let snapshot: SessionSnapshot = serde_json::from_str(&content)?;

        for message in &snapshot.messages {
            let role = MessageRole::parse(&message.role)?;
            self.persist(
                role,
                NewMessage {
                    branch: None,
                    content: message.content.clone(),
                    tool_calls: message.tool_calls.clone(),
                    tool_call_id: message.tool_call_id.clone(),
                    outbound_message_id: None,
                },
            )
            .await?;
        }
        info!(
            agent = %self.agent,
            session = session_id,
            messages = snapshot.messages.len(),
            "restored session snapshot"
        );
        Ok(snapshot.messages.len())
    }
}

/// Convert window rows into wire messages.
///
/// Tool results merge into single user messages; tool results orphaned by
/// the window cutoff (no preceding assistant tool_use) are dropped so the
/// wire stays valid.
pub fn window_to_messages(rows: &[crate::store::StoredMessage]) -> Vec<Message> {
    let mut messages: Vec<Message> = Vec::new();
    let mut seen_tool_use = false;

    for row in rows {
        match row.role {
            MessageRole::User => {
                messages.push(Message::user(row.content.clone().unwrap_or_default()));
            }
            MessageRole::Assistant | MessageRole::ToolUse => {
                let mut content = Vec::new();
                if let Some(text) = &row.content
                    && !text.is_empty()
                {
                    content.push(ContentBlock::Text { text: text.clone() });
                }
                if let Some(calls) = &row.tool_calls
                    && let Some(calls) = calls.as_array()
                {
                    for call in calls {
                        content.push(ContentBlock::ToolUse {
                            id: call["id"].as_str().unwrap_or_default().to_string(),
                            name: call["name"].as_str().unwrap_or_default().to_string(),
                            input: call.get("input").cloned().unwrap_or(serde_json::Value::Null),
                        });
                    }
                    seen_tool_use = true;
                }
                if !content.is_empty() {
                    messages.push(Message {
                        role: Role::Assistant,
                        content,
                        raw_content: None,
                    });
                }
            }
            MessageRole::ToolResult => {
                if !seen_tool_use {
                    continue;
                }
                let block = ContentBlock::ToolResult {
                    tool_use_id: row.tool_call_id.clone().unwrap_or_default(),
                    content: row.content.clone().unwrap_or_default(),
                    is_error: false,
                };
                match messages.last_mut() {
                    Some(Message {
                        role: Role::User,
                        content,
                        ..
                    }) if content
                        .iter()
                        .all(|b| matches!(b, ContentBlock::ToolResult { .. })) =>
                    {
                        content.push(block);
                    }
                    _ => messages.push(Message {
                        role: Role::User,
                        content: vec![block],
                        raw_content: None,
                    }),
                }
            }
        }
    }
    messages
}

/// Assemble the system text for a branch's LLM calls: agent prompt, docs,
/// and the live preamble (sibling branches, running processes).
pub fn build_system_text(
    system_prompt: &str,
    docs: &str,
    branch_id: u64,
    branches: &BranchManager,
    processes: Option<&ProcessManager>,
) -> String {
    let mut parts = vec![system_prompt.to_string()];

    if !docs.is_empty() {
        parts.push(format!("## Agent Documentation\n\n{docs}"));
    }

    let branch_block = build_branch_status(branches, branch_id);
    if branch_block != "No active branches." {
        parts.push(branch_block);
    }

    if let Some(pm) = processes {
        let running = pm.list_running(Some(&branches.agent));
        if !running.is_empty() {
            let mut lines = vec!["Running processes:".to_string()];
            for p in running {
                let last = p.last_output_line().unwrap_or_else(|| "(no output)".into());
                lines.push(format!("  PID {}: `{}` — last output: {last}", p.pid, p.command));
            }
            parts.push(lines.join("\n"));
        }
    }

    parts.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoredMessage;
    use serde_json::json;

    async fn ctx(window_seconds: i64) -> (tempfile::TempDir, Arc<Store>, ContextStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let agent = crate::agent::Agent::new("alpha", 42).unwrap();
        store.register_agent(&agent).await.unwrap();
        let cs = ContextStore::new(
            "alpha",
            store.clone(),
            dir.path().join("sessions"),
            window_seconds,
        );
        (dir, store, cs)
    }

    fn user_msg(content: &str) -> NewMessage {
        NewMessage {
            branch: Some(1),
            content: Some(content.into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn window_returns_persisted_messages() {
        let (_dir, _store, cs) = ctx(86_400).await;
        cs.persist(MessageRole::User, user_msg("hello")).await.unwrap();
        cs.persist(MessageRole::Assistant, user_msg("hi")).await.unwrap();

        let window = cs.get_window(Some(1)).await.unwrap();
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].content.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn zero_window_excludes_everything() {
        let (_dir, _store, cs) = ctx(0).await;
        cs.persist(MessageRole::User, user_msg("old")).await.unwrap();
        // With a zero-second window the cutoff is "now"; nothing qualifies
        let window = cs.get_window(None).await.unwrap();
        assert!(window.is_empty());
    }

    #[tokio::test]
    async fn clear_advances_marker_without_deleting() {
        let (_dir, store, cs) = ctx(86_400).await;
        for i in 0..5 {
            cs.persist(MessageRole::User, user_msg(&format!("m{i}"))).await.unwrap();
        }
        assert_eq!(cs.get_window(None).await.unwrap().len(), 5);

        cs.clear().await.unwrap();
        assert!(cs.get_window(None).await.unwrap().is_empty());
        // Rows survive the clear
        assert_eq!(store.message_count("alpha").await.unwrap(), 5);

        // New messages re-enter the window
        cs.persist(MessageRole::User, user_msg("after clear")).await.unwrap();
        let window = cs.get_window(None).await.unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].content.as_deref(), Some("after clear"));
    }

    struct FixedSummarizer(&'static str);

    impl Summarizer for FixedSummarizer {
        fn summarize(
            &self,
            _transcript: String,
        ) -> Pin<Box<dyn Future<Output = Result<String, Error>> + Send + '_>> {
            let text = self.0;
            Box::pin(async move { Ok(text.to_string()) })
        }
    }

    struct FailingSummarizer;

    impl Summarizer for FailingSummarizer {
        fn summarize(
            &self,
            _transcript: String,
        ) -> Pin<Box<dyn Future<Output = Result<String, Error>> + Send + '_>> {
            Box::pin(async { Err(Error::Agent("model unavailable".into())) })
        }
    }

    #[tokio::test]
    async fn snapshot_then_restore_preserves_content() {
        let (_dir, _store, cs) = ctx(86_400).await;
        cs.persist(MessageRole::User, user_msg("question")).await.unwrap();
        cs.persist(MessageRole::Assistant, user_msg("answer")).await.unwrap();

        let meta = cs
            .snapshot("before clear", Some(&FixedSummarizer("Talked about things.")))
            .await
            .unwrap();
        assert_eq!(meta.message_count, 2);
        assert_eq!(meta.summary, "Talked about things.");
        assert!(std::path::Path::new(&meta.file_path).exists());

        // Clear, then restore brings the content back into the window
        cs.clear().await.unwrap();
        assert!(cs.get_window(None).await.unwrap().is_empty());

        let restored = cs.restore(&meta.session_id).await.unwrap();
        assert_eq!(restored, 2);
        let window = cs.get_window(None).await.unwrap();
        let contents: Vec<_> = window.iter().filter_map(|m| m.content.clone()).collect();
        assert_eq!(contents, vec!["question", "answer"]);
    }

    #[tokio::test]
    async fn snapshot_summary_failure_uses_placeholder() {
        let (_dir, _store, cs) = ctx(86_400).await;
        cs.persist(MessageRole::User, user_msg("hello")).await.unwrap();

        let meta = cs.snapshot("", Some(&FailingSummarizer)).await.unwrap();
        assert_eq!(meta.summary, SUMMARY_FAILED);
    }

    #[tokio::test]
    async fn snapshot_file_matches_contract() {
        let (_dir, _store, cs) = ctx(86_400).await;
        cs.persist(MessageRole::User, user_msg("hello")).await.unwrap();
        let meta = cs.snapshot("desc", None).await.unwrap();

        let content = std::fs::read_to_string(&meta.file_path).unwrap();
        let snapshot: SessionSnapshot = serde_json::from_str(&content).unwrap();
        assert_eq!(snapshot.session_id, meta.session_id);
        assert_eq!(snapshot.description, "desc");
        assert_eq!(snapshot.message_count, 1);
        assert_eq!(snapshot.messages[0].role, "user");
        assert_eq!(snapshot.messages[0].content.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn list_snapshots_survives_clear() {
        let (_dir, _store, cs) = ctx(86_400).await;
        cs.persist(MessageRole::User, user_msg("hello")).await.unwrap();
        cs.snapshot("one", None).await.unwrap();
        cs.clear().await.unwrap();
        assert_eq!(cs.list_snapshots(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn restore_unknown_session_errors() {
        let (_dir, _store, cs) = ctx(86_400).await;
        assert!(cs.restore("missing").await.is_err());
    }

    // -- window_to_messages --------------------------------------------------

    fn row(role: MessageRole, content: Option<&str>) -> StoredMessage {
        StoredMessage {
            id: 0,
            agent: "alpha".into(),
            branch: Some(1),
            role,
            content: content.map(|s| s.to_string()),
            tool_calls: None,
            tool_call_id: None,
            timestamp: now_iso(),
            outbound_message_id: None,
        }
    }

    #[test]
    fn assistant_tool_calls_become_blocks() {
        let mut assistant = row(MessageRole::Assistant, Some("checking"));
        assistant.tool_calls = Some(json!([
            {"id": "c1", "name": "view", "input": {"path": "a.md"}}
        ]));
        let mut result = row(MessageRole::ToolResult, Some("file contents"));
        result.tool_call_id = Some("c1".into());

        let messages = window_to_messages(&[row(MessageRole::User, Some("look")), assistant, result]);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content.len(), 2);
        match &messages[2].content[0] {
            ContentBlock::ToolResult { tool_use_id, .. } => assert_eq!(tool_use_id, "c1"),
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    #[test]
    fn orphan_tool_results_are_dropped() {
        let mut orphan = row(MessageRole::ToolResult, Some("stale"));
        orphan.tool_call_id = Some("c0".into());
        let messages = window_to_messages(&[orphan, row(MessageRole::User, Some("hi"))]);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
    }

    #[test]
    fn consecutive_tool_results_merge() {
        let mut assistant = row(MessageRole::Assistant, None);
        assistant.tool_calls = Some(json!([
            {"id": "c1", "name": "view", "input": {}},
            {"id": "c2", "name": "view", "input": {}}
        ]));
        let mut r1 = row(MessageRole::ToolResult, Some("one"));
        r1.tool_call_id = Some("c1".into());
        let mut r2 = row(MessageRole::ToolResult, Some("two"));
        r2.tool_call_id = Some("c2".into());

        let messages = window_to_messages(&[assistant, r1, r2]);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content.len(), 2);
    }
}
