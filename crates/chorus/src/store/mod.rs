//! SQLite storage layer — narrow DAO over the persistent schema.
//!
//! Timestamps are stored as fixed-width UTC RFC 3339 text so lexicographic
//! comparison in SQL matches chronological order.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::agent::Agent;
use crate::branch::{BranchStatus, BranchStep, ExecutionBranch};
use crate::error::Error;
use crate::process::{ProcessCallback, ProcessStatus, SpawnKind, TrackedProcess};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS agents (
    name TEXT PRIMARY KEY,
    channel_id INTEGER UNIQUE NOT NULL,
    model TEXT,
    permissions TEXT NOT NULL DEFAULT '"standard"',
    created_at TEXT NOT NULL,
    last_clear_time TEXT,
    window_seconds INTEGER NOT NULL DEFAULT 86400,
    status TEXT NOT NULL DEFAULT 'active'
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent TEXT NOT NULL,
    branch INTEGER,
    role TEXT NOT NULL,
    content TEXT,
    tool_calls TEXT,
    tool_call_id TEXT,
    timestamp TEXT NOT NULL,
    outbound_message_id INTEGER
);

CREATE INDEX IF NOT EXISTS idx_messages_agent_time
    ON messages(agent, timestamp);

CREATE TABLE IF NOT EXISTS branches (
    agent TEXT NOT NULL,
    id INTEGER NOT NULL,
    status TEXT NOT NULL,
    summary TEXT,
    created_at TEXT NOT NULL,
    parent_branch INTEGER,
    recursion_depth INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (agent, id)
);

CREATE TABLE IF NOT EXISTS branch_steps (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent TEXT NOT NULL,
    branch INTEGER NOT NULL,
    step_number INTEGER NOT NULL,
    description TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    duration_ms INTEGER
);

CREATE INDEX IF NOT EXISTS idx_branch_steps_agent_branch
    ON branch_steps(agent, branch);

CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    agent TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    description TEXT,
    summary TEXT,
    message_count INTEGER,
    file_path TEXT NOT NULL,
    window_start TEXT,
    window_end TEXT
);

CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    agent TEXT NOT NULL,
    action_string TEXT NOT NULL,
    decision TEXT NOT NULL,
    user_id INTEGER,
    detail TEXT
);

CREATE TABLE IF NOT EXISTS processes (
    pid INTEGER PRIMARY KEY,
    command TEXT NOT NULL,
    cwd TEXT NOT NULL,
    agent TEXT NOT NULL,
    started_at TEXT NOT NULL,
    type TEXT NOT NULL,
    parent_branch INTEGER,
    stdout_log TEXT,
    stderr_log TEXT,
    status TEXT NOT NULL,
    exit_code INTEGER,
    callbacks TEXT,
    context TEXT,
    recursion_depth INTEGER NOT NULL DEFAULT 0,
    outbound_message_id INTEGER
);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Columns added after the initial schema; applied idempotently so a store
/// created by an older build upgrades in place.
const MIGRATIONS: &[(&str, &str, &str)] = &[
    (
        "agents",
        "window_seconds",
        "ALTER TABLE agents ADD COLUMN window_seconds INTEGER NOT NULL DEFAULT 86400",
    ),
    (
        "processes",
        "outbound_message_id",
        "ALTER TABLE processes ADD COLUMN outbound_message_id INTEGER",
    ),
];

/// Fixed-width sortable UTC timestamp.
pub fn now_iso() -> String {
    to_iso(Utc::now())
}

pub fn to_iso(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Role of a persisted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    User,
    Assistant,
    ToolUse,
    ToolResult,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::ToolUse => "tool_use",
            MessageRole::ToolResult => "tool_result",
        }
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "tool_use" => Ok(MessageRole::ToolUse),
            "tool_result" => Ok(MessageRole::ToolResult),
            other => Err(Error::Store(format!("unknown message role {other:?}"))),
        }
    }
}

/// A persisted conversation message row.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: i64,
    pub agent: String,
    pub branch: Option<i64>,
    pub role: MessageRole,
    pub content: Option<String>,
    /// Tool-call array (assistant messages), as stored JSON.
    pub tool_calls: Option<serde_json::Value>,
    pub tool_call_id: Option<String>,
    pub timestamp: String,
    pub outbound_message_id: Option<i64>,
}

/// A new message to persist (id and timestamp assigned by the store).
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub branch: Option<i64>,
    pub content: Option<String>,
    pub tool_calls: Option<serde_json::Value>,
    pub tool_call_id: Option<String>,
    pub outbound_message_id: Option<i64>,
}

/// Session snapshot index row.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub session_id: String,
    pub agent: String,
    pub timestamp: String,
    pub description: String,
    pub summary: String,
    pub message_count: i64,
    pub file_path: String,
    pub window_start: String,
    pub window_end: String,
}

/// Audit log row.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub id: i64,
    pub timestamp: String,
    pub agent: String,
    pub action_string: String,
    pub decision: String,
    pub user_id: Option<i64>,
    pub detail: String,
}

/// Persisted process row.
#[derive(Debug, Clone)]
pub struct ProcessRow {
    pub pid: u32,
    pub command: String,
    pub cwd: String,
    pub agent: String,
    pub started_at: String,
    pub spawn_kind: SpawnKind,
    pub parent_branch: Option<u64>,
    pub stdout_log: String,
    pub stderr_log: String,
    pub status: String,
    pub exit_code: Option<i32>,
    pub callbacks: Vec<ProcessCallback>,
    pub context: String,
    pub recursion_depth: usize,
}

impl ProcessRow {
    /// Rebuild an in-memory tracked process from a persisted row (startup
    /// recovery). Status starts RUNNING; the recovery pass reconciles it.
    pub fn into_tracked(self) -> TrackedProcess {
        let mut tracked = TrackedProcess::new(
            self.pid,
            self.command,
            self.cwd.into(),
            self.agent,
            self.spawn_kind,
            self.stdout_log.into(),
            self.stderr_log.into(),
            self.callbacks,
            self.context,
            self.parent_branch,
            self.recursion_depth,
        );
        if let Ok(t) = DateTime::parse_from_rfc3339(&self.started_at) {
            tracked.started_at = t.with_timezone(&Utc);
        }
        tracked
    }
}

/// Async SQLite store. One write-capable connection; SQLite serializes
/// writes internally.
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the store at the given path.
    pub async fn open(path: &Path) -> Result<Self, Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Store(format!("failed to create {}: {e}", parent.display())))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| Error::Store(format!("failed to open store: {e}")))?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// In-memory store for tests. The single connection must never be
    /// recycled — an in-memory database dies with its connection.
    pub async fn open_in_memory() -> Result<Self, Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| Error::Store(format!("failed to open in-memory store: {e}")))?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<(), Error> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Store(format!("schema init failed: {e}")))?;
        self.migrate().await
    }

    async fn migrate(&self) -> Result<(), Error> {
        for &(table, column, ddl) in MIGRATIONS {
            let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
                .fetch_all(&self.pool)
                .await
                .map_err(|e| Error::Store(format!("pragma failed: {e}")))?;
            let exists = rows
                .iter()
                .any(|row| row.get::<String, _>("name") == column);
            if !exists {
                sqlx::raw_sql(ddl)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| Error::Store(format!("migration failed: {e}")))?;
                tracing::info!(table, column, "applied store migration");
            }
        }
        Ok(())
    }

    // -- agents -------------------------------------------------------------

    pub async fn register_agent(&self, agent: &Agent) -> Result<(), Error> {
        let permissions = serde_json::to_string(&agent.permissions)?;
        sqlx::query(
            "INSERT INTO agents (name, channel_id, model, permissions, created_at, window_seconds) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&agent.name)
        .bind(agent.channel_id)
        .bind(&agent.model)
        .bind(permissions)
        .bind(to_iso(agent.created_at))
        .bind(agent.window_seconds)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Store(format!("failed to register agent: {e}")))?;
        Ok(())
    }

    pub async fn remove_agent(&self, name: &str) -> Result<(), Error> {
        sqlx::query("DELETE FROM agents WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Store(format!("failed to remove agent: {e}")))?;
        Ok(())
    }

    pub async fn agent_name_by_channel(&self, channel_id: i64) -> Result<Option<String>, Error> {
        let row = sqlx::query("SELECT name FROM agents WHERE channel_id = ?")
            .bind(channel_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Store(format!("agent lookup failed: {e}")))?;
        Ok(row.map(|r| r.get("name")))
    }

    pub async fn list_agent_names(&self) -> Result<Vec<String>, Error> {
        let rows = sqlx::query("SELECT name FROM agents ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Store(format!("agent list failed: {e}")))?;
        Ok(rows.into_iter().map(|r| r.get("name")).collect())
    }

    /// Update a single agent column. Only `permissions` and `model` are
    /// writable through this path.
    pub async fn update_agent_field(
        &self,
        name: &str,
        field: &str,
        value: Option<&str>,
    ) -> Result<(), Error> {
        if !matches!(field, "permissions" | "model") {
            return Err(Error::Store(format!(
                "cannot update field {field:?}; allowed: permissions, model"
            )));
        }
        sqlx::query(&format!("UPDATE agents SET {field} = ? WHERE name = ?"))
            .bind(value)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Store(format!("agent update failed: {e}")))?;
        Ok(())
    }

    pub async fn last_clear_time(&self, agent: &str) -> Result<Option<String>, Error> {
        let row = sqlx::query("SELECT last_clear_time FROM agents WHERE name = ?")
            .bind(agent)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Store(format!("last_clear lookup failed: {e}")))?;
        Ok(row.and_then(|r| r.get::<Option<String>, _>("last_clear_time")))
    }

    pub async fn set_last_clear_time(&self, agent: &str, when: &str) -> Result<(), Error> {
        sqlx::query("UPDATE agents SET last_clear_time = ? WHERE name = ?")
            .bind(when)
            .bind(agent)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Store(format!("last_clear update failed: {e}")))?;
        Ok(())
    }

    // -- messages -----------------------------------------------------------

    /// Persist a message row; returns (row id, assigned timestamp).
    pub async fn persist_message(
        &self,
        agent: &str,
        role: MessageRole,
        message: NewMessage,
    ) -> Result<(i64, String), Error> {
        let timestamp = now_iso();
        let tool_calls = message
            .tool_calls
            .as_ref()
            .map(|v| serde_json::to_string(v))
            .transpose()?;
        let result = sqlx::query(
            "INSERT INTO messages \
             (agent, branch, role, content, tool_calls, tool_call_id, timestamp, outbound_message_id) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(agent)
        .bind(message.branch)
        .bind(role.as_str())
        .bind(&message.content)
        .bind(tool_calls)
        .bind(&message.tool_call_id)
        .bind(&timestamp)
        .bind(message.outbound_message_id)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Store(format!("failed to persist message: {e}")))?;
        Ok((result.last_insert_rowid(), timestamp))
    }

    /// Messages newer than `since`, ordered ascending, optionally filtered
    /// to one branch.
    pub async fn messages_since(
        &self,
        agent: &str,
        branch: Option<i64>,
        since: &str,
    ) -> Result<Vec<StoredMessage>, Error> {
        let rows = match branch {
            Some(branch) => {
                sqlx::query(
                    "SELECT id, agent, branch, role, content, tool_calls, tool_call_id, \
                            timestamp, outbound_message_id \
                     FROM messages \
                     WHERE agent = ? AND branch = ? AND timestamp > ? \
                     ORDER BY timestamp ASC, id ASC",
                )
                .bind(agent)
                .bind(branch)
                .bind(since)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT id, agent, branch, role, content, tool_calls, tool_call_id, \
                            timestamp, outbound_message_id \
                     FROM messages \
                     WHERE agent = ? AND timestamp > ? \
                     ORDER BY timestamp ASC, id ASC",
                )
                .bind(agent)
                .bind(since)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| Error::Store(format!("message query failed: {e}")))?;

        rows.into_iter().map(row_to_message).collect()
    }

    pub async fn message_count(&self, agent: &str) -> Result<i64, Error> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM messages WHERE agent = ?")
            .bind(agent)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::Store(format!("message count failed: {e}")))?;
        Ok(row.get("n"))
    }

    // -- branches -----------------------------------------------------------

    pub async fn insert_branch(&self, agent: &str, branch: &ExecutionBranch) -> Result<(), Error> {
        sqlx::query(
            "INSERT OR REPLACE INTO branches \
             (agent, id, status, summary, created_at, parent_branch, recursion_depth) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(agent)
        .bind(branch.id as i64)
        .bind(branch.status().as_str())
        .bind(&branch.summary)
        .bind(now_iso())
        .bind(branch.parent_branch.map(|b| b as i64))
        .bind(branch.recursion_depth as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Store(format!("failed to insert branch: {e}")))?;
        Ok(())
    }

    pub async fn update_branch_status(
        &self,
        agent: &str,
        branch_id: u64,
        status: BranchStatus,
    ) -> Result<(), Error> {
        sqlx::query("UPDATE branches SET status = ? WHERE agent = ? AND id = ?")
            .bind(status.as_str())
            .bind(agent)
            .bind(branch_id as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Store(format!("branch status update failed: {e}")))?;
        Ok(())
    }

    pub async fn max_branch_id(&self, agent: &str) -> Result<u64, Error> {
        let row = sqlx::query("SELECT COALESCE(MAX(id), 0) AS max_id FROM branches WHERE agent = ?")
            .bind(agent)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::Store(format!("branch max query failed: {e}")))?;
        Ok(row.get::<i64, _>("max_id") as u64)
    }

    pub async fn insert_branch_step(
        &self,
        agent: &str,
        branch_id: u64,
        step: &BranchStep,
    ) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO branch_steps \
             (agent, branch, step_number, description, started_at, ended_at, duration_ms) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(agent)
        .bind(branch_id as i64)
        .bind(step.step_number as i64)
        .bind(&step.description)
        .bind(to_iso(step.started_at))
        .bind(step.ended_at.map(to_iso))
        .bind(step.duration_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Store(format!("failed to insert branch step: {e}")))?;
        Ok(())
    }

    pub async fn branch_steps(&self, agent: &str, branch_id: u64) -> Result<Vec<BranchStep>, Error> {
        let rows = sqlx::query(
            "SELECT step_number, description, started_at, ended_at, duration_ms \
             FROM branch_steps WHERE agent = ? AND branch = ? ORDER BY step_number",
        )
        .bind(agent)
        .bind(branch_id as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Store(format!("branch steps query failed: {e}")))?;

        rows.into_iter()
            .map(|row| {
                Ok(BranchStep {
                    step_number: row.get::<i64, _>("step_number") as u32,
                    description: row.get("description"),
                    started_at: parse_iso(&row.get::<String, _>("started_at"))?,
                    ended_at: row
                        .get::<Option<String>, _>("ended_at")
                        .map(|s| parse_iso(&s))
                        .transpose()?,
                    duration_ms: row.get("duration_ms"),
                })
            })
            .collect()
    }

    // -- sessions -----------------------------------------------------------

    pub async fn save_session(&self, meta: &SessionMeta) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO sessions \
             (session_id, agent, timestamp, description, summary, message_count, \
              file_path, window_start, window_end) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&meta.session_id)
        .bind(&meta.agent)
        .bind(&meta.timestamp)
        .bind(&meta.description)
        .bind(&meta.summary)
        .bind(meta.message_count)
        .bind(&meta.file_path)
        .bind(&meta.window_start)
        .bind(&meta.window_end)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Store(format!("failed to save session: {e}")))?;
        Ok(())
    }

    pub async fn list_sessions(&self, agent: &str, limit: i64) -> Result<Vec<SessionMeta>, Error> {
        let rows = sqlx::query(
            "SELECT session_id, agent, timestamp, description, summary, message_count, \
                    file_path, window_start, window_end \
             FROM sessions WHERE agent = ? ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(agent)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Store(format!("session list failed: {e}")))?;
        Ok(rows.into_iter().map(row_to_session).collect())
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<SessionMeta>, Error> {
        let row = sqlx::query(
            "SELECT session_id, agent, timestamp, description, summary, message_count, \
                    file_path, window_start, window_end \
             FROM sessions WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Store(format!("session lookup failed: {e}")))?;
        Ok(row.map(row_to_session))
    }

    // -- audit --------------------------------------------------------------

    pub async fn append_audit(
        &self,
        agent: &str,
        action: &str,
        decision: &str,
        user_id: Option<i64>,
        detail: &str,
    ) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO audit_log (timestamp, agent, action_string, decision, user_id, detail) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(now_iso())
        .bind(agent)
        .bind(action)
        .bind(decision)
        .bind(user_id)
        .bind(detail)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Store(format!("failed to append audit row: {e}")))?;
        Ok(())
    }

    pub async fn audit_log(&self, agent: &str, limit: i64) -> Result<Vec<AuditRecord>, Error> {
        let rows = sqlx::query(
            "SELECT id, timestamp, agent, action_string, decision, user_id, detail \
             FROM audit_log WHERE agent = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(agent)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Store(format!("audit query failed: {e}")))?;
        Ok(rows
            .into_iter()
            .map(|row| AuditRecord {
                id: row.get("id"),
                timestamp: row.get("timestamp"),
                agent: row.get("agent"),
                action_string: row.get("action_string"),
                decision: row.get("decision"),
                user_id: row.get("user_id"),
                detail: row.get::<Option<String>, _>("detail").unwrap_or_default(),
            })
            .collect())
    }

    // -- processes ----------------------------------------------------------

    pub async fn insert_process(&self, tracked: &TrackedProcess) -> Result<(), Error> {
        let callbacks = serde_json::to_string(&tracked.callbacks_snapshot())?;
        sqlx::query(
            "INSERT OR REPLACE INTO processes \
             (pid, command, cwd, agent, started_at, type, parent_branch, stdout_log, \
              stderr_log, status, exit_code, callbacks, context, recursion_depth, \
              outbound_message_id) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(tracked.pid as i64)
        .bind(&tracked.command)
        .bind(tracked.cwd.display().to_string())
        .bind(&tracked.agent)
        .bind(to_iso(tracked.started_at))
        .bind(tracked.spawn_kind.as_str())
        .bind(tracked.parent_branch.map(|b| b as i64))
        .bind(tracked.stdout_log.display().to_string())
        .bind(tracked.stderr_log.display().to_string())
        .bind(tracked.status().as_str())
        .bind(tracked.exit_code())
        .bind(callbacks)
        .bind(&tracked.context)
        .bind(tracked.recursion_depth as i64)
        .bind(tracked.outbound_message_id().map(|id| id as i64))
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Store(format!("failed to insert process: {e}")))?;
        Ok(())
    }

    pub async fn update_process_status(
        &self,
        pid: u32,
        status: ProcessStatus,
        exit_code: Option<i32>,
    ) -> Result<(), Error> {
        sqlx::query("UPDATE processes SET status = ?, exit_code = ? WHERE pid = ?")
            .bind(status.as_str())
            .bind(exit_code)
            .bind(pid as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Store(format!("process status update failed: {e}")))?;
        Ok(())
    }

    pub async fn update_process_callbacks(
        &self,
        pid: u32,
        callbacks: &[ProcessCallback],
    ) -> Result<(), Error> {
        let json = serde_json::to_string(callbacks)?;
        sqlx::query("UPDATE processes SET callbacks = ? WHERE pid = ?")
            .bind(json)
            .bind(pid as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Store(format!("process callbacks update failed: {e}")))?;
        Ok(())
    }

    pub async fn list_processes_with_status(
        &self,
        status: ProcessStatus,
    ) -> Result<Vec<ProcessRow>, Error> {
        let rows = sqlx::query(
            "SELECT pid, command, cwd, agent, started_at, type, parent_branch, stdout_log, \
                    stderr_log, status, exit_code, callbacks, context, recursion_depth \
             FROM processes WHERE status = ?",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Store(format!("process query failed: {e}")))?;

        rows.into_iter().map(row_to_process).collect()
    }

    // -- settings -----------------------------------------------------------

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, Error> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Store(format!("setting lookup failed: {e}")))?;
        Ok(row.map(|r| r.get("value")))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), Error> {
        sqlx::query("INSERT OR REPLACE INTO settings (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Store(format!("setting update failed: {e}")))?;
        Ok(())
    }
}

fn parse_iso(s: &str) -> Result<DateTime<Utc>, Error> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Store(format!("bad timestamp {s:?}: {e}")))
}

fn row_to_message(row: sqlx::sqlite::SqliteRow) -> Result<StoredMessage, Error> {
    let tool_calls = row
        .get::<Option<String>, _>("tool_calls")
        .map(|s| serde_json::from_str(&s))
        .transpose()?;
    Ok(StoredMessage {
        id: row.get("id"),
        agent: row.get("agent"),
        branch: row.get("branch"),
        role: MessageRole::parse(&row.get::<String, _>("role"))?,
        content: row.get("content"),
        tool_calls,
        tool_call_id: row.get("tool_call_id"),
        timestamp: row.get("timestamp"),
        outbound_message_id: row.get("outbound_message_id"),
    })
}

fn row_to_session(row: sqlx::sqlite::SqliteRow) -> SessionMeta {
    SessionMeta {
        session_id: row.get("session_id"),
        agent: row.get("agent"),
        timestamp: row.get("timestamp"),
        description: row.get::<Option<String>, _>("description").unwrap_or_default(),
        summary: row.get::<Option<String>, _>("summary").unwrap_or_default(),
        message_count: row.get::<Option<i64>, _>("message_count").unwrap_or(0),
        file_path: row.get("file_path"),
        window_start: row.get::<Option<String>, _>("window_start").unwrap_or_default(),
        window_end: row.get::<Option<String>, _>("window_end").unwrap_or_default(),
    }
}

fn row_to_process(row: sqlx::sqlite::SqliteRow) -> Result<ProcessRow, Error> {
    let callbacks: Vec<ProcessCallback> = row
        .get::<Option<String>, _>("callbacks")
        .map(|s| serde_json::from_str(&s))
        .transpose()?
        .unwrap_or_default();
    let spawn_kind = match row.get::<String, _>("type").as_str() {
        "background" => SpawnKind::Background,
        _ => SpawnKind::Concurrent,
    };
    Ok(ProcessRow {
        pid: row.get::<i64, _>("pid") as u32,
        command: row.get("command"),
        cwd: row.get("cwd"),
        agent: row.get("agent"),
        started_at: row.get("started_at"),
        spawn_kind,
        parent_branch: row.get::<Option<i64>, _>("parent_branch").map(|b| b as u64),
        stdout_log: row.get::<Option<String>, _>("stdout_log").unwrap_or_default(),
        stderr_log: row.get::<Option<String>, _>("stderr_log").unwrap_or_default(),
        status: row.get("status"),
        exit_code: row.get("exit_code"),
        callbacks,
        context: row.get::<Option<String>, _>("context").unwrap_or_default(),
        recursion_depth: row.get::<i64, _>("recursion_depth") as usize,
    })
}
