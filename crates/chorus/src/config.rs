use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Filesystem layout rooted at the chorus home directory.
///
/// ```text
/// <home>/agents/<name>/{agent.json, docs/, sessions/, workspace/}
/// <home>/agents/<name>/processes/<pid>/{stdout.log, stderr.log}
/// <home>/available_models.json
/// <home>/db/chorus.db
/// <home>/config.json
/// ```
#[derive(Debug, Clone)]
pub struct ChorusHome {
    root: PathBuf,
}

impl ChorusHome {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the home directory tree if it does not exist yet.
    pub fn ensure(&self) -> Result<(), Error> {
        for dir in [self.root.clone(), self.agents_dir(), self.db_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                Error::Config(format!("failed to create {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.root.join("agents")
    }

    pub fn agent_dir(&self, name: &str) -> PathBuf {
        self.agents_dir().join(name)
    }

    pub fn agent_config_path(&self, name: &str) -> PathBuf {
        self.agent_dir(name).join("agent.json")
    }

    pub fn docs_dir(&self, name: &str) -> PathBuf {
        self.agent_dir(name).join("docs")
    }

    pub fn sessions_dir(&self, name: &str) -> PathBuf {
        self.agent_dir(name).join("sessions")
    }

    pub fn workspace_dir(&self, name: &str) -> PathBuf {
        self.agent_dir(name).join("workspace")
    }

    pub fn process_log_dir(&self, name: &str, pid: u32) -> PathBuf {
        self.agent_dir(name).join("processes").join(pid.to_string())
    }

    pub fn db_dir(&self) -> PathBuf {
        self.root.join("db")
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_dir().join("chorus.db")
    }

    pub fn models_cache_path(&self) -> PathBuf {
        self.root.join("available_models.json")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Create the per-agent directory skeleton (docs/, sessions/, workspace/).
    pub fn ensure_agent_dirs(&self, name: &str) -> Result<(), Error> {
        for dir in [
            self.docs_dir(name),
            self.sessions_dir(name),
            self.workspace_dir(name),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                Error::Config(format!("failed to create {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }
}

fn default_max_iterations() -> usize {
    25
}

fn default_window_seconds() -> i64 {
    86_400
}

fn default_ask_timeout_secs() -> u64 {
    120
}

/// Process-wide settings loaded from `<home>/config.json`.
///
/// Missing file means defaults; a malformed file is an error (silent
/// fallback would mask typos in operator-edited JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default = "default_max_iterations")]
    pub max_tool_loop_iterations: usize,
    #[serde(default = "default_window_seconds")]
    pub default_window_seconds: i64,
    #[serde(default = "default_ask_timeout_secs")]
    pub ask_timeout_secs: u64,
    /// Optional host path exposed to agent subprocesses as `SCOPE_PATH`.
    #[serde(default)]
    pub scope_path: Option<PathBuf>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            default_model: None,
            max_tool_loop_iterations: default_max_iterations(),
            default_window_seconds: default_window_seconds(),
            ask_timeout_secs: default_ask_timeout_secs(),
            scope_path: None,
        }
    }
}

impl GlobalConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("invalid config {}: {e}", path.display())))
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Config(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .map_err(|e| Error::Config(format!("failed to write {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn home_layout_paths() {
        let home = ChorusHome::new("/srv/chorus");
        assert_eq!(
            home.agent_dir("alpha"),
            PathBuf::from("/srv/chorus/agents/alpha")
        );
        assert_eq!(
            home.workspace_dir("alpha"),
            PathBuf::from("/srv/chorus/agents/alpha/workspace")
        );
        assert_eq!(
            home.process_log_dir("alpha", 4242),
            PathBuf::from("/srv/chorus/agents/alpha/processes/4242")
        );
        assert_eq!(home.db_path(), PathBuf::from("/srv/chorus/db/chorus.db"));
    }

    #[test]
    fn ensure_creates_tree() {
        let dir = tempfile::tempdir().unwrap();
        let home = ChorusHome::new(dir.path().join("home"));
        home.ensure().unwrap();
        assert!(home.agents_dir().is_dir());
        assert!(home.db_dir().is_dir());

        home.ensure_agent_dirs("alpha").unwrap();
        assert!(home.docs_dir("alpha").is_dir());
        assert!(home.sessions_dir("alpha").is_dir());
        assert!(home.workspace_dir("alpha").is_dir());
    }

    #[test]
    fn config_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = GlobalConfig::load(&dir.path().join("config.json")).unwrap();
        assert_eq!(cfg.max_tool_loop_iterations, 25);
        assert_eq!(cfg.default_window_seconds, 86_400);
        assert_eq!(cfg.ask_timeout_secs, 120);
        assert!(cfg.default_model.is_none());
    }

    #[test]
    fn config_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let cfg = GlobalConfig {
            default_model: Some("claude-sonnet-4-20250514".into()),
            max_tool_loop_iterations: 10,
            ..Default::default()
        };
        cfg.save(&path).unwrap();

        let loaded = GlobalConfig::load(&path).unwrap();
        assert_eq!(loaded.default_model.as_deref(), Some("claude-sonnet-4-20250514"));
        assert_eq!(loaded.max_tool_loop_iterations, 10);
    }

    #[test]
    fn config_invalid_json_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = GlobalConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("invalid config"));
    }
}
