//! Agent identity and configuration.

pub mod comm;
pub mod events;
pub mod self_edit;
pub mod tool_loop;

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::ChorusHome;
use crate::error::Error;
use crate::permission::ProfileSpec;

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]{0,30}[a-z0-9]$").expect("valid regex"));

/// Validate an agent name: lowercase, digits, hyphens, 2–32 chars, no
/// leading or trailing hyphen.
pub fn validate_name(name: &str) -> Result<(), Error> {
    if NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(Error::Agent(format!(
            "invalid agent name {name:?}: must match ^[a-z0-9][a-z0-9-]{{0,30}}[a-z0-9]$"
        )))
    }
}

fn default_window_seconds() -> i64 {
    86_400
}

/// A channel-bound agent record, persisted as `agent.json` in the agent's
/// home directory (the store keeps the queryable columns).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub name: String,
    pub channel_id: i64,
    #[serde(default)]
    pub model: Option<String>,
    pub permissions: ProfileSpec,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: i64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(name: impl Into<String>, channel_id: i64) -> Result<Self, Error> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            name,
            channel_id,
            model: None,
            permissions: ProfileSpec::Preset("standard".into()),
            system_prompt: String::new(),
            window_seconds: default_window_seconds(),
            created_at: Utc::now(),
        })
    }

    pub fn load(home: &ChorusHome, name: &str) -> Result<Self, Error> {
        let path = home.agent_config_path(name);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        let agent: Agent = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("invalid agent config {}: {e}", path.display())))?;
        validate_name(&agent.name)?;
        Ok(agent)
    }

    pub fn save(&self, home: &ChorusHome) -> Result<(), Error> {
        home.ensure_agent_dirs(&self.name)?;
        let path = home.agent_config_path(&self.name);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content)
            .map_err(|e| Error::Config(format!("failed to write {}: {e}", path.display())))
    }
}

/// Concatenate the agent's `docs/*.md` files for system-prompt injection.
/// Missing directory or unreadable files contribute nothing.
pub fn read_agent_docs(home: &ChorusHome, name: &str) -> String {
    let docs_dir = home.docs_dir(name);
    let Ok(entries) = std::fs::read_dir(&docs_dir) else {
        return String::new();
    };

    let mut files: Vec<_> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "md"))
        .collect();
    files.sort();

    let mut parts = Vec::new();
    for path in files {
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        let content = content.trim();
        if content.is_empty() {
            continue;
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        parts.push(format!("--- {file_name} ---\n{content}"));
    }
    parts.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names() {
        for name in ["alpha", "a1", "my-agent", "code-review-2", "00"] {
            assert!(validate_name(name).is_ok(), "should accept {name:?}");
        }
    }

    #[test]
    fn invalid_names() {
        let too_long = "x".repeat(40);
        for name in [
            "",
            "a",
            "-alpha",
            "alpha-",
            "Alpha",
            "has space",
            "under_score",
            too_long.as_str(),
        ] {
            assert!(validate_name(name).is_err(), "should reject {name:?}");
        }
    }

    #[test]
    fn agent_new_defaults_to_standard_profile() {
        let agent = Agent::new("alpha", 42).unwrap();
        assert_eq!(agent.window_seconds, 86_400);
        match &agent.permissions {
            ProfileSpec::Preset(p) => assert_eq!(p, "standard"),
            other => panic!("expected preset, got {other:?}"),
        }
    }

    #[test]
    fn agent_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let home = ChorusHome::new(dir.path());
        home.ensure().unwrap();

        let mut agent = Agent::new("alpha", 42).unwrap();
        agent.system_prompt = "You are alpha.".into();
        agent.model = Some("claude-sonnet-4-20250514".into());
        agent.save(&home).unwrap();

        let loaded = Agent::load(&home, "alpha").unwrap();
        assert_eq!(loaded.name, "alpha");
        assert_eq!(loaded.channel_id, 42);
        assert_eq!(loaded.system_prompt, "You are alpha.");
        assert_eq!(loaded.model.as_deref(), Some("claude-sonnet-4-20250514"));
        // Save created the directory skeleton
        assert!(home.workspace_dir("alpha").is_dir());
    }

    #[test]
    fn load_missing_agent_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let home = ChorusHome::new(dir.path());
        assert!(Agent::load(&home, "ghost").is_err());
    }

    #[test]
    fn docs_concatenate_sorted_md_files() {
        let dir = tempfile::tempdir().unwrap();
        let home = ChorusHome::new(dir.path());
        home.ensure_agent_dirs("alpha").unwrap();
        std::fs::write(home.docs_dir("alpha").join("b.md"), "second doc").unwrap();
        std::fs::write(home.docs_dir("alpha").join("a.md"), "first doc").unwrap();
        std::fs::write(home.docs_dir("alpha").join("notes.txt"), "ignored").unwrap();
        std::fs::write(home.docs_dir("alpha").join("empty.md"), "   ").unwrap();

        let docs = read_agent_docs(&home, "alpha");
        assert!(docs.starts_with("--- a.md ---\nfirst doc"));
        assert!(docs.contains("--- b.md ---\nsecond doc"));
        assert!(!docs.contains("ignored"));
        assert!(!docs.contains("empty.md"));
    }

    #[test]
    fn docs_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let home = ChorusHome::new(dir.path());
        assert_eq!(read_agent_docs(&home, "ghost"), "");
    }
}
