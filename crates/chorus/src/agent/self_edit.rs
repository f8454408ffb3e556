//! Agent self-modification — system prompt, docs, permissions, model.
//!
//! Edits land in `agent.json` (atomic tmp-file + rename) and take effect on
//! the next LLM call. Every edit appends an audit row. Permission edits are
//! additionally gated by the invoking user's role: granting `open` requires
//! an admin, regardless of what the permission engine decided.

use std::sync::Arc;

use serde::Serialize;

use crate::agent::Agent;
use crate::config::ChorusHome;
use crate::error::Error;
use crate::permission::{PRESET_NAMES, ProfileSpec};
use crate::store::Store;
use crate::workspace::Workspace;

const AUDIT_TRUNCATE: usize = 500;

/// Structured result from a self-edit operation.
#[derive(Debug, Clone, Serialize)]
pub struct SelfEditResult {
    pub success: bool,
    pub edit_type: String,
    pub old_value: String,
    pub new_value: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SelfEditResult {
    fn ok(edit_type: &str, old: String, new: String, message: &str) -> Self {
        Self {
            success: true,
            edit_type: edit_type.into(),
            old_value: old,
            new_value: new,
            message: message.into(),
            error: None,
        }
    }

    fn fail(edit_type: &str, message: &str, error: &str) -> Self {
        Self {
            success: false,
            edit_type: edit_type.into(),
            old_value: String::new(),
            new_value: String::new(),
            message: message.into(),
            error: Some(error.into()),
        }
    }
}

fn truncate(value: &str) -> String {
    if value.len() <= AUDIT_TRUNCATE {
        return value.to_string();
    }
    let mut cut = AUDIT_TRUNCATE;
    while cut > 0 && !value.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &value[..cut])
}

fn atomic_write(path: &std::path::Path, content: &str) -> Result<(), Error> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content)
        .map_err(|e| Error::Config(format!("failed to write {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| Error::Config(format!("failed to replace {}: {e}", path.display())))
}

async fn audit(
    store: Option<&Arc<Store>>,
    agent: &str,
    edit_type: &str,
    old: &str,
    new: &str,
    user_id: Option<i64>,
) {
    let Some(store) = store else { return };
    let detail = serde_json::json!({
        "edit_type": edit_type,
        "old_value": truncate(old),
        "new_value": truncate(new),
    })
    .to_string();
    if let Err(e) = store
        .append_audit(
            agent,
            &format!("tool:self_edit:{edit_type}"),
            "allow",
            user_id,
            &detail,
        )
        .await
    {
        tracing::warn!(agent, error = %e, "failed to audit self-edit");
    }
}

fn save_agent(home: &ChorusHome, agent: &Agent) -> Result<(), Error> {
    let content = serde_json::to_string_pretty(agent)?;
    atomic_write(&home.agent_config_path(&agent.name), &content)
}

/// Update the agent's system prompt.
pub async fn edit_system_prompt(
    home: &ChorusHome,
    store: Option<&Arc<Store>>,
    agent_name: &str,
    new_prompt: &str,
    user_id: Option<i64>,
) -> Result<SelfEditResult, Error> {
    if new_prompt.trim().is_empty() {
        return Ok(SelfEditResult::fail(
            "system_prompt",
            "System prompt cannot be empty.",
            "empty_prompt",
        ));
    }

    let mut agent = Agent::load(home, agent_name)?;
    let old = std::mem::replace(&mut agent.system_prompt, new_prompt.to_string());
    save_agent(home, &agent)?;
    audit(store, agent_name, "system_prompt", &old, new_prompt, user_id).await;

    Ok(SelfEditResult::ok(
        "system_prompt",
        old,
        new_prompt.to_string(),
        "System prompt updated.",
    ))
}

/// Create or update a file in the agent's docs/ directory. The docs dir is
/// its own jail — `../` cannot reach outside it.
pub async fn edit_docs(
    home: &ChorusHome,
    store: Option<&Arc<Store>>,
    agent_name: &str,
    path: &str,
    content: &str,
    user_id: Option<i64>,
) -> Result<SelfEditResult, Error> {
    home.ensure_agent_dirs(agent_name)?;
    let docs = Workspace::open(home.docs_dir(agent_name))?;
    let resolved = match docs.resolve(path) {
        Ok(resolved) => resolved,
        Err(e) => {
            return Ok(SelfEditResult::fail(
                "docs",
                &format!("Invalid docs path: {e}"),
                e.kind(),
            ));
        }
    };

    let old = std::fs::read_to_string(&resolved).unwrap_or_default();
    if let Some(parent) = resolved.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::Config(format!("failed to create {}: {e}", parent.display())))?;
    }
    std::fs::write(&resolved, content)
        .map_err(|e| Error::Config(format!("failed to write {}: {e}", resolved.display())))?;
    audit(store, agent_name, "docs", &old, content, user_id).await;

    Ok(SelfEditResult::ok(
        "docs",
        old,
        content.to_string(),
        &format!("Docs file '{path}' updated."),
    ))
}

/// Change the agent's permission profile to a preset.
///
/// Granting `open` requires the invoking human to be an admin; the engine's
/// ALLOW/ASK outcome cannot override that gate.
pub async fn edit_permissions(
    home: &ChorusHome,
    store: Option<&Arc<Store>>,
    agent_name: &str,
    profile: &str,
    is_admin: bool,
    user_id: Option<i64>,
) -> Result<SelfEditResult, Error> {
    if !PRESET_NAMES.contains(&profile) {
        return Ok(SelfEditResult::fail(
            "permissions",
            &format!(
                "Unknown permission preset '{profile}'. Available: {}",
                PRESET_NAMES.join(", ")
            ),
            "UnknownPreset",
        ));
    }
    if profile == "open" && !is_admin {
        return Ok(SelfEditResult::fail(
            "permissions",
            "Only admins can set 'open' permissions.",
            "insufficient_role",
        ));
    }

    let mut agent = Agent::load(home, agent_name)?;
    let old = match &agent.permissions {
        ProfileSpec::Preset(name) => name.clone(),
        ProfileSpec::Inline { .. } => "(inline)".to_string(),
    };
    agent.permissions = ProfileSpec::Preset(profile.to_string());
    save_agent(home, &agent)?;

    if let Some(store) = store {
        let spec = serde_json::to_string(&agent.permissions)?;
        store
            .update_agent_field(agent_name, "permissions", Some(&spec))
            .await?;
    }
    audit(store, agent_name, "permissions", &old, profile, user_id).await;

    Ok(SelfEditResult::ok(
        "permissions",
        old,
        profile.to_string(),
        &format!("Permission profile set to '{profile}'."),
    ))
}

/// Change the agent's model id.
pub async fn edit_model(
    home: &ChorusHome,
    store: Option<&Arc<Store>>,
    agent_name: &str,
    model: &str,
    user_id: Option<i64>,
) -> Result<SelfEditResult, Error> {
    if model.trim().is_empty() {
        return Ok(SelfEditResult::fail(
            "model",
            "Model id cannot be empty.",
            "empty_model",
        ));
    }

    let mut agent = Agent::load(home, agent_name)?;
    let old = agent.model.clone().unwrap_or_default();
    agent.model = Some(model.to_string());
    save_agent(home, &agent)?;

    if let Some(store) = store {
        store
            .update_agent_field(agent_name, "model", Some(model))
            .await?;
    }
    audit(store, agent_name, "model", &old, model, user_id).await;

    Ok(SelfEditResult::ok(
        "model",
        old,
        model.to_string(),
        &format!("Model set to '{model}'."),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (tempfile::TempDir, ChorusHome, Arc<Store>) {
        let dir = tempfile::tempdir().unwrap();
        let home = ChorusHome::new(dir.path());
        home.ensure().unwrap();
        let agent = Agent::new("alpha", 42).unwrap();
        agent.save(&home).unwrap();
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        store.register_agent(&agent).await.unwrap();
        (dir, home, store)
    }

    #[tokio::test]
    async fn system_prompt_edit_persists() {
        let (_dir, home, store) = setup().await;
        let result = edit_system_prompt(&home, Some(&store), "alpha", "You review code.", Some(7))
            .await
            .unwrap();
        assert!(result.success);

        let agent = Agent::load(&home, "alpha").unwrap();
        assert_eq!(agent.system_prompt, "You review code.");

        let log = store.audit_log("alpha", 10).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].action_string, "tool:self_edit:system_prompt");
        assert_eq!(log[0].user_id, Some(7));
    }

    #[tokio::test]
    async fn empty_system_prompt_rejected() {
        let (_dir, home, _store) = setup().await;
        let result = edit_system_prompt(&home, None, "alpha", "   ", None)
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("empty_prompt"));
    }

    #[tokio::test]
    async fn docs_edit_creates_file() {
        let (_dir, home, _store) = setup().await;
        let result = edit_docs(&home, None, "alpha", "notes/howto.md", "Use the parser.", None)
            .await
            .unwrap();
        assert!(result.success, "{:?}", result);

        let content =
            std::fs::read_to_string(home.docs_dir("alpha").join("notes/howto.md")).unwrap();
        assert_eq!(content, "Use the parser.");
    }

    #[tokio::test]
    async fn docs_edit_rejects_escape() {
        let (_dir, home, _store) = setup().await;
        let result = edit_docs(&home, None, "alpha", "../../etc/passwd", "x", None)
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("PathTraversal"));
    }

    #[tokio::test]
    async fn permissions_open_requires_admin() {
        let (_dir, home, store) = setup().await;
        let result = edit_permissions(&home, Some(&store), "alpha", "open", false, Some(7))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("insufficient_role"));

        // Admin succeeds
        let result = edit_permissions(&home, Some(&store), "alpha", "open", true, Some(7))
            .await
            .unwrap();
        assert!(result.success);
        let agent = Agent::load(&home, "alpha").unwrap();
        match agent.permissions {
            ProfileSpec::Preset(p) => assert_eq!(p, "open"),
            other => panic!("expected preset, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_open_presets_need_no_admin() {
        let (_dir, home, _store) = setup().await;
        let result = edit_permissions(&home, None, "alpha", "locked", false, None)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.old_value, "standard");
        assert_eq!(result.new_value, "locked");
    }

    #[tokio::test]
    async fn unknown_preset_rejected() {
        let (_dir, home, _store) = setup().await;
        let result = edit_permissions(&home, None, "alpha", "yolo", true, None)
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("UnknownPreset"));
    }

    #[tokio::test]
    async fn model_edit_updates_store_column() {
        let (_dir, home, store) = setup().await;
        let result = edit_model(&home, Some(&store), "alpha", "gpt-4o", None)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(Agent::load(&home, "alpha").unwrap().model.as_deref(), Some("gpt-4o"));
    }

    #[test]
    fn truncate_caps_audit_values() {
        let long = "y".repeat(900);
        let out = truncate(&long);
        assert_eq!(out.len(), AUDIT_TRUNCATE + 3);
        assert!(out.ends_with("..."));
        assert_eq!(truncate("short"), "short");
    }
}
