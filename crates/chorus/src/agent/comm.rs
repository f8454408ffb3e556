//! Inter-agent communication — fire-and-forget messages, docs reading,
//! agent discovery.
//!
//! A delivered message seeds a new branch in the target agent's channel,
//! running under the target's own permission profile.

use serde_json::json;

use crate::agent::Agent;
use crate::config::ChorusHome;
use crate::error::Error;
use crate::tool::CommBus;

/// First prose paragraph of a markdown document, capped at 200 chars.
/// Headings, emphasis-only lines, and blockquotes are skipped.
pub fn extract_first_paragraph(markdown: &str) -> String {
    for line in markdown.lines() {
        let stripped = line.trim();
        if stripped.is_empty()
            || stripped.starts_with('#')
            || stripped.starts_with('*')
            || stripped.starts_with('>')
        {
            continue;
        }
        if stripped.len() > 200 {
            let mut cut = 197;
            while cut > 0 && !stripped.is_char_boundary(cut) {
                cut -= 1;
            }
            return format!("{}...", &stripped[..cut]);
        }
        return stripped.to_string();
    }
    String::new()
}

/// Send a message to another agent via the orchestrator's delivery bus.
pub async fn send_to_agent(
    home: &ChorusHome,
    comm: Option<&dyn CommBus>,
    from_agent: &str,
    target_agent: &str,
    message: &str,
) -> Result<serde_json::Value, Error> {
    if target_agent == from_agent {
        return Ok(json!({"error": "Cannot send a message to your own agent."}));
    }
    if !home.agent_dir(target_agent).is_dir() {
        return Ok(json!({"error": format!("Agent '{target_agent}' not found.")}));
    }
    let Some(comm) = comm else {
        return Ok(json!({"error": "Delivery bus not available — cannot deliver messages."}));
    };

    let attributed = format!("Message from agent '{from_agent}': {message}");
    match comm.deliver(from_agent, target_agent, &attributed).await {
        Ok(()) => {
            tracing::info!(from = from_agent, target = target_agent, "delivered agent message");
            Ok(json!({"delivered": true, "target": target_agent}))
        }
        Err(e) => {
            tracing::warn!(
                from = from_agent,
                target = target_agent,
                error = %e,
                "failed to deliver agent message"
            );
            Ok(json!({
                "error": format!("Failed to deliver message to '{target_agent}': {e}"),
            }))
        }
    }
}

/// Read all markdown docs of another agent.
pub fn read_target_docs(
    home: &ChorusHome,
    from_agent: &str,
    target_agent: &str,
) -> serde_json::Value {
    if target_agent == from_agent {
        return json!({"error": "Use your own docs/ directory directly."});
    }
    if !home.agent_dir(target_agent).is_dir() {
        return json!({"error": format!("Agent '{target_agent}' not found.")});
    }

    let mut docs = serde_json::Map::new();
    let docs_dir = home.docs_dir(target_agent);
    if let Ok(entries) = std::fs::read_dir(&docs_dir) {
        let mut files: Vec<_> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "md"))
            .collect();
        files.sort();
        for path in files {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let content = std::fs::read_to_string(&path)
                .unwrap_or_else(|_| "(unreadable)".to_string());
            docs.insert(name, serde_json::Value::String(content));
        }
    }

    json!({"agent": target_agent, "docs": docs})
}

/// List all agents (excluding self) with model and description.
pub fn list_agents(home: &ChorusHome, from_agent: &str) -> serde_json::Value {
    let agents_dir = home.agents_dir();
    let Ok(entries) = std::fs::read_dir(&agents_dir) else {
        return json!({"agents": []});
    };

    let mut names: Vec<_> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name != from_agent)
        .collect();
    names.sort();

    let mut result = Vec::new();
    for name in names {
        let model = Agent::load(home, &name).ok().and_then(|a| a.model);
        let description = std::fs::read_to_string(home.docs_dir(&name).join("README.md"))
            .map(|content| extract_first_paragraph(&content))
            .unwrap_or_default();
        result.push(json!({
            "name": name,
            "model": model,
            "description": description,
        }));
    }

    json!({"agents": result})
}
