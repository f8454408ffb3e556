//! Regex-matched permission engine — pure logic, no I/O.
//!
//! Every tool invocation is reduced to an action string of the form
//! `tool:<tool_name>:<detail>`. The engine matches it against a
//! [`PermissionProfile`] and returns allow, ask, or deny.

use fancy_regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Outcome of a permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Ask,
    Deny,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Ask => "ask",
            Decision::Deny => "deny",
        }
    }
}

/// Build a correctly formatted action string.
pub fn format_action(tool_name: &str, detail: &str) -> String {
    format!("tool:{tool_name}:{detail}")
}

/// Wire shape of a profile: either a preset name or an inline pattern set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProfileSpec {
    Preset(String),
    Inline {
        allow: Vec<String>,
        ask: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        deny: Vec<String>,
    },
}

impl ProfileSpec {
    pub fn compile(&self) -> Result<PermissionProfile, Error> {
        match self {
            ProfileSpec::Preset(name) => preset(name),
            ProfileSpec::Inline { allow, ask, deny } => {
                PermissionProfile::new(allow.clone(), ask.clone(), deny.clone())
            }
        }
    }
}

/// Ordered regex pattern lists controlling what an agent may do.
///
/// Patterns are compiled once at construction; an invalid pattern fails
/// construction. Matching is full-string (the entire action must match),
/// checked deny → allow → ask → implicit deny.
#[derive(Debug, Clone)]
pub struct PermissionProfile {
    allow: Vec<String>,
    ask: Vec<String>,
    deny: Vec<String>,
    compiled_allow: Vec<Regex>,
    compiled_ask: Vec<Regex>,
    compiled_deny: Vec<Regex>,
}

impl PermissionProfile {
    pub fn new(
        allow: Vec<String>,
        ask: Vec<String>,
        deny: Vec<String>,
    ) -> Result<Self, Error> {
        Ok(Self {
            compiled_allow: compile_all(&allow)?,
            compiled_ask: compile_all(&ask)?,
            compiled_deny: compile_all(&deny)?,
            allow,
            ask,
            deny,
        })
    }

    pub fn allow_patterns(&self) -> &[String] {
        &self.allow
    }

    pub fn ask_patterns(&self) -> &[String] {
        &self.ask
    }

    pub fn deny_patterns(&self) -> &[String] {
        &self.deny
    }

    /// Serialize to the wire shape (`{"allow": [...], "ask": [...]}`).
    pub fn to_spec(&self) -> ProfileSpec {
        ProfileSpec::Inline {
            allow: self.allow.clone(),
            ask: self.ask.clone(),
            deny: self.deny.clone(),
        }
    }
}

/// Anchor a pattern so the whole action string must match. The preset
/// patterns use look-around, hence `fancy-regex` rather than `regex`.
fn compile_all(patterns: &[String]) -> Result<Vec<Regex>, Error> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(&format!("^(?:{p})$")).map_err(|e| Error::InvalidPermissionPattern {
                pattern: p.clone(),
                message: e.to_string(),
            })
        })
        .collect()
}

fn full_match(re: &Regex, action: &str) -> bool {
    match re.is_match(action) {
        Ok(matched) => matched,
        Err(e) => {
            tracing::warn!(pattern = %re.as_str(), error = %e, "permission pattern match failed");
            false
        }
    }
}

/// Check `action` against `profile`. First match wins within each list;
/// deny takes priority over allow, allow over ask; no match means deny.
pub fn decide(action: &str, profile: &PermissionProfile) -> Decision {
    if profile.compiled_deny.iter().any(|p| full_match(p, action)) {
        return Decision::Deny;
    }
    if profile.compiled_allow.iter().any(|p| full_match(p, action)) {
        return Decision::Allow;
    }
    if profile.compiled_ask.iter().any(|p| full_match(p, action)) {
        return Decision::Ask;
    }
    Decision::Deny
}

/// Names of the built-in presets.
pub const PRESET_NAMES: &[&str] = &["open", "standard", "guarded", "locked"];

/// Return a built-in preset by name.
pub fn preset(name: &str) -> Result<PermissionProfile, Error> {
    let profile = match name {
        "open" => PermissionProfile::new(vec!["tool:.*".into()], vec![], vec![])?,
        "standard" => PermissionProfile::new(
            vec![
                r"tool:(create_file|str_replace|view):.*".into(),
                r"tool:git:(?!push|merge_request).*".into(),
                r"tool:agent_comm:.*".into(),
            ],
            vec![
                r"tool:bash:.*".into(),
                r"tool:git:(push|merge_request).*".into(),
                r"tool:self_edit:.*".into(),
            ],
            vec![],
        )?,
        "guarded" => PermissionProfile::new(
            vec![".*".into()],
            vec![],
            vec![
                // gh write operations
                r"tool:bash:.*\bgh\s+\S+\s+(create|delete|close|merge|edit|comment|review|approve|reopen)\b.*".into(),
                // gh api with write methods
                r"tool:bash:.*\bgh\s+api\s+.*(-X|--method)\s+(POST|PUT|PATCH|DELETE)\b.*".into(),
                r"tool:git:(push|merge_request).*".into(),
            ],
        )?,
        "locked" => PermissionProfile::new(vec![r"tool:view:.*".into()], vec![], vec![])?,
        other => return Err(Error::UnknownPreset(other.to_string())),
    };
    Ok(profile)
}
