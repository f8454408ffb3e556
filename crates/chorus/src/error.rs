use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization/deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("permission prompt timed out: {0}")]
    AskTimeout(String),

    #[error("path '{0}' resolves outside the workspace")]
    PathTraversal(String),

    #[error("file not found in workspace: {0}")]
    FileNotFoundInWorkspace(String),

    #[error("file appears to be binary: {0}")]
    BinaryFile(String),

    #[error("string appears {count} times in {path} — must be unique")]
    AmbiguousMatch { path: String, count: usize },

    #[error("string not found in {0}")]
    StringNotFound(String),

    #[error("timed out acquiring file lock on {0}")]
    LockTimeout(String),

    #[error("command blocked by safety filter: {0}")]
    BlocklistedCommand(String),

    #[error("command timed out after {0} ms")]
    CommandTimeout(u64),

    #[error("provider error ({status}): {message}")]
    ProviderError { status: u16, message: String },

    #[error("provider rate limit exhausted: {0}")]
    ProviderRateLimit(String),

    #[error("tool loop reached max iterations ({0})")]
    MaxIterationsReached(usize),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid permission pattern '{pattern}': {message}")]
    InvalidPermissionPattern { pattern: String, message: String },

    #[error("unknown permission preset: {0}")]
    UnknownPreset(String),

    #[error("hook recursion depth {0} exceeds the maximum")]
    RecursionDepthExceeded(usize),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("outbound message too long: {0} bytes")]
    OutboundTooLong(usize),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("agent error: {0}")]
    Agent(String),
}

impl Error {
    /// Stable kind string for wire payloads (tool results, audit rows).
    ///
    /// These names are part of the external contract — the LLM sees them in
    /// `{"error": "<kind>", "message": ...}` payloads — so they must not
    /// drift with internal type renames.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Http(_) => "Http",
            Error::Json(_) => "Json",
            Error::Store(_) => "Store",
            Error::Config(_) => "Config",
            Error::PermissionDenied(_) => "PermissionDenied",
            Error::AskTimeout(_) => "AskTimeout",
            Error::PathTraversal(_) => "PathTraversal",
            Error::FileNotFoundInWorkspace(_) => "FileNotFoundInWorkspace",
            Error::BinaryFile(_) => "BinaryFile",
            Error::AmbiguousMatch { .. } => "AmbiguousMatch",
            Error::StringNotFound(_) => "StringNotFound",
            Error::LockTimeout(_) => "LockTimeout",
            Error::BlocklistedCommand(_) => "BlocklistedCommand",
            Error::CommandTimeout(_) => "CommandTimeout",
            Error::ProviderError { .. } => "ProviderError",
            Error::ProviderRateLimit(_) => "ProviderRateLimit",
            Error::MaxIterationsReached(_) => "MaxIterationsReached",
            Error::UnknownTool(_) => "UnknownTool",
            Error::InvalidPermissionPattern { .. } => "InvalidPermissionPattern",
            Error::UnknownPreset(_) => "UnknownPreset",
            Error::RecursionDepthExceeded(_) => "RecursionDepthExceeded",
            Error::RateLimited(_) => "RateLimited",
            Error::OutboundTooLong(_) => "OutboundTooLong",
            Error::Cancelled(_) => "Cancelled",
            Error::Agent(_) => "Agent",
        }
    }

    /// Render this error as a tool-result payload the LLM can adapt to.
    pub fn to_tool_payload(&self) -> String {
        serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = Error::PermissionDenied("tool:bash:rm x".into());
        assert_eq!(err.to_string(), "permission denied: tool:bash:rm x");

        let err = Error::MaxIterationsReached(25);
        assert_eq!(err.to_string(), "tool loop reached max iterations (25)");

        let err = Error::AmbiguousMatch {
            path: "a.md".into(),
            count: 3,
        };
        assert_eq!(
            err.to_string(),
            "string appears 3 times in a.md — must be unique"
        );
    }

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(Error::PathTraversal("../x".into()).kind(), "PathTraversal");
        assert_eq!(Error::StringNotFound("f".into()).kind(), "StringNotFound");
        assert_eq!(
            Error::BlocklistedCommand("rm -rf /".into()).kind(),
            "BlocklistedCommand"
        );
        assert_eq!(Error::CommandTimeout(120_000).kind(), "CommandTimeout");
        assert_eq!(Error::AskTimeout("tool:bash:x".into()).kind(), "AskTimeout");
        assert_eq!(Error::Cancelled("branch killed".into()).kind(), "Cancelled");
    }

    #[test]
    fn tool_payload_is_json_with_kind_and_message() {
        let err = Error::LockTimeout("notes.md".into());
        let payload: serde_json::Value = serde_json::from_str(&err.to_tool_payload()).unwrap();
        assert_eq!(payload["error"], "LockTimeout");
        assert!(payload["message"].as_str().unwrap().contains("notes.md"));
    }
}
