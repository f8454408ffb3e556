use serde::{Deserialize, Serialize};

use crate::llm::types::{StopReason, Usage};

/// Structured events emitted during a branch's tool loop.
///
/// Emitted synchronously via the [`OnEvent`] callback; handler panics are
/// caught and logged by the loop, never propagated. Keep handlers fast.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    LlmCallStart {
        agent: String,
        branch: u64,
        iteration: usize,
    },

    LlmCallComplete {
        agent: String,
        branch: u64,
        iteration: usize,
        usage: Usage,
        total_usage: Usage,
        stop_reason: StopReason,
        tool_call_count: usize,
        latency_ms: u64,
    },

    ToolCallStart {
        agent: String,
        branch: u64,
        tool: String,
        tool_call_id: String,
        /// The action string submitted to the permission engine.
        action: String,
    },

    ToolCallComplete {
        agent: String,
        branch: u64,
        tool: String,
        tool_call_id: String,
        is_error: bool,
        duration_ms: u64,
    },

    PermissionAsk {
        agent: String,
        branch: u64,
        action: String,
        approved: bool,
    },

    LoopComplete {
        agent: String,
        branch: u64,
        iterations: usize,
        tool_calls_made: usize,
        total_usage: Usage,
        truncated: bool,
    },
}

/// Callback type for receiving loop events.
pub type OnEvent = dyn Fn(LoopEvent) + Send + Sync;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_tagged() {
        let event = LoopEvent::ToolCallStart {
            agent: "alpha".into(),
            branch: 1,
            tool: "view".into(),
            tool_call_id: "c1".into(),
            action: "tool:view:README.md".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"tool_call_start""#));
        assert!(json.contains(r#""action":"tool:view:README.md""#));
    }

    #[test]
    fn events_roundtrip() {
        let events = vec![
            LoopEvent::LlmCallStart {
                agent: "a".into(),
                branch: 1,
                iteration: 1,
            },
            LoopEvent::LlmCallComplete {
                agent: "a".into(),
                branch: 1,
                iteration: 1,
                usage: Usage::default(),
                total_usage: Usage::default(),
                stop_reason: StopReason::EndTurn,
                tool_call_count: 0,
                latency_ms: 12,
            },
            LoopEvent::ToolCallComplete {
                agent: "a".into(),
                branch: 1,
                tool: "bash".into(),
                tool_call_id: "c".into(),
                is_error: true,
                duration_ms: 5,
            },
            LoopEvent::PermissionAsk {
                agent: "a".into(),
                branch: 1,
                action: "tool:bash:rm tmp.txt".into(),
                approved: false,
            },
            LoopEvent::LoopComplete {
                agent: "a".into(),
                branch: 1,
                iterations: 3,
                tool_calls_made: 2,
                total_usage: Usage::default(),
                truncated: false,
            },
        ];
        for event in events {
            let json = serde_json::to_string(&event).unwrap();
            let _back: LoopEvent = serde_json::from_str(&json).unwrap();
        }
    }
}
