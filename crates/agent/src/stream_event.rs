//! Agent-level streaming events.
//!
//! `AgentStreamEvent` lifts backend fragments and tool activity into events
//! a front end can render as they happen.

use serde::{Deserialize, Serialize};

/// Events emitted during [`AgentLoop::run_turn_streaming`](crate::AgentLoop::run_turn_streaming).
///
/// - `chunk`: partial text from the backend (raw, before normalization)
/// - `tool_call`: a normalized call is about to be dispatched
/// - `tool_result`: the call produced a result
/// - `done`: the turn finished
/// - `error`: the turn failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentStreamEvent {
    Chunk { content: String },

    ToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
        /// Normalizer strategy that found the call
        strategy: String,
    },

    ToolResult {
        id: String,
        name: String,
        output: String,
        is_error: bool,
    },

    Done {
        session_id: String,
        generations: u32,
        tool_calls_made: usize,
        truncated: bool,
    },

    Error { message: String },
}

impl AgentStreamEvent {
    /// Short event name, matching the serialized `type` tag.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Chunk { .. } => "chunk",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_serializes_with_type_tag() {
        let event = AgentStreamEvent::Chunk { content: "Hello".into() };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"chunk""#));
        assert!(json.contains(r#""content":"Hello""#));
    }

    #[test]
    fn tool_call_carries_strategy() {
        let event = AgentStreamEvent::ToolCall {
            id: "call_0".into(),
            name: "book_flight".into(),
            input: serde_json::json!({"destination": "Paris"}),
            strategy: "sentinel".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"tool_call""#));
        assert!(json.contains(r#""strategy":"sentinel""#));
    }

    #[test]
    fn done_reports_truncation() {
        let event = AgentStreamEvent::Done {
            session_id: "abc".into(),
            generations: 3,
            tool_calls_made: 3,
            truncated: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""truncated":true"#));
        assert_eq!(event.event_type(), "done");
    }

    #[test]
    fn round_trips_through_json() {
        let json = r#"{"type":"tool_result","id":"c1","name":"lookup","output":"boom","is_error":true}"#;
        let event: AgentStreamEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.event_type(), "tool_result");
        match event {
            AgentStreamEvent::ToolResult { is_error, .. } => assert!(is_error),
            _ => panic!("Wrong variant"),
        }
    }
}
