//! The canonical tool-call record.
//!
//! `CanonicalToolCall` has no public constructor: the only way to obtain one
//! is through [`crate::Normalizer::normalize`], so every call the agent
//! dispatches has passed name validation and argument parsing.

use serde::Serialize;
use serde_json::{Map, Value};

use omnibridge_core::MessageToolCall;

/// Which extraction strategy produced a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Read from a structured API field.
    Structured,
    /// Found between the backend's call markers.
    Sentinel,
    /// Found in a fenced code block.
    FencedBlock,
    /// Found by scanning for a balanced JSON value. Lowest confidence.
    BraceScan,
}

/// How much a strategy's result can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Structured => "structured",
            Strategy::Sentinel => "sentinel",
            Strategy::FencedBlock => "fenced_block",
            Strategy::BraceScan => "brace_scan",
        }
    }

    pub fn confidence(&self) -> Confidence {
        match self {
            Strategy::Structured | Strategy::Sentinel => Confidence::High,
            Strategy::FencedBlock => Confidence::Medium,
            Strategy::BraceScan => Confidence::Low,
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Validation outcome for a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum CallStatus {
    /// Name matches an active tool and arguments parsed.
    Resolved,
    /// No active tool has this name.
    Unresolved,
    /// Arguments were present but not a JSON object.
    MalformedArguments(String),
}

/// A tool call in canonical form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalToolCall {
    id: String,
    name: String,
    arguments: Map<String, Value>,
    raw_span: Option<(usize, usize)>,
    status: CallStatus,
    strategy: Strategy,
}

impl CanonicalToolCall {
    pub(crate) fn new(
        id: String,
        name: String,
        arguments: Map<String, Value>,
        raw_span: Option<(usize, usize)>,
        status: CallStatus,
        strategy: Strategy,
    ) -> Self {
        Self { id, name, arguments, raw_span, status, strategy }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arguments(&self) -> &Map<String, Value> {
        &self.arguments
    }

    /// Byte range `[start, end)` of the source text the call came from.
    pub fn raw_span(&self) -> Option<(usize, usize)> {
        self.raw_span
    }

    pub fn status(&self) -> &CallStatus {
        &self.status
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn is_resolved(&self) -> bool {
        self.status == CallStatus::Resolved
    }

    pub fn arguments_json(&self) -> String {
        Value::Object(self.arguments.clone()).to_string()
    }

    /// The form stored on an assistant message in history.
    pub fn to_message_call(&self) -> MessageToolCall {
        MessageToolCall {
            id: self.id.clone(),
            name: self.name.clone(),
            arguments: self.arguments_json(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_ordering() {
        assert!(Strategy::Sentinel.confidence() > Strategy::FencedBlock.confidence());
        assert!(Strategy::FencedBlock.confidence() > Strategy::BraceScan.confidence());
        assert_eq!(Strategy::Structured.confidence(), Confidence::High);
    }

    #[test]
    fn message_call_serializes_arguments() {
        let mut args = Map::new();
        args.insert("query".into(), Value::String("x".into()));
        let call = CanonicalToolCall::new(
            "call_0".into(),
            "lookup".into(),
            args,
            None,
            CallStatus::Resolved,
            Strategy::Sentinel,
        );
        let msg = call.to_message_call();
        assert_eq!(msg.arguments, r#"{"query":"x"}"#);
        assert!(call.is_resolved());
    }
}
