//! Sentinel markers for prompt-engineered tool calling.
//!
//! These strings are a stable contract shared by the prompt renderer and the
//! normalizer's first strategy. Changing a default breaks parsing of any
//! model fine-tuned or prompted against it.

use serde::{Deserialize, Serialize};

/// Opens one tool's JSON schema in the system prompt.
pub const TOOL_SCHEMA_OPEN: &str = "<|tool|>";
/// Closes one tool's JSON schema.
pub const TOOL_SCHEMA_CLOSE: &str = "<|/tool|>";
/// Opens an emitted call array.
pub const TOOL_CALL_OPEN: &str = "<|tool_call|>";
/// Closes an emitted call array.
pub const TOOL_CALL_CLOSE: &str = "<|/tool_call|>";

/// Call markers emitted by native-tool (Hermes/Qwen style) runtimes.
pub const NATIVE_CALL_OPEN: &str = "<tool_call>";
pub const NATIVE_CALL_CLOSE: &str = "</tool_call>";

/// The two marker pairs used by a prompt-engineered backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentinelMarkers {
    #[serde(default = "default_schema_open")]
    pub schema_open: String,
    #[serde(default = "default_schema_close")]
    pub schema_close: String,
    #[serde(default = "default_call_open")]
    pub call_open: String,
    #[serde(default = "default_call_close")]
    pub call_close: String,
}

fn default_schema_open() -> String {
    TOOL_SCHEMA_OPEN.into()
}
fn default_schema_close() -> String {
    TOOL_SCHEMA_CLOSE.into()
}
fn default_call_open() -> String {
    TOOL_CALL_OPEN.into()
}
fn default_call_close() -> String {
    TOOL_CALL_CLOSE.into()
}

impl Default for SentinelMarkers {
    fn default() -> Self {
        Self {
            schema_open: default_schema_open(),
            schema_close: default_schema_close(),
            call_open: default_call_open(),
            call_close: default_call_close(),
        }
    }
}

impl SentinelMarkers {
    /// Markers for runtimes that only define a call pair.
    pub fn native() -> Self {
        Self {
            schema_open: "<tools>".into(),
            schema_close: "</tools>".into(),
            call_open: NATIVE_CALL_OPEN.into(),
            call_close: NATIVE_CALL_CLOSE.into(),
        }
    }

    /// Replace the call pair, keeping the schema pair.
    pub fn with_call_markers(mut self, open: impl Into<String>, close: impl Into<String>) -> Self {
        self.call_open = open.into();
        self.call_close = close.into();
        self
    }

    pub fn wrap_schema(&self, schema_json: &str) -> String {
        format!("{}{}{}", self.schema_open, schema_json, self.schema_close)
    }

    pub fn wrap_calls(&self, calls_json: &str) -> String {
        format!("{}{}{}", self.call_open, calls_json, self.call_close)
    }
}
