//! Tool invocation seam between the agent loop and tool servers.
//!
//! The agent never talks to a tool server directly. It lists definitions and
//! executes calls through [`ToolInvoker`], which `omnibridge-mcp` implements
//! over the Model Context Protocol.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backend::ToolDefinition;

/// The result of a tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The call ID this result is for
    pub tool_call_id: String,

    /// The output content, or a diagnostic when `is_error` is set
    pub content: String,

    /// Whether execution failed
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            is_error: true,
        }
    }
}

/// Executes tool calls on behalf of the agent loop.
///
/// `execute` is infallible by contract: every failure (transport, server
/// error, timeout, unknown tool) comes back as `ToolResult { is_error: true }`
/// so the model can see it on the next generation.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// All tools currently available, in stable order with unique names.
    async fn list_tools(&self) -> Vec<ToolDefinition>;

    /// Execute `name` with `arguments`, answering for `call_id`.
    async fn execute(
        &self,
        call_id: &str,
        name: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> ToolResult;
}
