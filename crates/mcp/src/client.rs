//! Aggregates MCP sessions into one tool surface for the agent.
//!
//! Tool names are global across servers. When two servers expose the same
//! name, the server connected first owns it and the later one is shadowed
//! (logged at connect time).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use omnibridge_config::{McpConfig, ToolServerConfig};
use omnibridge_core::{ToolDefinition, ToolError, ToolInvoker, ToolResult};
use omnibridge_normalizer::{CallStatus, CanonicalToolCall};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::session::{Endpoint, McpSession};
use crate::transport::Transport;

pub struct ToolProtocolClient {
    sessions: RwLock<Vec<Arc<McpSession>>>,
    call_timeout: Duration,
    connect_timeout: Duration,
}

impl Default for ToolProtocolClient {
    fn default() -> Self {
        Self::new(&McpConfig::default())
    }
}

impl ToolProtocolClient {
    pub fn new(config: &McpConfig) -> Self {
        Self {
            sessions: RwLock::new(Vec::new()),
            call_timeout: Duration::from_secs(config.call_timeout_secs),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        }
    }

    /// Connect every configured server, in order. The first failure aborts.
    pub async fn connect_all(&self, servers: &[ToolServerConfig]) -> Result<(), ToolError> {
        for server in servers {
            self.connect(server).await?;
        }
        Ok(())
    }

    /// Start, handshake with, and register one server.
    pub async fn connect(&self, server: &ToolServerConfig) -> Result<(), ToolError> {
        let endpoint = Endpoint::from_config(server)?;
        let session = McpSession::connect(&server.name, &endpoint, self.connect_timeout, self.call_timeout).await?;
        self.register(session).await
    }

    /// Handshake over a caller-provided transport and register the session.
    pub async fn attach(&self, name: &str, transport: Box<dyn Transport>) -> Result<(), ToolError> {
        let session = McpSession::start(name, transport, self.connect_timeout).await?;
        self.register(session).await
    }

    async fn register(&self, session: McpSession) -> Result<(), ToolError> {
        let mut sessions = self.sessions.write().await;
        if sessions.iter().any(|s| s.name() == session.name()) {
            let _ = session.close().await;
            return Err(ToolError::ConnectionFailed {
                server: session.name().to_string(),
                reason: "a server with this name is already connected".into(),
            });
        }

        for tool in session.tools() {
            if let Some(owner) = sessions.iter().find(|s| s.has_tool(&tool.name)) {
                warn!(
                    tool = %tool.name,
                    owner = %owner.name(),
                    shadowed = %session.name(),
                    "Duplicate tool name; keeping the first registration"
                );
            }
        }

        sessions.push(Arc::new(session));
        Ok(())
    }

    /// Names of connected servers, in connection order.
    pub async fn servers(&self) -> Vec<String> {
        self.sessions.read().await.iter().map(|s| s.name().to_string()).collect()
    }

    /// Every reachable tool, first registration winning on name clashes.
    pub async fn list_tools(&self) -> Vec<ToolDefinition> {
        let sessions = self.sessions.read().await;
        let mut seen = HashSet::new();
        sessions
            .iter()
            .flat_map(|s| s.tools().iter())
            .filter(|t| seen.insert(t.name.clone()))
            .cloned()
            .collect()
    }

    /// Name of the server that calls to `tool` are routed to.
    pub async fn tool_owner(&self, tool: &str) -> Option<String> {
        self.owner_of(tool).await.map(|s| s.name().to_string())
    }

    async fn owner_of(&self, tool: &str) -> Option<Arc<McpSession>> {
        self.sessions.read().await.iter().find(|s| s.has_tool(tool)).cloned()
    }

    /// Execute a normalized call. Never fails: every problem is reported in
    /// the returned [`ToolResult`].
    pub async fn execute(&self, call: &CanonicalToolCall) -> ToolResult {
        if let CallStatus::MalformedArguments(detail) = call.status() {
            return ToolResult::error(call.id(), format!("Invalid JSON arguments: {detail}"));
        }
        self.dispatch(call.id(), call.name(), call.arguments().clone()).await
    }

    async fn dispatch(&self, call_id: &str, name: &str, arguments: Map<String, Value>) -> ToolResult {
        let Some(session) = self.owner_of(name).await else {
            warn!(tool = name, "Call to unknown tool");
            return ToolResult::error(call_id, format!("Tool not found: {name}"));
        };

        debug!(tool = name, server = %session.name(), call_id, "Executing tool");
        let outcome = tokio::time::timeout(self.call_timeout, session.call_tool(name, arguments)).await;

        match outcome {
            Ok(Ok(result)) => {
                let text = result.text();
                if result.is_error {
                    info!(tool = name, server = %session.name(), "Tool reported an error");
                    ToolResult::error(call_id, text)
                } else {
                    debug!(tool = name, output_len = text.len(), "Tool succeeded");
                    ToolResult::success(call_id, text)
                }
            }
            Ok(Err(e)) => {
                warn!(tool = name, server = %session.name(), error = %e, "Tool call failed");
                ToolResult::error(call_id, format!("Error: {e}"))
            }
            Err(_) => {
                let err = ToolError::Timeout {
                    tool_name: name.to_string(),
                    timeout_secs: self.call_timeout.as_secs(),
                };
                warn!(tool = name, server = %session.name(), "Tool call timed out");
                ToolResult::error(call_id, format!("Error: {err}"))
            }
        }
    }

    /// Close every session. The client can be reused afterwards.
    pub async fn disconnect(&self) {
        let sessions: Vec<_> = self.sessions.write().await.drain(..).collect();
        for session in sessions {
            if let Err(e) = session.close().await {
                warn!(server = %session.name(), error = %e, "Error closing tool server");
            }
        }
    }
}

#[async_trait]
impl ToolInvoker for ToolProtocolClient {
    async fn list_tools(&self) -> Vec<ToolDefinition> {
        ToolProtocolClient::list_tools(self).await
    }

    async fn execute(&self, call_id: &str, name: &str, arguments: Map<String, Value>) -> ToolResult {
        self.dispatch(call_id, name, arguments).await
    }
}
