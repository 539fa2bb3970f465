//! One initialized MCP session with a tool server.

use std::collections::BTreeMap;
use std::time::Duration;

use omnibridge_config::{ToolServerConfig, TransportKind};
use omnibridge_core::{ToolDefinition, ToolError};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::protocol::{
    CallToolResult, ListToolsResult, METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_TOOLS_CALL,
    METHOD_TOOLS_LIST, McpTool, initialize_params,
};
use crate::transport::{HttpTransport, StdioTransport, Transport};

/// Upper bound on `tools/list` pages, in case a server keeps handing out cursors.
const MAX_LIST_PAGES: usize = 64;

/// Where a tool server lives.
#[derive(Debug, Clone, PartialEq)]
pub enum Endpoint {
    Stdio {
        command: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
    },
    Http {
        url: String,
    },
}

impl Endpoint {
    pub fn from_config(config: &ToolServerConfig) -> Result<Self, ToolError> {
        let missing = |what: &str| ToolError::ConnectionFailed {
            server: config.name.clone(),
            reason: format!("{what} not configured"),
        };
        match config.transport {
            TransportKind::Stdio => Ok(Endpoint::Stdio {
                command: config.command.clone().ok_or_else(|| missing("command"))?,
                args: config.args.clone(),
                env: config.env.clone(),
            }),
            TransportKind::Http => Ok(Endpoint::Http {
                url: config.url.clone().ok_or_else(|| missing("url"))?,
            }),
        }
    }

    /// Start the process or prepare the HTTP client.
    pub fn open(&self, request_timeout: Duration) -> Result<Box<dyn Transport>, ToolError> {
        match self {
            Endpoint::Stdio { command, args, env } => Ok(Box::new(StdioTransport::spawn(command, args, env)?)),
            Endpoint::Http { url } => Ok(Box::new(HttpTransport::new(url.clone(), request_timeout))),
        }
    }
}

pub struct McpSession {
    name: String,
    transport: Box<dyn Transport>,
    tools: Vec<ToolDefinition>,
    server_info: Value,
}

impl std::fmt::Debug for McpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpSession")
            .field("name", &self.name)
            .field("tools", &self.tools.len())
            .finish()
    }
}

impl McpSession {
    /// Open `endpoint` and complete the handshake within `connect_timeout`.
    pub async fn connect(
        name: &str,
        endpoint: &Endpoint,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, ToolError> {
        let transport = endpoint.open(request_timeout).map_err(|e| ToolError::ConnectionFailed {
            server: name.to_string(),
            reason: e.to_string(),
        })?;
        Self::start(name, transport, connect_timeout).await
    }

    /// Handshake over an already open transport. On failure the transport
    /// is closed before the error is returned.
    pub async fn start(name: &str, transport: Box<dyn Transport>, connect_timeout: Duration) -> Result<Self, ToolError> {
        let handshake = tokio::time::timeout(connect_timeout, handshake(transport.as_ref())).await;
        let failure = match handshake {
            Ok(Ok((server_info, tools))) => {
                info!(
                    server = name,
                    tools = tools.len(),
                    server_name = server_info.get("name").and_then(serde_json::Value::as_str).unwrap_or("unknown"),
                    "Connected to tool server"
                );
                return Ok(Self {
                    name: name.to_string(),
                    transport,
                    tools,
                    server_info,
                });
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("handshake timed out after {}s", connect_timeout.as_secs()),
        };

        warn!(server = name, reason = %failure, "Tool server handshake failed");
        if let Err(e) = transport.close().await {
            debug!(server = name, error = %e, "Close after failed handshake");
        }
        Err(ToolError::ConnectionFailed { server: name.to_string(), reason: failure })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tools cached at handshake time, in server order.
    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    pub fn has_tool(&self, tool: &str) -> bool {
        self.tools.iter().any(|t| t.name == tool)
    }

    /// `serverInfo` from the initialize result.
    pub fn server_info(&self) -> &Value {
        &self.server_info
    }

    pub async fn call_tool(&self, tool: &str, arguments: Map<String, Value>) -> Result<CallToolResult, ToolError> {
        debug!(server = %self.name, tool, "tools/call");
        let params = serde_json::json!({ "name": tool, "arguments": arguments });
        let result = self.transport.request(METHOD_TOOLS_CALL, Some(params)).await?;
        serde_json::from_value(result).map_err(|e| ToolError::Protocol(format!("malformed tools/call result: {e}")))
    }

    pub async fn close(&self) -> Result<(), ToolError> {
        debug!(server = %self.name, "Closing session");
        self.transport.close().await
    }
}

async fn handshake(transport: &dyn Transport) -> Result<(Value, Vec<ToolDefinition>), ToolError> {
    let init = transport.request(METHOD_INITIALIZE, Some(initialize_params())).await?;
    if init.get("protocolVersion").is_none() {
        return Err(ToolError::Protocol("initialize result lacks protocolVersion".into()));
    }
    let server_info = init.get("serverInfo").cloned().unwrap_or(Value::Null);
    transport.notify(METHOD_INITIALIZED, None).await?;

    let tools = list_all_tools(transport).await?;
    Ok((server_info, tools))
}

async fn list_all_tools(transport: &dyn Transport) -> Result<Vec<ToolDefinition>, ToolError> {
    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_LIST_PAGES {
        let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
        let value = transport.request(METHOD_TOOLS_LIST, params).await?;
        let page: ListToolsResult =
            serde_json::from_value(value).map_err(|e| ToolError::Protocol(format!("malformed tools/list result: {e}")))?;
        tools.extend(page.tools.into_iter().map(McpTool::into_definition));

        match page.next_cursor {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => return Ok(tools),
        }
    }
    warn!(pages = MAX_LIST_PAGES, "tools/list pagination did not terminate");
    Ok(tools)
}
