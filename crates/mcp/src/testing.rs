//! In-memory MCP server for unit tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use omnibridge_core::ToolError;
use serde_json::{Value, json};

use crate::transport::Transport;

#[derive(Default)]
struct LogInner {
    methods: Vec<String>,
    calls: Vec<Value>,
    closed: bool,
}

/// Shared view of what a [`MockServer`] received.
#[derive(Clone, Default)]
pub(crate) struct MockLog(Arc<Mutex<LogInner>>);

impl MockLog {
    pub(crate) fn methods(&self) -> Vec<String> {
        self.0.lock().unwrap().methods.clone()
    }

    pub(crate) fn calls(&self) -> Vec<Value> {
        self.0.lock().unwrap().calls.clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.0.lock().unwrap().closed
    }
}

/// Tool behavior is keyed on the tool name:
/// `fail` reports `isError`, `explode` returns a JSON-RPC error, `slow`
/// sleeps a minute, anything else echoes `server:tool:arguments`.
pub(crate) struct MockServer {
    name: String,
    tools: Vec<String>,
    page_size: usize,
    fail_initialize: bool,
    delay: Option<Duration>,
    log: MockLog,
}

impl MockServer {
    pub(crate) fn new(name: &str, tools: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            tools: tools.iter().map(|t| t.to_string()).collect(),
            page_size: usize::MAX,
            fail_initialize: false,
            delay: None,
            log: MockLog::default(),
        }
    }

    pub(crate) fn page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    pub(crate) fn fail_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    /// Delay applied to `initialize`.
    pub(crate) fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn log(&self) -> MockLog {
        self.log.clone()
    }

    fn list_page(&self, params: Option<&Value>) -> Value {
        let start: usize = params
            .and_then(|p| p.get("cursor"))
            .and_then(Value::as_str)
            .and_then(|c| c.parse().ok())
            .unwrap_or(0);
        let end = start.saturating_add(self.page_size).min(self.tools.len());
        let tools: Vec<Value> = self.tools[start..end]
            .iter()
            .map(|t| json!({ "name": t, "description": format!("{t} on {}", self.name), "inputSchema": {"type": "object"} }))
            .collect();
        if end < self.tools.len() {
            json!({ "tools": tools, "nextCursor": end.to_string() })
        } else {
            json!({ "tools": tools })
        }
    }
}

#[async_trait]
impl Transport for MockServer {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ToolError> {
        {
            let mut log = self.log.0.lock().unwrap();
            if log.closed {
                return Err(ToolError::Closed);
            }
            log.methods.push(method.to_string());
        }

        match method {
            "initialize" => {
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                if self.fail_initialize {
                    return Err(ToolError::Rpc { code: -32603, message: "init failed".into() });
                }
                Ok(json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": self.name, "version": "0.0.1" }
                }))
            }
            "tools/list" => Ok(self.list_page(params.as_ref())),
            "tools/call" => {
                let params = params.unwrap_or(Value::Null);
                self.log.0.lock().unwrap().calls.push(params.clone());
                let tool = params["name"].as_str().unwrap_or_default().to_string();
                match tool.as_str() {
                    "fail" => Ok(json!({ "content": [{"type": "text", "text": "boom"}], "isError": true })),
                    "explode" => Err(ToolError::Rpc { code: -32000, message: "exploded".into() }),
                    "slow" => {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(json!({ "content": [{"type": "text", "text": "late"}] }))
                    }
                    _ => Ok(json!({
                        "content": [{"type": "text", "text": format!("{}:{}:{}", self.name, tool, params["arguments"])}],
                        "isError": false
                    })),
                }
            }
            other => Err(ToolError::Rpc { code: -32601, message: format!("Method not found: {other}") }),
        }
    }

    async fn notify(&self, method: &str, _params: Option<Value>) -> Result<(), ToolError> {
        self.log.0.lock().unwrap().methods.push(method.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<(), ToolError> {
        self.log.0.lock().unwrap().closed = true;
        Ok(())
    }
}
