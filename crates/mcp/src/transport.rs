//! Byte-level channels to an MCP server.
//!
//! Two transports are supported:
//! - [`StdioTransport`]: a child process speaking newline-delimited JSON-RPC
//!   on stdin/stdout.
//! - [`HttpTransport`]: the streamable HTTP transport (POST per message,
//!   replies as JSON or a single-shot SSE stream).

use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use omnibridge_core::ToolError;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, RwLock, oneshot};
use tracing::{debug, trace, warn};

use crate::protocol::{JsonRpcError, JsonRpcMessage, JsonRpcRequest};

/// A request/response channel to one server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for its result.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ToolError>;

    /// Send a notification (no response expected).
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ToolError>;

    /// Release the underlying process or session. Idempotent.
    async fn close(&self) -> Result<(), ToolError>;
}

fn rpc_error(err: JsonRpcError) -> ToolError {
    ToolError::Rpc { code: err.code, message: err.message }
}

// ── Stdio ──

/// Waiters keyed by request id. Held briefly and never across an await.
type Pending = Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<JsonRpcMessage>>>>;

fn lock_pending(pending: &Pending) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<JsonRpcMessage>>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

/// Owns one request's pending slot and frees it however the wait ends,
/// including when the caller's timeout drops the request future.
struct PendingSlot {
    pending: Pending,
    id: u64,
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        lock_pending(&self.pending).remove(&self.id);
    }
}

pub struct StdioTransport {
    command: String,
    stdin: Mutex<ChildStdin>,
    child: Mutex<Option<Child>>,
    pending: Pending,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
}

impl StdioTransport {
    /// Spawn `command` and start reading its stdout.
    pub fn spawn(command: &str, args: &[String], env: &BTreeMap<String, String>) -> Result<Self, ToolError> {
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::Transport(format!("failed to spawn '{command}': {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ToolError::Transport("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ToolError::Transport("child stdout unavailable".into()))?;

        let pending: Pending = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader_pending = pending.clone();
        let reader_closed = closed.clone();
        let label = command.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        trace!(server = %label, line, "recv");
                        let message: JsonRpcMessage = match serde_json::from_str(line) {
                            Ok(m) => m,
                            Err(e) => {
                                warn!(server = %label, error = %e, "Ignoring non-JSON-RPC output");
                                continue;
                            }
                        };
                        match message.response_id() {
                            Some(id) => {
                                let waiter = lock_pending(&reader_pending).remove(&id);
                                if let Some(tx) = waiter {
                                    let _ = tx.send(message);
                                } else {
                                    debug!(server = %label, id, "Response for unknown request");
                                }
                            }
                            None => debug!(server = %label, method = ?message.method, "Server-initiated message ignored"),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(server = %label, error = %e, "Read from tool server failed");
                        break;
                    }
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
            // Dropping the senders wakes every waiter with a closed error.
            lock_pending(&reader_pending).clear();
            debug!(server = %label, "Tool server stdout closed");
        });

        Ok(Self {
            command: command.to_string(),
            stdin: Mutex::new(stdin),
            child: Mutex::new(Some(child)),
            pending,
            next_id: AtomicU64::new(1),
            closed,
        })
    }

    async fn write(&self, message: &JsonRpcRequest) -> Result<(), ToolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ToolError::Closed);
        }
        let mut line = serde_json::to_string(message).map_err(|e| ToolError::Protocol(e.to_string()))?;
        line.push('\n');
        trace!(server = %self.command, line = line.trim_end(), "send");

        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ToolError::Transport(format!("write to '{}' failed: {e}", self.command)))?;
        stdin
            .flush()
            .await
            .map_err(|e| ToolError::Transport(format!("flush to '{}' failed: {e}", self.command)))
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ToolError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, tx);
        let _slot = PendingSlot { pending: self.pending.clone(), id };

        self.write(&JsonRpcRequest::new(id, method, params)).await?;
        let message = rx.await.map_err(|_| ToolError::Closed)?;
        message.into_result().map_err(rpc_error)
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ToolError> {
        self.write(&JsonRpcRequest::notification(method, params)).await
    }

    async fn close(&self) -> Result<(), ToolError> {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(mut child) = self.child.lock().await.take() {
            debug!(server = %self.command, "Stopping tool server");
            if let Err(e) = child.kill().await {
                warn!(server = %self.command, error = %e, "Failed to kill tool server");
            }
        }
        lock_pending(&self.pending).clear();
        Ok(())
    }
}

// ── Streamable HTTP ──

const SESSION_HEADER: &str = "Mcp-Session-Id";

pub struct HttpTransport {
    url: String,
    client: reqwest::Client,
    session_id: RwLock<Option<String>>,
    next_id: AtomicU64,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            url: url.into(),
            client,
            session_id: RwLock::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post(&self, message: &JsonRpcRequest) -> Result<reqwest::Response, ToolError> {
        let mut req = self
            .client
            .post(&self.url)
            .header("Accept", "application/json, text/event-stream")
            .json(message);
        if let Some(session) = self.session_id.read().await.as_deref() {
            req = req.header(SESSION_HEADER, session);
        }

        let response = req
            .send()
            .await
            .map_err(|e| ToolError::Transport(format!("POST {} failed: {e}", self.url)))?;

        if let Some(session) = response.headers().get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
            let mut current = self.session_id.write().await;
            if current.as_deref() != Some(session) {
                debug!(url = %self.url, session, "MCP session established");
                *current = Some(session.to_string());
            }
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ToolError::Transport(format!("HTTP {status}: {body}")));
        }
        Ok(response)
    }
}

/// Find the response to `id` among the `data:` lines of an SSE body.
fn response_from_sse(body: &str, id: u64) -> Option<JsonRpcMessage> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .filter_map(|data| serde_json::from_str::<JsonRpcMessage>(data.trim()).ok())
        .find(|message| message.response_id() == Some(id))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ToolError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let response = self.post(&JsonRpcRequest::new(id, method, params)).await?;

        let is_sse = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
        let body = response
            .text()
            .await
            .map_err(|e| ToolError::Transport(format!("reading response failed: {e}")))?;

        let message = if is_sse {
            response_from_sse(&body, id)
                .ok_or_else(|| ToolError::Protocol(format!("no response for request {id} in event stream")))?
        } else {
            serde_json::from_str::<JsonRpcMessage>(&body)
                .map_err(|e| ToolError::Protocol(format!("invalid JSON-RPC response: {e}")))?
        };
        message.into_result().map_err(rpc_error)
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ToolError> {
        self.post(&JsonRpcRequest::notification(method, params)).await.map(|_| ())
    }

    async fn close(&self) -> Result<(), ToolError> {
        let Some(session) = self.session_id.write().await.take() else {
            return Ok(());
        };
        // Servers may refuse explicit termination (405); that is fine.
        if let Err(e) = self.client.delete(&self.url).header(SESSION_HEADER, session).send().await {
            debug!(url = %self.url, error = %e, "Session termination failed");
        }
        Ok(())
    }
}
