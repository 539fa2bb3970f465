//! Remote backend for OpenAI-compatible chat completion APIs.
//!
//! Works with OpenAI, OpenRouter, Ollama, vLLM, and any endpoint exposing
//! `/v1/chat/completions`. Tool calls come back in the structured
//! `tool_calls` field and are passed through untouched; the normalizer
//! never scrapes this backend's text.
//!
//! Supports:
//! - Chat completions (non-streaming and streaming SSE)
//! - Image parts as `data:` URLs
//! - Tool use / function calling

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use omnibridge_core::backend::ensure_modalities;
use omnibridge_core::error::BackendError;
use omnibridge_core::message::{ContentPart, Message, MessageContent, Role};
use omnibridge_core::{Backend, BackendKind, GenerateConfig, Modality, ProviderToolCall, RawFragment, RawOutput, ToolDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace, warn};

const TEXT_AND_IMAGE: &[Modality] = &[Modality::Text, Modality::Image];
const TEXT_ONLY: &[Modality] = &[Modality::Text];

/// A backend talking to an OpenAI-compatible HTTP endpoint.
pub struct OpenAiCompatBackend {
    name: String,
    base_url: String,
    api_key: Option<String>,
    vision: bool,
    client: reqwest::Client,
}

impl OpenAiCompatBackend {
    /// Create a new remote backend.
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            vision: true,
            client: build_client(Duration::from_secs(120)),
        }
    }

    /// Create an OpenAI backend (convenience constructor).
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self::new("openai", "https://api.openai.com/v1", Some(api_key.into()))
    }

    /// Create an Ollama backend (convenience constructor).
    pub fn ollama(base_url: Option<&str>) -> Self {
        Self::new("ollama", base_url.unwrap_or("http://localhost:11434/v1"), None)
    }

    /// Whether image parts are forwarded. Text-only models reject them up front.
    pub fn with_vision(mut self, vision: bool) -> Self {
        self.vision = vision;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = build_client(timeout);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {key}")),
            None => builder,
        }
    }

    fn request_body(
        &self,
        history: &[Message],
        tools: &[ToolDefinition],
        config: &GenerateConfig,
        stream: bool,
    ) -> Value {
        let mut body = serde_json::json!({
            "model": config.model,
            "messages": to_api_messages(history),
            "temperature": config.temperature,
            "stream": stream,
        });

        if let Some(max_tokens) = config.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        if !tools.is_empty() {
            body["tools"] = serde_json::json!(to_api_tools(tools));
            body["tool_choice"] = serde_json::json!("auto");
        }

        if !config.stop.is_empty() {
            body["stop"] = serde_json::json!(config.stop);
        }

        body
    }

    async fn post(&self, body: &Value, stream: bool) -> Result<reqwest::Response, BackendError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self
            .authorized(self.client.post(&url))
            .header("Content-Type", "application/json");
        if stream {
            builder = builder.header("Accept", "text/event-stream");
        }

        let response = builder.json(body).send().await.map_err(|e| map_send_err(&url, e))?;
        check_status(response).await
    }
}

fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

fn map_send_err(url: &str, e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Unavailable(format!("request to {url} timed out: {e}"))
    } else {
        BackendError::Unavailable(format!("cannot reach {url}: {e}"))
    }
}

/// Map non-success statuses onto the backend error taxonomy.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = response.status().as_u16();
    match status {
        200..=299 => Ok(response),
        429 => Err(BackendError::RateLimited { retry_after_secs: 5 }),
        401 | 403 => Err(BackendError::AuthenticationFailed(
            "Invalid API key or insufficient permissions".into(),
        )),
        404 => {
            let body = response.text().await.unwrap_or_default();
            Err(BackendError::ModelNotFound(body))
        }
        _ => {
            let body = response.text().await.unwrap_or_default();
            warn!(status, body = %body, "Backend returned error");
            Err(BackendError::ApiError { status_code: status, message: body })
        }
    }
}

/// Convert history to OpenAI wire messages.
fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
    messages
        .iter()
        .map(|m| {
            let content = match &m.content {
                MessageContent::Text(t) if t.is_empty() && !m.tool_calls.is_empty() => None,
                MessageContent::Text(t) => Some(Value::String(t.clone())),
                MessageContent::Parts(parts) => Some(Value::Array(parts.iter().map(to_api_part).collect())),
            };
            ApiMessage {
                role: m.role.as_str().to_string(),
                content,
                tool_calls: if m.tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        m.tool_calls
                            .iter()
                            .map(|tc| ApiToolCall {
                                id: tc.id.clone(),
                                r#type: "function".into(),
                                function: ApiFunction {
                                    name: tc.name.clone(),
                                    arguments: tc.arguments.clone(),
                                },
                            })
                            .collect(),
                    )
                },
                tool_call_id: if m.role == Role::Tool { m.tool_call_id.clone() } else { None },
            }
        })
        .collect()
}

fn to_api_part(part: &ContentPart) -> Value {
    match part {
        ContentPart::Text { text } => serde_json::json!({ "type": "text", "text": text }),
        ContentPart::Image { .. } => serde_json::json!({
            "type": "image_url",
            "image_url": { "url": part.data_url().unwrap_or_default() },
        }),
    }
}

/// Convert tool definitions to OpenAI API format.
fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
    tools
        .iter()
        .map(|t| ApiToolDefinition {
            r#type: "function".into(),
            function: ApiToolFunction {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            },
        })
        .collect()
}

#[async_trait]
impl Backend for OpenAiCompatBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn modalities(&self) -> &[Modality] {
        if self.vision { TEXT_AND_IMAGE } else { TEXT_ONLY }
    }

    async fn generate(
        &self,
        history: &[Message],
        tools: &[ToolDefinition],
        config: &GenerateConfig,
    ) -> Result<RawOutput, BackendError> {
        ensure_modalities(&self.name, self.modalities(), history)?;
        let body = self.request_body(history, tools, config, false);

        debug!(backend = %self.name, model = %config.model, tools = tools.len(), "Sending completion request");

        let response = self.post(&body, false).await?;
        let api_response: ApiResponse = response.json().await.map_err(|e| BackendError::ApiError {
            status_code: 200,
            message: format!("Failed to parse response: {e}"),
        })?;

        let choice = api_response.choices.into_iter().next().ok_or_else(|| BackendError::ApiError {
            status_code: 200,
            message: "No choices in response".into(),
        })?;

        let text = choice.message.content.unwrap_or_default();
        let tool_calls: Vec<ProviderToolCall> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ProviderToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: tc.function.arguments,
            })
            .collect();

        if tool_calls.is_empty() {
            Ok(RawOutput::Text(text))
        } else {
            Ok(RawOutput::Structured { text, tool_calls })
        }
    }

    async fn generate_stream(
        &self,
        history: &[Message],
        tools: &[ToolDefinition],
        config: &GenerateConfig,
    ) -> Result<tokio::sync::mpsc::Receiver<Result<RawFragment, BackendError>>, BackendError> {
        ensure_modalities(&self.name, self.modalities(), history)?;
        let body = self.request_body(history, tools, config, true);

        debug!(backend = %self.name, model = %config.model, "Sending streaming request");

        let response = self.post(&body, true).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let backend_name = self.name.clone();

        // Read the SSE byte stream on a separate task
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut sse = SseAccumulator::default();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let err = if e.is_timeout() {
                            BackendError::Timeout(e.to_string())
                        } else {
                            BackendError::StreamInterrupted(e.to_string())
                        };
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                };

                for delta in sse.push(&bytes) {
                    let fragment = RawFragment { text: Some(delta), ..Default::default() };
                    if tx.send(Ok(fragment)).await.is_err() {
                        return; // receiver dropped
                    }
                }

                if sse.is_done() {
                    break;
                }
            }

            trace!(backend = %backend_name, "SSE stream finished");
            let _ = tx
                .send(Ok(RawFragment { text: None, tool_calls: sse.finish(), done: true }))
                .await;
        });

        Ok(rx)
    }

    async fn health_check(&self) -> Result<bool, BackendError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|e| map_send_err(&url, e))?;

        Ok(response.status().is_success())
    }
}

// ── SSE parsing ──

/// Line-buffered parser for a chat-completions SSE body.
///
/// Text deltas are returned as they complete; tool-call deltas are
/// accumulated by index and released once by [`SseAccumulator::finish`].
#[derive(Default)]
pub(crate) struct SseAccumulator {
    buffer: Vec<u8>,
    calls: BTreeMap<u32, ToolCallAccumulator>,
    done: bool,
}

impl SseAccumulator {
    /// Feed raw body bytes. Returns the text deltas found in complete lines.
    ///
    /// Lines are decoded only once complete, so a character split across
    /// network chunks is reassembled first.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut deltas = Vec::new();

        while let Some(line_end) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&raw[..line_end]);
            let line = line.trim_end_matches('\r');

            // Skip empty lines and SSE comments
            if line.is_empty() || line.starts_with(':') {
                continue;
            }

            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();

            if data == "[DONE]" {
                self.done = true;
                self.buffer.clear();
                break;
            }

            match serde_json::from_str::<StreamResponse>(data) {
                Ok(resp) => {
                    let Some(choice) = resp.choices.into_iter().next() else {
                        continue;
                    };
                    for tc_delta in choice.delta.tool_calls.unwrap_or_default() {
                        let acc = self.calls.entry(tc_delta.index).or_default();
                        if let Some(id) = tc_delta.id {
                            acc.id = id;
                        }
                        if let Some(func) = tc_delta.function {
                            if let Some(name) = func.name {
                                acc.name = name;
                            }
                            if let Some(args) = func.arguments {
                                acc.arguments.push_str(&args);
                            }
                        }
                    }
                    if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                        deltas.push(content);
                    }
                }
                Err(e) => {
                    trace!(data = %data, error = %e, "Ignoring unparseable SSE chunk");
                }
            }
        }

        deltas
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    /// Completed tool calls in index order.
    pub(crate) fn finish(self) -> Vec<ProviderToolCall> {
        self.calls.into_values().map(ToolCallAccumulator::into_tool_call).collect()
    }
}

/// Accumulates incremental tool call deltas into a complete tool call.
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    fn into_tool_call(self) -> ProviderToolCall {
        ProviderToolCall {
            id: self.id,
            name: self.name,
            arguments: self.arguments,
        }
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    #[serde(default = "function_type")]
    r#type: String,
    function: ApiFunction,
}

fn function_type() -> String {
    "function".into()
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ApiResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ApiToolCall>>,
}

// --- Streaming SSE types ---

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

/// A tool call delta; arrives incrementally across chunks.
#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}
