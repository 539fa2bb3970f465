//! Backend trait, the abstraction over model families.
//!
//! A Backend knows how to send a conversation plus tool definitions to one
//! model family and return that family's unparsed [`RawOutput`]. It never
//! interprets tool calls itself: that is the normalizer's job, keyed on
//! [`BackendKind`].
//!
//! Implementations: remote OpenAI-compatible API, prompt-engineered local
//! model, native-tool local model.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::message::Message;

/// A tool definition sent to the model so it knows what tools it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    #[serde(default)]
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// The tool-call convention a backend's output follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Local runtime that emits calls inside its own documented marker pair.
    Native,
    /// No tool channel; calls are requested through sentinel markers in the prompt.
    Prompted,
    /// Network API returning calls in a structured response field.
    Remote,
}

impl BackendKind {
    /// Whether calls must be scraped from generated text.
    pub fn is_text_based(&self) -> bool {
        !matches!(self, BackendKind::Remote)
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackendKind::Native => "native",
            BackendKind::Prompted => "prompted",
            BackendKind::Remote => "remote",
        };
        f.write_str(s)
    }
}

/// Input modality a backend accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Image,
}

/// Per-request generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateConfig {
    /// The model to use (e.g., "gpt-4o", "phi-4-multimodal")
    pub model: String,

    /// Temperature (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Stop sequences
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

fn default_temperature() -> f32 {
    0.7
}

impl GenerateConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: default_temperature(),
            max_tokens: None,
            stop: Vec::new(),
        }
    }
}

/// A tool call exactly as a remote API reported it, arguments still a JSON string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// The unparsed result of one generation.
///
/// Owned by the backend until handed to the normalizer, which only borrows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawOutput {
    /// Generated text, possibly containing call markers.
    Text(String),
    /// Text plus calls read from a structured response field.
    Structured {
        text: String,
        tool_calls: Vec<ProviderToolCall>,
    },
}

impl RawOutput {
    pub fn text(&self) -> &str {
        match self {
            RawOutput::Text(t) => t,
            RawOutput::Structured { text, .. } => text,
        }
    }

    /// Assemble streamed fragments into one output.
    pub fn from_fragments(fragments: impl IntoIterator<Item = RawFragment>) -> Self {
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for fragment in fragments {
            if let Some(delta) = fragment.text {
                text.push_str(&delta);
            }
            tool_calls.extend(fragment.tool_calls);
        }
        if tool_calls.is_empty() {
            RawOutput::Text(text)
        } else {
            RawOutput::Structured { text, tool_calls }
        }
    }
}

/// A single increment of a streaming generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawFragment {
    /// Partial text delta
    #[serde(default)]
    pub text: Option<String>,

    /// Completed structured tool calls (remote backends emit these on the final fragment)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ProviderToolCall>,

    /// Whether this is the final fragment
    #[serde(default)]
    pub done: bool,
}

/// The core Backend trait.
///
/// The agent loop calls `generate()` or `generate_stream()` without knowing
/// which model family is behind it.
#[async_trait]
pub trait Backend: Send + Sync {
    /// A human-readable name for this backend (e.g., "openai", "phi4-local").
    fn name(&self) -> &str;

    /// Which tool-call convention the output follows.
    fn kind(&self) -> BackendKind;

    /// Modalities accepted in message content.
    fn modalities(&self) -> &[Modality] {
        &[Modality::Text]
    }

    /// Run one generation over the full history.
    async fn generate(
        &self,
        history: &[Message],
        tools: &[ToolDefinition],
        config: &GenerateConfig,
    ) -> std::result::Result<RawOutput, BackendError>;

    /// Run one generation, delivering it incrementally.
    ///
    /// Default implementation calls `generate()` and wraps the result as a single fragment.
    async fn generate_stream(
        &self,
        history: &[Message],
        tools: &[ToolDefinition],
        config: &GenerateConfig,
    ) -> std::result::Result<
        tokio::sync::mpsc::Receiver<std::result::Result<RawFragment, BackendError>>,
        BackendError,
    > {
        let output = self.generate(history, tools, config).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let fragment = match output {
            RawOutput::Text(text) => RawFragment { text: Some(text), tool_calls: Vec::new(), done: true },
            RawOutput::Structured { text, tool_calls } => RawFragment { text: Some(text), tool_calls, done: true },
        };
        let _ = tx.send(Ok(fragment)).await;
        Ok(rx)
    }

    /// Health check: can we reach the model?
    async fn health_check(&self) -> std::result::Result<bool, BackendError> {
        Ok(true)
    }
}

/// Reject history containing content outside `accepted`.
pub fn ensure_modalities(
    backend: &str,
    accepted: &[Modality],
    history: &[Message],
) -> std::result::Result<(), BackendError> {
    for message in history {
        for modality in message.content.modalities() {
            if !accepted.contains(&modality) {
                return Err(BackendError::InvalidInput(format!(
                    "backend '{backend}' does not accept {modality:?} content (message {})",
                    message.id
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ContentPart;

    struct EchoBackend;

    #[async_trait]
    impl Backend for EchoBackend {
        fn name(&self) -> &str {
            "echo"
        }
        fn kind(&self) -> BackendKind {
            BackendKind::Prompted
        }
        async fn generate(
            &self,
            history: &[Message],
            _tools: &[ToolDefinition],
            _config: &GenerateConfig,
        ) -> std::result::Result<RawOutput, BackendError> {
            Ok(RawOutput::Text(history.last().map(|m| m.text()).unwrap_or_default()))
        }
    }

    #[test]
    fn generate_config_defaults() {
        let cfg = GenerateConfig::new("gpt-4o");
        assert!((cfg.temperature - 0.7).abs() < f32::EPSILON);
        assert!(cfg.max_tokens.is_none());
    }

    #[test]
    fn fragments_with_calls_become_structured() {
        let out = RawOutput::from_fragments(vec![
            RawFragment { text: Some("Hel".into()), ..Default::default() },
            RawFragment { text: Some("lo".into()), ..Default::default() },
            RawFragment {
                text: None,
                tool_calls: vec![ProviderToolCall { id: "a".into(), name: "t".into(), arguments: "{}".into() }],
                done: true,
            },
        ]);
        match out {
            RawOutput::Structured { text, tool_calls } => {
                assert_eq!(text, "Hello");
                assert_eq!(tool_calls.len(), 1);
            }
            other => panic!("expected structured, got {other:?}"),
        }
    }

    #[test]
    fn fragments_without_calls_stay_text() {
        let out = RawOutput::from_fragments(vec![RawFragment { text: Some("hi".into()), ..Default::default() }]);
        assert_eq!(out, RawOutput::Text("hi".into()));
    }

    #[tokio::test]
    async fn default_stream_wraps_generate() {
        let backend = EchoBackend;
        let history = vec![Message::user("ping")];
        let mut rx = backend
            .generate_stream(&history, &[], &GenerateConfig::new("m"))
            .await
            .unwrap();
        let fragment = rx.recv().await.unwrap().unwrap();
        assert_eq!(fragment.text.as_deref(), Some("ping"));
        assert!(fragment.done);
    }

    #[test]
    fn image_rejected_by_text_only_backend() {
        let history = vec![Message::user(vec![ContentPart::Image {
            mime_type: "image/jpeg".into(),
            data: "AA==".into(),
        }])];
        let err = ensure_modalities("echo", &[Modality::Text], &history).unwrap_err();
        assert!(matches!(err, BackendError::InvalidInput(_)));
        assert!(ensure_modalities("vision", &[Modality::Text, Modality::Image], &history).is_ok());
    }
}
