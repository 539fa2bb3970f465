//! Backends over a locally hosted model.
//!
//! The same adapter serves both local conventions; only the prompt dialect
//! and the reported [`BackendKind`] differ:
//!
//! - [`LocalBackend::prompted`]: Phi-style prompt, calls requested between
//!   sentinel markers (kind `Prompted`).
//! - [`LocalBackend::native`]: ChatML/Hermes prompt, the model's own
//!   `<tool_call>` convention (kind `Native`).
//!
//! Every generation runs under a [`ModelLease`](crate::lease::ModelLease).

use async_trait::async_trait;
use omnibridge_config::LeasePolicy;
use omnibridge_core::backend::ensure_modalities;
use omnibridge_core::{
    Backend, BackendError, BackendKind, GenerateConfig, Message, Modality, RawFragment, RawOutput,
    SentinelMarkers, ToolDefinition,
};
use tracing::{debug, info};

use crate::lease::{EngineRequest, InferenceEngine, ModelInstance};
use crate::template::{PromptDialect, render};

const DEFAULT_MAX_TOKENS: u32 = 512;

pub struct LocalBackend<E> {
    name: String,
    kind: BackendKind,
    dialect: PromptDialect,
    markers: SentinelMarkers,
    modalities: Vec<Modality>,
    instance: ModelInstance<E>,
}

impl<E: InferenceEngine> LocalBackend<E> {
    /// A prompt-engineered backend using `markers` for schemas and calls.
    pub fn prompted(engine: E, markers: SentinelMarkers, policy: LeasePolicy) -> Self {
        Self::build(engine, BackendKind::Prompted, PromptDialect::Phi, markers, policy)
    }

    /// A native-tool backend using the Hermes `<tool_call>` convention.
    pub fn native(engine: E, policy: LeasePolicy) -> Self {
        Self::build(engine, BackendKind::Native, PromptDialect::ChatMl, SentinelMarkers::native(), policy)
    }

    fn build(engine: E, kind: BackendKind, dialect: PromptDialect, markers: SentinelMarkers, policy: LeasePolicy) -> Self {
        let name = engine.name().to_string();
        let modalities = engine.modalities().to_vec();
        info!(backend = %name, kind = %kind, "Local backend ready");
        Self {
            name,
            kind,
            dialect,
            markers,
            modalities,
            instance: ModelInstance::new(engine, policy),
        }
    }

    /// The markers the model is asked to use. The normalizer must scan with the same pair.
    pub fn markers(&self) -> &SentinelMarkers {
        &self.markers
    }

    pub fn instance(&self) -> &ModelInstance<E> {
        &self.instance
    }

    fn request(
        &self,
        history: &[Message],
        tools: &[ToolDefinition],
        config: &GenerateConfig,
    ) -> Result<EngineRequest, BackendError> {
        ensure_modalities(&self.name, &self.modalities, history)?;
        let prompt = render(self.dialect, &self.markers, history, tools)?;

        let mut stop = config.stop.clone();
        stop.push(self.dialect.end_of_turn().to_string());

        debug!(
            backend = %self.name,
            prompt_len = prompt.text.len(),
            images = prompt.images.len(),
            "Rendered local prompt"
        );

        Ok(EngineRequest {
            prompt: prompt.text,
            images: prompt.images,
            max_tokens: config.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: config.temperature,
            stop,
        })
    }
}

/// Cut generated text at the first stop sequence and trim it.
pub(crate) fn clean_output(text: &str, stop: &[String]) -> String {
    let end = stop
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text.find(s.as_str()))
        .min()
        .unwrap_or(text.len());
    text[..end].trim().to_string()
}

/// Incremental form of [`clean_output`] for streamed tokens.
///
/// Text that could still grow into a stop sequence, and trailing whitespace,
/// is held back until a later piece settles it. The concatenated output equals
/// `clean_output` over the whole generation.
pub(crate) struct StopFilter {
    stop: Vec<String>,
    pending: String,
    started: bool,
    stopped: bool,
}

impl StopFilter {
    pub(crate) fn new(stop: &[String]) -> Self {
        Self {
            stop: stop.iter().filter(|s| !s.is_empty()).cloned().collect(),
            pending: String::new(),
            started: false,
            stopped: false,
        }
    }

    /// Feed one token; returns the text that is now safe to emit.
    pub(crate) fn push(&mut self, piece: &str) -> Option<String> {
        if self.stopped {
            return None;
        }
        self.pending.push_str(piece);

        let matched = self.stop.iter().filter_map(|s| self.pending.find(s.as_str())).min();
        if let Some(end) = matched {
            self.stopped = true;
            self.pending.truncate(end);
            return self.finish();
        }

        let hold = self.hold_from();
        let ready: String = self.pending.drain(..hold).collect();
        self.release(ready)
    }

    /// Flush whatever is still held once generation has ended.
    pub(crate) fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        self.release(rest.trim_end().to_string())
    }

    fn hold_from(&self) -> usize {
        let partial = self
            .pending
            .char_indices()
            .map(|(i, _)| i)
            .find(|&i| {
                let tail = &self.pending[i..];
                self.stop.iter().any(|s| s.len() > tail.len() && s.starts_with(tail))
            })
            .unwrap_or(self.pending.len());
        self.pending[..partial].trim_end().len()
    }

    fn release(&mut self, text: String) -> Option<String> {
        let text = if self.started { text } else { text.trim_start().to_string() };
        if text.is_empty() {
            return None;
        }
        self.started = true;
        Some(text)
    }
}

#[async_trait]
impl<E: InferenceEngine> Backend for LocalBackend<E> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn modalities(&self) -> &[Modality] {
        &self.modalities
    }

    async fn generate(
        &self,
        history: &[Message],
        tools: &[ToolDefinition],
        config: &GenerateConfig,
    ) -> Result<RawOutput, BackendError> {
        let request = self.request(history, tools, config)?;
        let lease = self.instance.acquire().await?;

        let output = lease
            .run(move |engine| {
                let text = engine.generate(&request, &mut |_| {})?;
                Ok(clean_output(&text, &request.stop))
            })
            .await?;

        Ok(RawOutput::Text(output))
    }

    async fn generate_stream(
        &self,
        history: &[Message],
        tools: &[ToolDefinition],
        config: &GenerateConfig,
    ) -> Result<tokio::sync::mpsc::Receiver<Result<RawFragment, BackendError>>, BackendError> {
        let request = self.request(history, tools, config)?;
        let lease = self.instance.acquire().await?;
        let (tx, rx) = tokio::sync::mpsc::channel(64);

        tokio::spawn(async move {
            let token_tx = tx.clone();
            let result = lease
                .run(move |engine| {
                    let send = |text: String| {
                        let fragment = RawFragment { text: Some(text), ..Default::default() };
                        let _ = token_tx.blocking_send(Ok(fragment));
                    };
                    let mut filter = StopFilter::new(&request.stop);
                    engine.generate(&request, &mut |piece| {
                        if let Some(text) = filter.push(piece) {
                            send(text);
                        }
                    })?;
                    if let Some(text) = filter.finish() {
                        send(text);
                    }
                    Ok(())
                })
                .await;

            let last = match result {
                Ok(_) => Ok(RawFragment { done: true, ..Default::default() }),
                Err(e) => Err(e),
            };
            let _ = tx.send(last).await;
        });

        Ok(rx)
    }

    async fn health_check(&self) -> Result<bool, BackendError> {
        match self.instance.try_lease() {
            Ok(lease) => Ok(lease.engine().is_loaded()),
            // Busy means a generation is running, so the weights are resident.
            Err(BackendError::Busy(_)) => Ok(true),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omnibridge_core::ContentPart;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Replays canned completions and records the prompts it was given.
    struct ScriptedEngine {
        replies: VecDeque<String>,
        prompts: Arc<Mutex<Vec<String>>>,
        vision: bool,
    }

    impl ScriptedEngine {
        fn new(replies: &[&str]) -> (Self, Arc<Mutex<Vec<String>>>) {
            let prompts = Arc::new(Mutex::new(Vec::new()));
            let engine = Self {
                replies: replies.iter().map(|s| s.to_string()).collect(),
                prompts: prompts.clone(),
                vision: false,
            };
            (engine, prompts)
        }
    }

    impl InferenceEngine for ScriptedEngine {
        fn name(&self) -> &str {
            "scripted"
        }

        fn modalities(&self) -> &[Modality] {
            const WITH_IMAGES: &[Modality] = &[Modality::Text, Modality::Image];
            if self.vision { WITH_IMAGES } else { &[Modality::Text] }
        }

        fn generate(&mut self, request: &EngineRequest, on_token: &mut dyn FnMut(&str)) -> Result<String, BackendError> {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            let reply = self
                .replies
                .pop_front()
                .ok_or_else(|| BackendError::Unavailable("script exhausted".into()))?;
            for word in reply.split_inclusive(' ') {
                on_token(word);
            }
            Ok(reply)
        }
    }

    fn tool() -> ToolDefinition {
        ToolDefinition {
            name: "lookup".into(),
            description: "Look something up".into(),
            parameters: serde_json::json!({"type": "object"}),
        }
    }

    #[tokio::test]
    async fn prompted_backend_renders_markers() {
        let (engine, prompts) = ScriptedEngine::new(&[r#"<|tool_call|>[{"name":"lookup","arguments":{"query":"x"}}]<|/tool_call|><|end|>"#]);
        let backend = LocalBackend::prompted(engine, SentinelMarkers::default(), LeasePolicy::Queue);
        assert_eq!(backend.kind(), BackendKind::Prompted);

        let out = backend
            .generate(&[Message::user("find x")], &[tool()], &GenerateConfig::new("local"))
            .await
            .unwrap();
        assert_eq!(out, RawOutput::Text(r#"<|tool_call|>[{"name":"lookup","arguments":{"query":"x"}}]<|/tool_call|>"#.into()));

        let prompt = prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("<|tool|>"));
        assert!(prompt.ends_with("<|assistant|>"));
    }

    #[tokio::test]
    async fn native_backend_uses_chatml() {
        let (engine, prompts) = ScriptedEngine::new(&["hello<|im_end|>"]);
        let backend = LocalBackend::native(engine, LeasePolicy::Queue);
        assert_eq!(backend.kind(), BackendKind::Native);
        assert_eq!(backend.markers().call_open, "<tool_call>");

        let out = backend.generate(&[Message::user("hi")], &[tool()], &GenerateConfig::new("local")).await.unwrap();
        assert_eq!(out.text(), "hello");
        assert!(prompts.lock().unwrap()[0].contains("<tools>"));
    }

    #[tokio::test]
    async fn text_only_engine_rejects_images() {
        let (engine, prompts) = ScriptedEngine::new(&["never"]);
        let backend = LocalBackend::prompted(engine, SentinelMarkers::default(), LeasePolicy::Queue);
        let msg = Message::user(vec![ContentPart::Image { mime_type: "image/jpeg".into(), data: "AAAA".into() }]);
        let err = backend.generate(&[msg], &[], &GenerateConfig::new("local")).await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidInput(_)));
        assert!(prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn vision_engine_gets_images() {
        let (mut engine, prompts) = ScriptedEngine::new(&["a cat"]);
        engine.vision = true;
        let backend = LocalBackend::prompted(engine, SentinelMarkers::default(), LeasePolicy::Queue);
        let msg = Message::user(vec![
            ContentPart::Image { mime_type: "image/jpeg".into(), data: "AAAA".into() },
            ContentPart::text("what?"),
        ]);
        let out = backend.generate(&[msg], &[], &GenerateConfig::new("local")).await.unwrap();
        assert_eq!(out.text(), "a cat");
        assert!(prompts.lock().unwrap()[0].contains("<|image_1|>what?"));
    }

    #[tokio::test]
    async fn stream_delivers_tokens_then_done() {
        let (engine, _) = ScriptedEngine::new(&["one two three"]);
        let backend = LocalBackend::prompted(engine, SentinelMarkers::default(), LeasePolicy::Queue);
        let mut rx = backend
            .generate_stream(&[Message::user("count")], &[], &GenerateConfig::new("local"))
            .await
            .unwrap();

        let mut fragments = Vec::new();
        while let Some(fragment) = rx.recv().await {
            fragments.push(fragment.unwrap());
        }
        assert!(fragments.last().unwrap().done);
        assert_eq!(RawOutput::from_fragments(fragments).text(), "one two three");
    }

    #[tokio::test]
    async fn engine_failure_surfaces() {
        let (engine, _) = ScriptedEngine::new(&[]);
        let backend = LocalBackend::native(engine, LeasePolicy::Reject);
        let err = backend.generate(&[Message::user("hi")], &[], &GenerateConfig::new("local")).await.unwrap_err();
        assert!(err.is_unavailable());
        assert!(backend.health_check().await.unwrap());
    }

    /// Emits a fixed token sequence on every call.
    struct TokenEngine {
        pieces: Vec<&'static str>,
    }

    impl InferenceEngine for TokenEngine {
        fn name(&self) -> &str {
            "tokens"
        }

        fn generate(&mut self, _request: &EngineRequest, on_token: &mut dyn FnMut(&str)) -> Result<String, BackendError> {
            for piece in &self.pieces {
                on_token(piece);
            }
            Ok(self.pieces.concat())
        }
    }

    async fn streamed_text<E: InferenceEngine>(backend: &LocalBackend<E>) -> String {
        let mut rx = backend
            .generate_stream(&[Message::user("hi")], &[], &GenerateConfig::new("local"))
            .await
            .unwrap();
        let mut fragments = Vec::new();
        while let Some(fragment) = rx.recv().await {
            fragments.push(fragment.unwrap());
        }
        RawOutput::from_fragments(fragments).text().to_string()
    }

    #[tokio::test]
    async fn stream_matches_generate_at_stop_marker() {
        let cases: [&[&'static str]; 3] = [
            &["Hello", " there", "<|end|>"],
            &["  Hello", " there ", "<|e", "nd|>", " trailing junk"],
            &["<", "3 you", " <|en", "d|>"],
        ];
        for pieces in cases {
            let backend = LocalBackend::prompted(
                TokenEngine { pieces: pieces.to_vec() },
                SentinelMarkers::default(),
                LeasePolicy::Queue,
            );
            let generated = backend
                .generate(&[Message::user("hi")], &[], &GenerateConfig::new("local"))
                .await
                .unwrap();
            assert_eq!(streamed_text(&backend).await, generated.text(), "pieces {pieces:?}");
        }
    }

    #[test]
    fn stop_filter_holds_partial_markers() {
        let mut filter = StopFilter::new(&["<|end|>".to_string()]);
        assert_eq!(filter.push("ok <|"), Some("ok".to_string()));
        assert_eq!(filter.push("en"), None);
        assert_eq!(filter.push("d|> ignored"), None);
        assert_eq!(filter.push("more"), None);
        assert_eq!(filter.finish(), None);

        let mut filter = StopFilter::new(&["<|end|>".to_string()]);
        assert_eq!(filter.push("a <|x"), Some("a <|x".to_string()));
        assert_eq!(filter.finish(), None);
    }

    #[test]
    fn clean_output_cuts_at_first_stop() {
        let stop = vec!["<|end|>".to_string(), "</s>".to_string()];
        assert_eq!(clean_output("  answer </s> junk <|end|>", &stop), "answer");
        assert_eq!(clean_output("no stop", &stop), "no stop");
    }
}
