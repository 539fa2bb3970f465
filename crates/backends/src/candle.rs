//! Candle inference engine: GGUF-quantized models on local hardware.
//!
//! Uses [Candle](https://github.com/huggingface/candle) to run quantized
//! language models with no network access after the first download.
//! Weights are resolved from a preset alias through the HuggingFace Hub
//! cache, or read from an explicit `.gguf` path.

use std::path::Path;

use candle_core::quantized::gguf_file;
use candle_core::{Device, Tensor};
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::quantized_llama as qlm;
use hf_hub::api::sync::Api;
use omnibridge_core::BackendError;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::lease::{EngineRequest, InferenceEngine};

// ── Well-known model aliases ──

/// Friendly aliases that resolve to HuggingFace repos + filenames.
struct ModelPreset {
    repo: &'static str,
    gguf_file: &'static str,
    tokenizer_repo: &'static str,
}

pub const PRESETS: &[&str] = &["tinyllama", "smollm:135m", "smollm:360m", "smollm:1.7b", "qwen:0.5b", "qwen:1.5b"];

fn resolve_preset(alias: &str) -> Option<ModelPreset> {
    match alias.to_lowercase().as_str() {
        "tinyllama" | "tiny-llama" | "tinyllama-1.1b" => Some(ModelPreset {
            repo: "TheBloke/TinyLlama-1.1B-Chat-v1.0-GGUF",
            gguf_file: "tinyllama-1.1b-chat-v1.0.Q4_K_M.gguf",
            tokenizer_repo: "TinyLlama/TinyLlama-1.1B-Chat-v1.0",
        }),
        "smollm" | "smollm:135m" | "smollm-135m" => Some(ModelPreset {
            repo: "TheBloke/SmolLM-135M-Instruct-GGUF",
            gguf_file: "smollm-135m-instruct.Q4_K_M.gguf",
            tokenizer_repo: "HuggingFaceTB/SmolLM-135M-Instruct",
        }),
        "smollm:360m" | "smollm-360m" => Some(ModelPreset {
            repo: "TheBloke/SmolLM-360M-Instruct-GGUF",
            gguf_file: "smollm-360m-instruct.Q4_K_M.gguf",
            tokenizer_repo: "HuggingFaceTB/SmolLM-360M-Instruct",
        }),
        "smollm:1.7b" | "smollm-1.7b" => Some(ModelPreset {
            repo: "TheBloke/SmolLM-1.7B-Instruct-GGUF",
            gguf_file: "smollm-1.7b-instruct.Q4_K_M.gguf",
            tokenizer_repo: "HuggingFaceTB/SmolLM-1.7B-Instruct",
        }),
        "qwen:0.5b" | "qwen-0.5b" | "qwen2-0.5b" => Some(ModelPreset {
            repo: "Qwen/Qwen2-0.5B-Instruct-GGUF",
            gguf_file: "qwen2-0_5b-instruct-q4_k_m.gguf",
            tokenizer_repo: "Qwen/Qwen2-0.5B-Instruct",
        }),
        "qwen:1.5b" | "qwen-1.5b" | "qwen2-1.5b" => Some(ModelPreset {
            repo: "Qwen/Qwen2-1.5B-Instruct-GGUF",
            gguf_file: "qwen2-1_5b-instruct-q4_k_m.gguf",
            tokenizer_repo: "Qwen/Qwen2-1.5B-Instruct",
        }),
        _ => None,
    }
}

/// A loaded GGUF model: weights, tokenizer, and sampling state.
pub struct CandleEngine {
    label: String,
    model: qlm::ModelWeights,
    tokenizer: Tokenizer,
    device: Device,
    eos_token_id: u32,
}

impl CandleEngine {
    /// Load a model by preset alias or `.gguf` path. Blocking; call from `spawn_blocking`.
    pub fn load(model: &str, tokenizer_path: Option<&Path>) -> Result<Self, BackendError> {
        let device = Device::Cpu;

        let (weights_path, tokenizer_file) = if Path::new(model).exists() && model.ends_with(".gguf") {
            let weights = Path::new(model).to_path_buf();
            let tokenizer = match tokenizer_path {
                Some(p) => p.to_path_buf(),
                None => weights.with_file_name("tokenizer.json"),
            };
            (weights, tokenizer)
        } else {
            let preset = resolve_preset(model).ok_or_else(|| {
                BackendError::ModelNotFound(format!(
                    "Unknown local model '{model}'. Available presets: {}. Or provide a path to a .gguf file.",
                    PRESETS.join(", ")
                ))
            })?;

            info!(model, repo = preset.repo, file = preset.gguf_file, "Downloading/loading local model");

            let api = Api::new()
                .map_err(|e| BackendError::Unavailable(format!("Failed to initialize HuggingFace Hub API: {e}")))?;
            let weights = api.model(preset.repo.to_string()).get(preset.gguf_file).map_err(|e| {
                BackendError::Unavailable(format!("Failed to download '{}' from '{}': {e}", preset.gguf_file, preset.repo))
            })?;
            let tokenizer = match tokenizer_path {
                Some(p) => p.to_path_buf(),
                None => api.model(preset.tokenizer_repo.to_string()).get("tokenizer.json").map_err(|e| {
                    BackendError::Unavailable(format!("Failed to download tokenizer from '{}': {e}", preset.tokenizer_repo))
                })?,
            };
            (weights, tokenizer)
        };

        if !tokenizer_file.exists() {
            warn!(path = %tokenizer_file.display(), "tokenizer.json not found");
        }
        let tokenizer = Tokenizer::from_file(&tokenizer_file)
            .map_err(|e| BackendError::Unavailable(format!("Failed to load tokenizer: {e}")))?;

        let mut file = std::fs::File::open(&weights_path)
            .map_err(|e| BackendError::Unavailable(format!("Failed to open model file: {e}")))?;
        let gguf = gguf_file::Content::read(&mut file)
            .map_err(|e| BackendError::Unavailable(format!("Failed to parse GGUF file: {e}")))?;
        let weights = qlm::ModelWeights::from_gguf(gguf, &mut file, &device)
            .map_err(|e| BackendError::Unavailable(format!("Failed to load model weights: {e}")))?;

        let eos_token_id = tokenizer
            .token_to_id("</s>")
            .or_else(|| tokenizer.token_to_id("<|endoftext|>"))
            .or_else(|| tokenizer.token_to_id("<|im_end|>"))
            .or_else(|| tokenizer.token_to_id("<|end|>"))
            .unwrap_or(2);

        info!(eos_token_id, path = %weights_path.display(), "Local model loaded");

        Ok(Self {
            label: format!("candle/{model}"),
            model: weights,
            tokenizer,
            device,
            eos_token_id,
        })
    }
}

fn map_candle_err(e: candle_core::Error) -> BackendError {
    BackendError::ApiError {
        status_code: 500,
        message: format!("Candle inference error: {e}"),
    }
}

impl InferenceEngine for CandleEngine {
    fn name(&self) -> &str {
        &self.label
    }

    fn generate(&mut self, request: &EngineRequest, on_token: &mut dyn FnMut(&str)) -> Result<String, BackendError> {
        let encoding = self
            .tokenizer
            .encode(request.prompt.as_str(), true)
            .map_err(|e| BackendError::InvalidInput(format!("Tokenization failed: {e}")))?;
        let prompt_tokens = encoding.get_ids();

        debug!(
            prompt_tokens = prompt_tokens.len(),
            max_tokens = request.max_tokens,
            temperature = request.temperature,
            "Starting local generation"
        );

        let mut logits_processor = if request.temperature <= 0.0 {
            LogitsProcessor::new(42, None, None)
        } else {
            LogitsProcessor::new(42, Some(f64::from(request.temperature)), None)
        };

        let mut input = Tensor::new(prompt_tokens, &self.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(map_candle_err)?;
        let mut position = 0;
        let mut generated: Vec<u32> = Vec::new();
        let mut text = String::new();

        for _ in 0..request.max_tokens {
            let step_len = input.dim(1).map_err(map_candle_err)?;
            let logits = self.model.forward(&input, position).map_err(map_candle_err)?;
            position += step_len;

            let logits = logits.squeeze(0).map_err(map_candle_err)?;
            let next_token = logits_processor.sample(&logits).map_err(map_candle_err)?;
            if next_token == self.eos_token_id {
                break;
            }
            generated.push(next_token);

            // Decode the whole tail so multi-token characters come out intact.
            let decoded = self
                .tokenizer
                .decode(&generated, true)
                .map_err(|e| BackendError::ApiError { status_code: 500, message: format!("Detokenization failed: {e}") })?;
            if decoded.len() > text.len() && decoded.starts_with(text.as_str()) {
                on_token(&decoded[text.len()..]);
            }
            text = decoded;

            if request.stop.iter().any(|s| !s.is_empty() && text.contains(s.as_str())) {
                break;
            }

            input = Tensor::new(&[next_token][..], &self.device)
                .and_then(|t| t.unsqueeze(0))
                .map_err(map_candle_err)?;
        }

        debug!(completion_tokens = generated.len(), output_len = text.len(), "Generation complete");
        Ok(text)
    }
}
