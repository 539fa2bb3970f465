//! Text-to-vector encoders.

use std::time::Duration;

use async_trait::async_trait;
use omnibridge_core::RetrievalError;
use serde::Deserialize;
use tracing::debug;

use crate::vector::l2_normalize;

/// Longest input, in characters, sent to a remote embedding model.
pub const MAX_INPUT_CHARS: usize = 8000;

#[async_trait]
pub trait EmbeddingEncoder: Send + Sync {
    fn name(&self) -> &str;

    /// Length of every vector this encoder produces.
    fn dimensions(&self) -> usize;

    async fn encode(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        let mut vectors = self.encode_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| RetrievalError::EmbeddingFailed("encoder returned no vector".into()))
    }

    /// One vector per input, in input order.
    async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError>;
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ── OpenAI-compatible /embeddings ──

pub struct OpenAiEncoder {
    base_url: String,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct EmbeddingApiResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAiEncoder {
    pub fn new(base_url: &str, api_key: Option<String>, model: impl Into<String>, dimensions: usize) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            dimensions,
            client,
        }
    }

    /// `text-embedding-3-small` on api.openai.com.
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self::new("https://api.openai.com/v1", Some(api_key.into()), "text-embedding-3-small", 1536)
    }
}

#[async_trait]
impl EmbeddingEncoder for OpenAiEncoder {
    fn name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let inputs: Vec<&str> = texts.iter().map(|t| truncate_chars(t, MAX_INPUT_CHARS)).collect();
        let body = serde_json::json!({
            "model": self.model,
            "input": inputs,
            "encoding_format": "float",
        });

        debug!(model = %self.model, count = inputs.len(), "Sending embedding request");

        let mut req = self.client.post(format!("{}/embeddings", self.base_url)).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let response = req
            .send()
            .await
            .map_err(|e| RetrievalError::EmbeddingFailed(format!("request failed: {e}")))?;

        let status = response.status().as_u16();
        if status == 401 || status == 403 {
            return Err(RetrievalError::EmbeddingFailed("Invalid API key".into()));
        }
        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            return Err(RetrievalError::EmbeddingFailed(format!("HTTP {status}: {error_body}")));
        }

        let mut api_resp: EmbeddingApiResponse = response
            .json()
            .await
            .map_err(|e| RetrievalError::EmbeddingFailed(format!("Failed to parse embedding response: {e}")))?;
        api_resp.data.sort_by_key(|d| d.index);

        if api_resp.data.len() != texts.len() {
            return Err(RetrievalError::EmbeddingFailed(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                api_resp.data.len()
            )));
        }
        let vectors: Vec<Vec<f32>> = api_resp.data.into_iter().map(|d| d.embedding).collect();
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dimensions) {
            return Err(RetrievalError::DimensionMismatch { expected: self.dimensions, actual: bad.len() });
        }
        Ok(vectors)
    }
}

// ── Offline feature hashing ──

/// Deterministic bag-of-words encoder that needs no model or network.
///
/// Each lowercase alphanumeric token is hashed with FNV-1a into one of
/// `dimensions` buckets; the count vector is then scaled to unit length.
#[derive(Debug, Clone)]
pub struct HashingEncoder {
    dimensions: usize,
}

impl Default for HashingEncoder {
    fn default() -> Self {
        Self::new(256)
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME))
}

impl HashingEncoder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions: dimensions.max(1) }
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        let lower = text.to_lowercase();
        for token in lower.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty()) {
            let bucket = (fnv1a(token.as_bytes()) % self.dimensions as u64) as usize;
            vector[bucket] += 1.0;
        }
        l2_normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl EmbeddingEncoder for HashingEncoder {
    fn name(&self) -> &str {
        "hashing"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
        Ok(texts.iter().map(|t| self.embed(t)).collect())
    }
}
