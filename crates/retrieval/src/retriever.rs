//! Ties an encoder, a splitter and a store together.

use std::path::Path;
use std::sync::Arc;

use omnibridge_config::{EncoderKind, RetrievalConfig};
use omnibridge_core::RetrievalError;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::encoder::{EmbeddingEncoder, HashingEncoder, OpenAiEncoder};
use crate::splitter::TextSplitter;
use crate::store::{RetrievedChunk, VectorStore};
use crate::vector::Similarity;

/// A document to ingest, with metadata copied onto each of its chunks.
#[derive(Debug, Clone, Default)]
pub struct Document {
    pub text: String,
    pub metadata: Map<String, Value>,
}

impl Document {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into(), metadata: Map::new() }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.metadata.insert("source".into(), Value::String(source.into()));
        self
    }
}

pub struct Retriever {
    encoder: Arc<dyn EmbeddingEncoder>,
    store: Arc<VectorStore>,
    splitter: TextSplitter,
    top_k: usize,
}

impl Retriever {
    pub fn new(encoder: Arc<dyn EmbeddingEncoder>, store: Arc<VectorStore>) -> Self {
        Self { encoder, store, splitter: TextSplitter::default(), top_k: 3 }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    pub fn with_splitter(mut self, splitter: TextSplitter) -> Self {
        self.splitter = splitter;
        self
    }

    /// Build the encoder and load the store described by `config`.
    ///
    /// `api_key` and `base_url` are only used by the OpenAI encoder.
    pub async fn from_config(
        config: &RetrievalConfig,
        base_url: &str,
        api_key: Option<String>,
        store_path: &Path,
    ) -> Result<Self, RetrievalError> {
        let similarity: Similarity = config
            .similarity
            .parse()
            .map_err(RetrievalError::Storage)?;

        let encoder: Arc<dyn EmbeddingEncoder> = match config.encoder {
            EncoderKind::OpenAi => Arc::new(OpenAiEncoder::new(base_url, api_key, config.model.clone(), config.dimensions)),
            EncoderKind::Hashing => Arc::new(HashingEncoder::new(config.dimensions)),
        };

        let store = VectorStore::load(store_path, similarity).await?;
        if let Some(stored) = store.dimensions().await {
            if stored != encoder.dimensions() {
                return Err(RetrievalError::DimensionMismatch { expected: stored, actual: encoder.dimensions() });
            }
        }

        info!(
            encoder = encoder.name(),
            similarity = %similarity,
            chunks = store.len().await,
            "Retriever ready"
        );

        Ok(Self::new(encoder, Arc::new(store))
            .with_top_k(config.top_k)
            .with_splitter(TextSplitter::new(config.chunk_size, config.chunk_overlap)))
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Split, encode and store documents. Returns the number of chunks added.
    pub async fn add_documents(&self, docs: Vec<Document>) -> Result<usize, RetrievalError> {
        let mut pieces: Vec<(String, Map<String, Value>)> = Vec::new();
        for doc in docs {
            let chunks = self.splitter.split(&doc.text);
            let total = chunks.len();
            for (i, chunk) in chunks.into_iter().enumerate() {
                let mut metadata = doc.metadata.clone();
                metadata.insert("chunk".into(), Value::from(i));
                metadata.insert("chunks".into(), Value::from(total));
                pieces.push((chunk, metadata));
            }
        }
        if pieces.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = pieces.iter().map(|(t, _)| t.clone()).collect();
        let vectors = self.encoder.encode_batch(&texts).await?;
        if vectors.len() != pieces.len() {
            return Err(RetrievalError::EmbeddingFailed(format!(
                "expected {} vectors, got {}",
                pieces.len(),
                vectors.len()
            )));
        }

        let items = pieces
            .into_iter()
            .zip(vectors)
            .map(|((text, metadata), vector)| (text, vector, metadata))
            .collect::<Vec<_>>();
        let added = self.store.add_with_metadata(items).await?.len();
        debug!(added, "Documents ingested");
        Ok(added)
    }

    /// The `top_k` chunks nearest to `query`.
    pub async fn retrieve(&self, query: &str) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        if self.store.is_empty().await {
            return Ok(Vec::new());
        }
        let vector = self.encoder.encode(query).await?;
        let hits = self.store.search(&vector, self.top_k).await?;
        debug!(hits = hits.len(), top_score = hits.first().map(|h| h.score), "Retrieved context");
        Ok(hits)
    }
}

/// Render chunks as the system context block injected before a user turn.
pub fn format_context(chunks: &[RetrievedChunk]) -> Option<String> {
    if chunks.is_empty() {
        return None;
    }
    let mut out = String::from("Relevant context:");
    for (i, chunk) in chunks.iter().enumerate() {
        out.push_str(&format!("\n[{}] {}", i + 1, chunk.text));
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retriever() -> Retriever {
        Retriever::new(Arc::new(HashingEncoder::new(128)), Arc::new(VectorStore::default()))
    }

    #[tokio::test]
    async fn ingest_then_retrieve_most_relevant() {
        let r = retriever().with_top_k(1);
        let added = r
            .add_documents(vec![
                Document::new("Flights to Paris leave from gate 12 every morning.").with_source("travel.md"),
                Document::new("Sourdough needs a mature starter and a long proof.").with_source("baking.md"),
            ])
            .await
            .unwrap();
        assert_eq!(added, 2);

        let hits = r.retrieve("when do flights to paris leave").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].text.contains("Paris"));
        assert_eq!(hits[0].metadata["source"], "travel.md");
        assert_eq!(hits[0].metadata["chunk"], 0);
    }

    #[tokio::test]
    async fn long_documents_are_split() {
        let r = retriever().with_splitter(TextSplitter::new(40, 10));
        let text = "word ".repeat(50);
        let added = r.add_documents(vec![Document::new(text)]).await.unwrap();
        assert!(added > 1);
        assert_eq!(r.store().len().await, added);
    }

    #[tokio::test]
    async fn empty_store_retrieves_nothing() {
        assert!(retriever().retrieve("anything").await.unwrap().is_empty());
        assert_eq!(retriever().add_documents(vec![Document::new("  ")]).await.unwrap(), 0);
    }

    #[test]
    fn context_block_numbers_chunks() {
        let chunk = |text: &str| RetrievedChunk {
            text: text.into(),
            embedding: Vec::new(),
            score: 1.0,
            metadata: Map::new(),
        };
        assert_eq!(
            format_context(&[chunk("alpha"), chunk("beta")]).unwrap(),
            "Relevant context:\n[1] alpha\n[2] beta"
        );
        assert!(format_context(&[]).is_none());
    }

    #[tokio::test]
    async fn from_config_uses_hashing_encoder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.json");
        let config = RetrievalConfig {
            enabled: true,
            encoder: EncoderKind::Hashing,
            dimensions: 32,
            top_k: 2,
            ..RetrievalConfig::default()
        };

        let r = Retriever::from_config(&config, "http://unused", None, &path).await.unwrap();
        assert_eq!(r.top_k(), 2);
        r.add_documents(vec![Document::new("persisted note")]).await.unwrap();
        r.store().save(&path).await.unwrap();

        let reloaded = Retriever::from_config(&config, "http://unused", None, &path).await.unwrap();
        assert_eq!(reloaded.store().len().await, 1);

        let wider = RetrievalConfig { dimensions: 64, ..config };
        let err = Retriever::from_config(&wider, "http://unused", None, &path).await.err().unwrap();
        assert!(matches!(err, RetrievalError::DimensionMismatch { expected: 32, actual: 64 }));
    }

    #[tokio::test]
    async fn from_config_rejects_unknown_similarity() {
        let dir = tempfile::tempdir().unwrap();
        let config = RetrievalConfig { similarity: "manhattan".into(), ..RetrievalConfig::default() };
        let err = Retriever::from_config(&config, "http://unused", None, &dir.path().join("v.json"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RetrievalError::Storage(_)));
    }
}
