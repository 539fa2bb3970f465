//! In-memory vector store with JSON persistence.
//!
//! All chunks share one dimension, fixed when the store is created or by
//! the first add. Writers take the write lock, so a search never observes a
//! half-applied batch.

use std::path::Path;

use omnibridge_core::RetrievalError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::vector::Similarity;

/// A chunk as held by the store. Its vector never changes after insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredChunk {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// A search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    pub text: String,
    pub embedding: Vec<f32>,
    pub score: f32,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    dimensions: Option<usize>,
    chunks: Vec<StoredChunk>,
}

pub struct VectorStore {
    similarity: Similarity,
    inner: RwLock<Snapshot>,
}

impl Default for VectorStore {
    fn default() -> Self {
        Self::new(Similarity::Cosine)
    }
}

impl VectorStore {
    /// An empty store whose dimension is fixed by the first add.
    pub fn new(similarity: Similarity) -> Self {
        Self { similarity, inner: RwLock::new(Snapshot::default()) }
    }

    /// An empty store that only accepts `dimensions`-long vectors.
    pub fn with_dimensions(dimensions: usize, similarity: Similarity) -> Self {
        Self {
            similarity,
            inner: RwLock::new(Snapshot { dimensions: Some(dimensions), chunks: Vec::new() }),
        }
    }

    pub fn similarity(&self) -> Similarity {
        self.similarity
    }

    pub async fn dimensions(&self) -> Option<usize> {
        self.inner.read().await.dimensions
    }

    pub async fn add(&self, items: Vec<(String, Vec<f32>)>) -> Result<Vec<String>, RetrievalError> {
        self.add_with_metadata(items.into_iter().map(|(text, v)| (text, v, Map::new())).collect())
            .await
    }

    /// Insert a batch. Either every item is added or none is.
    pub async fn add_with_metadata(
        &self,
        items: Vec<(String, Vec<f32>, Map<String, Value>)>,
    ) -> Result<Vec<String>, RetrievalError> {
        if let Some((text, _, _)) = items.iter().find(|(_, v, _)| !is_finite(v)) {
            return Err(RetrievalError::EmbeddingFailed(format!(
                "non-finite value in embedding for chunk '{}'",
                text.chars().take(40).collect::<String>()
            )));
        }
        let mut inner = self.inner.write().await;

        let expected = inner.dimensions.or_else(|| items.first().map(|(_, v, _)| v.len()));
        if let Some(expected) = expected {
            if let Some((_, v, _)) = items.iter().find(|(_, v, _)| v.len() != expected) {
                return Err(RetrievalError::DimensionMismatch { expected, actual: v.len() });
            }
            inner.dimensions = Some(expected);
        }

        let mut ids = Vec::with_capacity(items.len());
        for (text, embedding, metadata) in items {
            let id = Uuid::new_v4().to_string();
            ids.push(id.clone());
            inner.chunks.push(StoredChunk { id, text, embedding, metadata });
        }

        debug!(added = ids.len(), total = inner.chunks.len(), "Vector store updated");
        Ok(ids)
    }

    /// Top `k` chunks by descending score. Ties keep insertion order.
    pub async fn search(&self, query: &[f32], k: usize) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        let inner = self.inner.read().await;
        if let Some(expected) = inner.dimensions {
            if query.len() != expected {
                return Err(RetrievalError::DimensionMismatch { expected, actual: query.len() });
            }
        }
        if !is_finite(query) {
            return Err(RetrievalError::EmbeddingFailed("non-finite value in query embedding".into()));
        }

        // Adding 0.0 folds -0.0 into 0.0 so the two tie under total_cmp.
        let mut scored: Vec<(f32, &StoredChunk)> = inner
            .chunks
            .iter()
            .map(|chunk| (self.similarity.score(query, &chunk.embedding) + 0.0, chunk))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(score, chunk)| RetrievedChunk {
                text: chunk.text.clone(),
                embedding: chunk.embedding.clone(),
                score,
                metadata: chunk.metadata.clone(),
            })
            .collect())
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.chunks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.chunks.is_empty()
    }

    /// Drop every chunk. A dimension already fixed stays fixed.
    pub async fn clear(&self) {
        self.inner.write().await.chunks.clear();
    }

    /// Write the store to `path` as JSON, creating parent directories.
    pub async fn save(&self, path: &Path) -> Result<(), RetrievalError> {
        let inner = self.inner.read().await;
        let json = serde_json::to_string(&*inner)
            .map_err(|e| RetrievalError::Storage(format!("Failed to serialize vector store: {e}")))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RetrievalError::Storage(format!("Failed to create {}: {e}", parent.display())))?;
        }
        tokio::fs::write(path, json)
            .await
            .map_err(|e| RetrievalError::Storage(format!("Failed to write {}: {e}", path.display())))?;

        info!(path = %path.display(), chunks = inner.chunks.len(), "Vector store saved");
        Ok(())
    }

    /// Read a store saved by [`save`](Self::save). A missing file gives an empty store.
    pub async fn load(path: &Path, similarity: Similarity) -> Result<Self, RetrievalError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No vector store on disk yet");
                return Ok(Self::new(similarity));
            }
            Err(e) => return Err(RetrievalError::Storage(format!("Failed to read {}: {e}", path.display()))),
        };

        let snapshot: Snapshot = serde_json::from_str(&content)
            .map_err(|e| RetrievalError::Storage(format!("Corrupt vector store {}: {e}", path.display())))?;
        if let Some(expected) = snapshot.dimensions {
            if let Some(bad) = snapshot.chunks.iter().find(|c| c.embedding.len() != expected) {
                return Err(RetrievalError::DimensionMismatch { expected, actual: bad.embedding.len() });
            }
        }

        debug!(path = %path.display(), chunks = snapshot.chunks.len(), "Vector store loaded");
        Ok(Self { similarity, inner: RwLock::new(snapshot) })
    }
}

fn is_finite(vector: &[f32]) -> bool {
    vector.iter().all(|x| x.is_finite())
}
