//! # OmniBridge Retrieval
//!
//! Optional knowledge augmentation: documents are split into overlapping
//! chunks, encoded into vectors, and searched by similarity to the user's
//! input. The agent loop injects the best matches as a system message.

pub mod encoder;
pub mod retriever;
pub mod splitter;
pub mod store;
pub mod vector;

pub use encoder::{EmbeddingEncoder, HashingEncoder, OpenAiEncoder};
pub use retriever::{Document, Retriever, format_context};
pub use splitter::TextSplitter;
pub use store::{RetrievedChunk, StoredChunk, VectorStore};
pub use vector::{Similarity, cosine_similarity};
