//! Named embeddings.
//!
//! An embedding is a pure function `text → fixed-length float vector` with a
//! declared dimensionality and a chunker that decides which spans of a
//! document get embedded. The [`Embedder`] trait abstracts backends; the
//! registry resolves embeddings by name for pipelines, searches, and
//! concept scoring.

pub mod candle_backend;
pub mod hashed;
pub mod provider;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use unicode_segmentation::UnicodeSegmentation;

use crate::error::SiftError;

pub use hashed::HashedEmbedder;
pub use provider::{create_embedder, EmbeddingProviderConfig};

/// How a document is cut into chunks before embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunker {
    /// The whole document is a single chunk.
    Document,
    /// Unicode sentences, greedily packed up to `max_len` bytes per chunk.
    Sentences { max_len: usize },
}

impl Chunker {
    /// Byte-offset spans of each chunk.
    pub fn chunk(&self, text: &str) -> Vec<(u32, u32)> {
        if text.is_empty() {
            return Vec::new();
        }
        match self {
            Chunker::Document => vec![(0, text.len() as u32)],
            Chunker::Sentences { max_len } => {
                let mut spans = Vec::new();
                let mut chunk_start: Option<usize> = None;
                let mut chunk_end = 0usize;
                for (offset, sentence) in text.split_sentence_bound_indices() {
                    let end = offset + sentence.len();
                    match chunk_start {
                        None => {
                            chunk_start = Some(offset);
                            chunk_end = end;
                        }
                        Some(start) if end - start <= *max_len => {
                            chunk_end = end;
                        }
                        Some(start) => {
                            spans.push((start as u32, chunk_end as u32));
                            chunk_start = Some(offset);
                            chunk_end = end;
                        }
                    }
                }
                if let Some(start) = chunk_start {
                    spans.push((start as u32, chunk_end as u32));
                }
                spans
            }
        }
    }
}

/// A named embedding backend.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Registry name; also the field name the embedding nests under.
    fn name(&self) -> &str;

    /// Declared output dimensionality.
    fn dimensions(&self) -> usize;

    /// Chunker used when embedding documents. Concept examples and search
    /// queries are embedded whole regardless.
    fn chunker(&self) -> Chunker {
        Chunker::Sentences { max_len: 512 }
    }

    /// Embed a batch of texts, one vector per input.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SiftError>;
}

/// Name-keyed embedding registry.
pub struct EmbeddingRegistry {
    embedders: RwLock<HashMap<String, Arc<dyn Embedder>>>,
}

impl Default for EmbeddingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingRegistry {
    /// Registry with the built-in deterministic embedding pre-registered.
    pub fn new() -> Self {
        let registry = Self {
            embedders: RwLock::new(HashMap::new()),
        };
        registry.register(Arc::new(HashedEmbedder::default()));
        registry
    }

    pub fn register(&self, embedder: Arc<dyn Embedder>) {
        let name = embedder.name().to_string();
        self.embedders
            .write()
            .expect("embedding registry lock poisoned")
            .insert(name, embedder);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Embedder>, SiftError> {
        self.embedders
            .read()
            .expect("embedding registry lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| SiftError::UnknownEmbedding(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .embedders
            .read()
            .expect("embedding registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_chunker_single_span() {
        let spans = Chunker::Document.chunk("hello world");
        assert_eq!(spans, vec![(0, 11)]);
    }

    #[test]
    fn test_sentence_chunker_packs_up_to_max_len() {
        let text = "One sentence. Two sentence. Three sentence.";
        let spans = Chunker::Sentences { max_len: 30 }.chunk(text);
        assert!(spans.len() >= 2, "expected multiple chunks, got {spans:?}");
        assert_eq!(spans[0].0, 0);
        assert_eq!(spans.last().unwrap().1 as usize, text.len());
        // Chunks tile the text without overlap.
        for pair in spans.windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
        }
    }

    #[test]
    fn test_empty_text_has_no_chunks() {
        assert!(Chunker::Sentences { max_len: 128 }.chunk("").is_empty());
    }

    #[test]
    fn test_registry_resolves_builtin() {
        let registry = EmbeddingRegistry::new();
        let embedder = registry.get(hashed::HASHED_EMBEDDING_NAME).unwrap();
        assert_eq!(embedder.dimensions(), 128);
        assert!(matches!(
            registry.get("nope"),
            Err(SiftError::UnknownEmbedding(_))
        ));
    }
}
