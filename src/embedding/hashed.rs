//! Deterministic hashed n-gram embedding.
//!
//! Projects character trigrams and words into a fixed number of hash
//! buckets and L2-normalizes the result. No model download, no network,
//! fully deterministic — the embedding every project can fall back to and
//! the one the test suite runs against. Crude next to a transformer, but
//! lexically similar texts land close in cosine space, which is what
//! semantic search and concept training need from it.

use std::io::Cursor;

use async_trait::async_trait;

use crate::embedding::{Chunker, Embedder};
use crate::error::SiftError;

pub const HASHED_EMBEDDING_NAME: &str = "hash128";
const DIMENSIONS: usize = 128;
const TRIGRAM_SEED: u32 = 0x5f17;
const WORD_SEED: u32 = 0x9e37;

/// Hashed char-trigram + word embedding.
pub struct HashedEmbedder {
    dimensions: usize,
}

impl Default for HashedEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DIMENSIONS,
        }
    }
}

impl HashedEmbedder {
    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions];
        let lowered = text.to_lowercase();

        let chars: Vec<char> = lowered.chars().collect();
        for window in chars.windows(3) {
            let gram: String = window.iter().collect();
            let bucket = hash_bucket(&gram, TRIGRAM_SEED, self.dimensions);
            vector[bucket] += 1.0;
        }
        for word in lowered.split_whitespace() {
            let bucket = hash_bucket(word, WORD_SEED, self.dimensions);
            vector[bucket] += 2.0;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

fn hash_bucket(token: &str, seed: u32, dimensions: usize) -> usize {
    let hash = murmur3::murmur3_32(&mut Cursor::new(token.as_bytes()), seed)
        .expect("murmur3 over an in-memory cursor cannot fail");
    hash as usize % dimensions
}

#[async_trait]
impl Embedder for HashedEmbedder {
    fn name(&self) -> &str {
        HASHED_EMBEDDING_NAME
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn chunker(&self) -> Chunker {
        Chunker::Sentences { max_len: 512 }
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SiftError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::math::cosine_similarity;

    #[tokio::test]
    async fn test_deterministic() {
        let embedder = HashedEmbedder::default();
        let a = embedder.embed_batch(&["hello world".to_string()]).await.unwrap();
        let b = embedder.embed_batch(&["hello world".to_string()]).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_unit_norm() {
        let embedder = HashedEmbedder::default();
        let out = embedder
            .embed_batch(&["some reasonable text".to_string()])
            .await
            .unwrap();
        let norm: f32 = out[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5, "expected unit norm, got {norm}");
    }

    #[tokio::test]
    async fn test_similar_texts_are_closer_than_dissimilar() {
        let embedder = HashedEmbedder::default();
        let out = embedder
            .embed_batch(&[
                "the treasure hunt begins at dawn".to_string(),
                "a treasure hunt started this morning".to_string(),
                "quarterly revenue grew four percent".to_string(),
            ])
            .await
            .unwrap();
        let close = cosine_similarity(&out[0], &out[1]);
        let far = cosine_similarity(&out[0], &out[2]);
        assert!(
            close > far,
            "lexically similar texts should be closer: {close} vs {far}"
        );
    }
}
