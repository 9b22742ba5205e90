//! Signal registry: pluggable enrichments.
//!
//! A signal consumes a batch of inputs (text, or chunk embeddings read
//! from a materialized embedding column) and produces one output value per
//! input, shaped by its declared `output_schema`. Signals are pure with
//! respect to the batch; the only allowed process-global state is a lazily
//! loaded model.

pub mod embedding_signal;
pub mod lang_detect;
pub mod near_dup;
pub mod pii;
pub mod splitters;
pub mod substring;
pub mod text_stats;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::concepts::ConceptScorer;
use crate::embedding::EmbeddingRegistry;
use crate::error::SiftError;
use crate::schema::{DType, Field, Value};

pub use embedding_signal::{ConceptScoreSignal, EmbeddingSignal};
pub use lang_detect::LangDetectionSignal;
pub use near_dup::NearDupSignal;
pub use pii::PiiSignal;
pub use splitters::SplitterSignal;
pub use substring::SubstringSignal;
pub use text_stats::TextStatisticsSignal;

/// Serialized identity of an enrichment: signal name plus parameters.
/// Recorded in the manifest for lineage and idempotence checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
}

impl SignalDescriptor {
    pub fn new(name: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }
}

/// What a signal consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalInputType {
    Text,
    TextEmbedding,
}

/// One chunk's vector with its anchoring span.
#[derive(Debug, Clone)]
pub struct ChunkVector {
    pub start: u32,
    pub end: u32,
    pub vector: Vec<f32>,
}

/// A batch element handed to `compute`.
#[derive(Debug, Clone)]
pub enum SignalInput {
    Text(String),
    TextEmbedding(Vec<ChunkVector>),
}

impl SignalInput {
    pub fn as_text(&self) -> Result<&str, SiftError> {
        match self {
            SignalInput::Text(s) => Ok(s),
            SignalInput::TextEmbedding(_) => Err(SiftError::Validation(
                "signal expected text input, got embeddings".to_string(),
            )),
        }
    }

    pub fn as_chunks(&self) -> Result<&[ChunkVector], SiftError> {
        match self {
            SignalInput::TextEmbedding(chunks) => Ok(chunks),
            SignalInput::Text(_) => Err(SiftError::Validation(
                "signal expected embedding input, got text".to_string(),
            )),
        }
    }
}

/// A named enrichment.
#[async_trait]
pub trait Signal: Send + Sync {
    /// Identity recorded in the manifest.
    fn descriptor(&self) -> SignalDescriptor;

    fn input_type(&self) -> SignalInputType {
        SignalInputType::Text
    }

    /// Source dtypes this signal accepts.
    fn accepts(&self, dtype: DType) -> bool {
        dtype == DType::String
    }

    /// Schema of one output value.
    fn output_schema(&self) -> Field;

    /// Column name the output nests under when none is given.
    fn default_column_name(&self) -> String {
        self.descriptor().name
    }

    /// Compute one output per input. `None` means missing.
    async fn compute(&self, inputs: &[SignalInput]) -> Result<Vec<Option<Value>>, SiftError>;
}

/// Name-keyed signal registry.
///
/// Construction is by descriptor: parameters are deserialized per signal,
/// and the two distinguished variants get their dependencies here —
/// embedding signals an embedder, concept inference a trained-model
/// handle.
pub struct SignalRegistry {
    embeddings: Arc<EmbeddingRegistry>,
    scorer: Arc<ConceptScorer>,
}

impl SignalRegistry {
    pub fn new(embeddings: Arc<EmbeddingRegistry>, scorer: Arc<ConceptScorer>) -> Self {
        Self { embeddings, scorer }
    }

    pub fn embeddings(&self) -> &Arc<EmbeddingRegistry> {
        &self.embeddings
    }

    /// Resolve a descriptor to a runnable signal.
    pub fn resolve(&self, descriptor: &SignalDescriptor) -> Result<Arc<dyn Signal>, SiftError> {
        let signal: Arc<dyn Signal> = match descriptor.name.as_str() {
            lang_detect::NAME => Arc::new(LangDetectionSignal::default()),
            pii::NAME => Arc::new(PiiSignal::new()),
            text_stats::NAME => Arc::new(TextStatisticsSignal::default()),
            splitters::PARAGRAPHS => Arc::new(SplitterSignal::paragraphs()),
            splitters::SENTENCES => Arc::new(SplitterSignal::sentences()),
            near_dup::NAME => {
                let params: near_dup::NearDupParams =
                    serde_json::from_value(descriptor.params.clone()).unwrap_or_default();
                Arc::new(NearDupSignal::new(params))
            }
            substring::NAME => {
                let params: substring::SubstringParams =
                    serde_json::from_value(descriptor.params.clone())?;
                Arc::new(SubstringSignal::new(params)?)
            }
            embedding_signal::EMBEDDING_NAME => {
                let params: embedding_signal::EmbeddingParams =
                    serde_json::from_value(descriptor.params.clone())?;
                let embedder = self.embeddings.get(&params.embedding)?;
                Arc::new(EmbeddingSignal::new(embedder))
            }
            embedding_signal::CONCEPT_SCORE_NAME => {
                let params: embedding_signal::ConceptScoreParams =
                    serde_json::from_value(descriptor.params.clone())?;
                Arc::new(ConceptScoreSignal::new(self.scorer.clone(), params))
            }
            other => {
                return Err(SiftError::Validation(format!("unknown signal '{other}'")));
            }
        };
        Ok(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concepts::ConceptStore;

    fn registry() -> (tempfile::TempDir, SignalRegistry) {
        let dir = tempfile::TempDir::new().unwrap();
        let embeddings = Arc::new(EmbeddingRegistry::new());
        let store = Arc::new(ConceptStore::new(dir.path().join("concepts")));
        let scorer = Arc::new(ConceptScorer::new(
            store,
            embeddings.clone(),
            dir.path().join(".cache"),
        ));
        (dir, SignalRegistry::new(embeddings, scorer))
    }

    #[test]
    fn test_resolve_builtins() {
        let (_dir, registry) = registry();
        for name in ["lang_detection", "pii", "text_statistics", "paragraphs", "sentences"] {
            let descriptor = SignalDescriptor::new(name, serde_json::Value::Null);
            let signal = registry.resolve(&descriptor).unwrap();
            assert_eq!(signal.descriptor().name, name);
        }
    }

    #[test]
    fn test_resolve_unknown_fails() {
        let (_dir, registry) = registry();
        let descriptor = SignalDescriptor::new("nope", serde_json::Value::Null);
        assert!(registry.resolve(&descriptor).is_err());
    }

    #[test]
    fn test_resolve_embedding_requires_registered_name() {
        let (_dir, registry) = registry();
        let ok = SignalDescriptor::new("embedding", serde_json::json!({"embedding": "hash128"}));
        assert!(registry.resolve(&ok).is_ok());
        let missing =
            SignalDescriptor::new("embedding", serde_json::json!({"embedding": "missing"}));
        assert!(matches!(
            registry.resolve(&missing),
            Err(SiftError::UnknownEmbedding(_))
        ));
    }
}
