//! The two distinguished registry entries: embedding computation and
//! concept inference over a pre-computed embedding column.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::concepts::ConceptScorer;
use crate::embedding::Embedder;
use crate::error::SiftError;
use crate::schema::{DType, Field, Scalar, Value};
use crate::signals::{Signal, SignalDescriptor, SignalInput, SignalInputType};

pub const EMBEDDING_NAME: &str = "embedding";
pub const CONCEPT_SCORE_NAME: &str = "concept_score";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingParams {
    pub embedding: String,
}

/// Embeds each document's chunks, emitting `{span, embedding}` per chunk.
/// The chunker is declared by the embedding backend.
pub struct EmbeddingSignal {
    embedder: Arc<dyn Embedder>,
}

impl EmbeddingSignal {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }
}

#[async_trait]
impl Signal for EmbeddingSignal {
    fn descriptor(&self) -> SignalDescriptor {
        SignalDescriptor::new(
            EMBEDDING_NAME,
            serde_json::json!({ "embedding": self.embedder.name() }),
        )
    }

    fn output_schema(&self) -> Field {
        Field::repeated(Field::struct_of([
            ("span", Field::span()),
            ("embedding", Field::of(DType::Embedding)),
        ]))
    }

    fn default_column_name(&self) -> String {
        self.embedder.name().to_string()
    }

    async fn compute(&self, inputs: &[SignalInput]) -> Result<Vec<Option<Value>>, SiftError> {
        let chunker = self.embedder.chunker();

        // One embed call per batch: flatten every document's chunks, then
        // stitch the vectors back per document.
        let mut chunk_texts: Vec<String> = Vec::new();
        let mut spans_per_doc: Vec<Vec<(u32, u32)>> = Vec::with_capacity(inputs.len());
        for input in inputs {
            let text = input.as_text()?;
            let spans = chunker.chunk(text);
            for (start, end) in &spans {
                chunk_texts.push(text[*start as usize..*end as usize].to_string());
            }
            spans_per_doc.push(spans);
        }

        let vectors = self.embedder.embed_batch(&chunk_texts).await?;
        if vectors.len() != chunk_texts.len() {
            return Err(SiftError::Validation(format!(
                "embedding '{}' returned {} vectors for {} chunks",
                self.embedder.name(),
                vectors.len(),
                chunk_texts.len()
            )));
        }

        let mut vectors = vectors.into_iter();
        let mut out = Vec::with_capacity(inputs.len());
        for spans in spans_per_doc {
            let chunks: Vec<Value> = spans
                .into_iter()
                .map(|(start, end)| {
                    let vector = vectors.next().expect("one vector per chunk");
                    Value::Struct(BTreeMap::from([
                        ("span".to_string(), Value::span(start, end)),
                        (
                            "embedding".to_string(),
                            Value::Scalar(Scalar::Embedding(vector)),
                        ),
                    ]))
                })
                .collect();
            out.push(Some(Value::List(chunks)));
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptScoreParams {
    pub namespace: String,
    pub concept_name: String,
    pub embedding: String,
}

/// Scores each embedded chunk with a trained concept model, emitting
/// `{span, score}` per chunk. Input must point at a materialized
/// embedding column; the model is loaded lazily and cached per process.
pub struct ConceptScoreSignal {
    scorer: Arc<ConceptScorer>,
    params: ConceptScoreParams,
}

impl ConceptScoreSignal {
    pub fn new(scorer: Arc<ConceptScorer>, params: ConceptScoreParams) -> Self {
        Self { scorer, params }
    }
}

#[async_trait]
impl Signal for ConceptScoreSignal {
    fn descriptor(&self) -> SignalDescriptor {
        SignalDescriptor::new(
            CONCEPT_SCORE_NAME,
            serde_json::to_value(&self.params).unwrap_or(serde_json::Value::Null),
        )
    }

    fn input_type(&self) -> SignalInputType {
        SignalInputType::TextEmbedding
    }

    fn accepts(&self, dtype: DType) -> bool {
        dtype == DType::Embedding
    }

    fn output_schema(&self) -> Field {
        Field::repeated(Field::struct_of([
            ("span", Field::span()),
            ("score", Field::of(DType::Float32)),
        ]))
    }

    fn default_column_name(&self) -> String {
        format!(
            "{}/{}/{}",
            self.params.namespace, self.params.concept_name, self.params.embedding
        )
    }

    async fn compute(&self, inputs: &[SignalInput]) -> Result<Vec<Option<Value>>, SiftError> {
        let model = self
            .scorer
            .get_or_train(
                &self.params.namespace,
                &self.params.concept_name,
                &self.params.embedding,
            )
            .await?;

        let mut out = Vec::with_capacity(inputs.len());
        for input in inputs {
            let chunks = input.as_chunks()?;
            let scored: Vec<Value> = chunks
                .iter()
                .map(|chunk| {
                    let score = model.score_one(&chunk.vector)?;
                    Ok(Value::Struct(BTreeMap::from([
                        ("span".to_string(), Value::span(chunk.start, chunk.end)),
                        ("score".to_string(), Value::float(score)),
                    ])))
                })
                .collect::<Result<_, SiftError>>()?;
            out.push(Some(Value::List(scored)));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingRegistry;

    #[tokio::test]
    async fn test_embedding_signal_one_struct_per_chunk() {
        let registry = EmbeddingRegistry::new();
        let signal = EmbeddingSignal::new(registry.get("hash128").unwrap());
        let out = signal
            .compute(&[SignalInput::Text("Short text.".to_string())])
            .await
            .unwrap();
        let Some(Value::List(chunks)) = &out[0] else {
            panic!("expected chunk list");
        };
        assert_eq!(chunks.len(), 1);
        let Value::Struct(map) = &chunks[0] else {
            panic!("expected struct chunk");
        };
        assert_eq!(map["span"], Value::span(0, 11));
        let Value::Scalar(Scalar::Embedding(v)) = &map["embedding"] else {
            panic!("expected embedding");
        };
        assert_eq!(v.len(), 128);
    }
}
