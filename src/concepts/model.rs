//! Concept model training, calibration, and scoring.
//!
//! A concept model is a linear classifier over one named embedding: an
//! L2-regularized logistic fit on the examples' vectors, plus a monotone
//! calibration so 0.5 is the decision boundary. Models are small
//! (parameters ≈ embedding dimension), training is synchronous, and
//! artifacts are published copy-on-write per `(examples-hash, embedding)`.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use linfa::prelude::*;
use linfa::Dataset;
use linfa_logistic::LogisticRegression;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::concepts::{Concept, ConceptStore};
use crate::utils::fs::atomic_write_json;
use crate::embedding::EmbeddingRegistry;
use crate::error::{ConceptError, SiftError};
use crate::utils::math::{roc_auc, sigmoid};

const L2_ALPHA: f64 = 0.01;
const MAX_ITERATIONS: u64 = 200;

/// Monotone calibration over raw logistic scores.
///
/// The logistic output is already a sigmoid with its decision boundary at
/// 0.5; calibration fixes orientation (some fits rank the positive class
/// low depending on label mapping) and clamps. Kept as its own type so a
/// Platt or isotonic fit can replace it without touching callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub flipped: bool,
}

impl Calibration {
    pub fn apply(&self, raw: f64) -> f64 {
        let score = if self.flipped { 1.0 - raw } else { raw };
        score.clamp(0.0, 1.0)
    }
}

/// Quality metrics reported per trained model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptMetrics {
    pub roc_auc: f64,
    pub f1: f64,
    pub precision: f64,
    pub recall: f64,
    pub num_positives: usize,
    pub num_negatives: usize,
    /// False when too few examples for k-fold and metrics are in-sample.
    pub cross_validated: bool,
}

/// A trained, calibrated concept model: `vector → score ∈ [0, 1]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptModel {
    pub namespace: String,
    pub name: String,
    pub embedding: String,
    pub concept_version: u64,
    pub examples_hash: String,
    pub dimensions: usize,
    pub weights: Vec<f64>,
    pub intercept: f64,
    pub calibration: Calibration,
    pub metrics: ConceptMetrics,
    pub trained_at: DateTime<Utc>,
}

impl ConceptModel {
    fn raw_score(&self, vector: &[f32]) -> f64 {
        let dot: f64 = self
            .weights
            .iter()
            .zip(vector.iter())
            .map(|(w, x)| w * *x as f64)
            .sum();
        sigmoid(dot + self.intercept)
    }

    /// Score a single vector.
    pub fn score_one(&self, vector: &[f32]) -> Result<f64, SiftError> {
        if vector.len() != self.dimensions {
            return Err(ConceptError::EmbeddingMismatch {
                namespace: self.namespace.clone(),
                name: self.name.clone(),
                expected: self.dimensions,
                actual: vector.len(),
            }
            .into());
        }
        Ok(self.calibration.apply(self.raw_score(vector)))
    }

    /// Score a batch of vectors.
    pub fn score(&self, vectors: &[Vec<f32>]) -> Result<Vec<f64>, SiftError> {
        vectors.iter().map(|v| self.score_one(v)).collect()
    }
}

/// Trains and caches concept models.
///
/// Artifacts live under the cache dir, one file per
/// `(namespace, name, embedding)`, replaced atomically on retrain;
/// in-process copies are cached keyed by the examples hash so any edit
/// invalidates.
pub struct ConceptScorer {
    store: Arc<ConceptStore>,
    embeddings: Arc<EmbeddingRegistry>,
    cache_dir: PathBuf,
    cache: moka::future::Cache<String, Arc<ConceptModel>>,
}

impl ConceptScorer {
    pub fn new(
        store: Arc<ConceptStore>,
        embeddings: Arc<EmbeddingRegistry>,
        cache_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            embeddings,
            cache_dir: cache_dir.into(),
            cache: moka::future::Cache::new(64),
        }
    }

    fn artifact_path(&self, namespace: &str, name: &str, embedding: &str) -> PathBuf {
        self.cache_dir
            .join(format!("{namespace}_{name}_{embedding}.json"))
    }

    /// Current model for `(concept, embedding)`, training if the cached
    /// artifact is missing or stale against the example set.
    pub async fn get_or_train(
        &self,
        namespace: &str,
        name: &str,
        embedding: &str,
    ) -> Result<Arc<ConceptModel>, SiftError> {
        let concept = self.store.get(namespace, name)?;
        let hash = concept.examples_hash();
        let key = format!("{namespace}/{name}/{embedding}/{hash}");

        if let Some(model) = self.cache.get(&key).await {
            return Ok(model);
        }

        let artifact = self.artifact_path(namespace, name, embedding);
        if let Ok(contents) = std::fs::read_to_string(&artifact) {
            if let Ok(model) = serde_json::from_str::<ConceptModel>(&contents) {
                if model.examples_hash == hash {
                    let model = Arc::new(model);
                    self.cache.insert(key, model.clone()).await;
                    return Ok(model);
                }
            }
        }

        let model = Arc::new(self.train(&concept, embedding).await?);
        std::fs::create_dir_all(&self.cache_dir)?;
        atomic_write_json(&artifact, model.as_ref())?;
        self.cache.insert(key, model.clone()).await;
        Ok(model)
    }

    /// Fit a model for `concept` over the named embedding.
    pub async fn train(
        &self,
        concept: &Concept,
        embedding_name: &str,
    ) -> Result<ConceptModel, SiftError> {
        let num_positives = concept.num_positives();
        let num_negatives = concept.num_negatives();
        if num_negatives == 0 {
            return Err(ConceptError::NeedsNegatives {
                namespace: concept.namespace.clone(),
                name: concept.name.clone(),
            }
            .into());
        }
        if num_positives == 0 {
            return Err(ConceptError::NeedsPositives {
                namespace: concept.namespace.clone(),
                name: concept.name.clone(),
            }
            .into());
        }

        let embedder = self.embeddings.get(embedding_name)?;
        let texts: Vec<String> = concept.examples.iter().map(|e| e.text.clone()).collect();
        let labels: Vec<bool> = concept.examples.iter().map(|e| e.label).collect();
        let vectors = embedder.embed_batch(&texts).await?;
        let dimensions = embedder.dimensions();

        let (weights, intercept) = fit_logistic(&vectors, &labels, dimensions)?;

        // Orientation: raw scores must rank positives above negatives.
        let raw: Vec<f64> = vectors
            .iter()
            .map(|v| sigmoid(dot(&weights, v) + intercept))
            .collect();
        let calibration = Calibration {
            flipped: roc_auc(&raw, &labels) < 0.5,
        };

        let metrics = cross_validated_metrics(
            &vectors,
            &labels,
            dimensions,
            num_positives,
            num_negatives,
            calibration,
        );

        info!(
            "Trained concept {}/{} over '{}': auc={:.3} f1={:.3} ({} pos / {} neg)",
            concept.namespace,
            concept.name,
            embedding_name,
            metrics.roc_auc,
            metrics.f1,
            num_positives,
            num_negatives
        );

        Ok(ConceptModel {
            namespace: concept.namespace.clone(),
            name: concept.name.clone(),
            embedding: embedding_name.to_string(),
            concept_version: concept.version,
            examples_hash: concept.examples_hash(),
            dimensions,
            weights,
            intercept,
            calibration,
            metrics,
            trained_at: Utc::now(),
        })
    }
}

fn dot(weights: &[f64], vector: &[f32]) -> f64 {
    weights
        .iter()
        .zip(vector.iter())
        .map(|(w, x)| w * *x as f64)
        .sum()
}

/// L2-regularized logistic fit; returns (weights, intercept).
fn fit_logistic(
    vectors: &[Vec<f32>],
    labels: &[bool],
    dimensions: usize,
) -> Result<(Vec<f64>, f64), SiftError> {
    let n = vectors.len();
    let mut records = Array2::<f64>::zeros((n, dimensions));
    for (i, vector) in vectors.iter().enumerate() {
        if vector.len() != dimensions {
            return Err(SiftError::Validation(format!(
                "embedding returned {} dims, expected {dimensions}",
                vector.len()
            )));
        }
        for (j, x) in vector.iter().enumerate() {
            records[(i, j)] = *x as f64;
        }
    }
    let targets = Array1::from(labels.to_vec());
    let dataset = Dataset::new(records, targets);

    let fitted = LogisticRegression::default()
        .alpha(L2_ALPHA)
        .max_iterations(MAX_ITERATIONS)
        .fit(&dataset)
        .map_err(|e| SiftError::Validation(format!("logistic fit failed: {e}")))?;

    let weights = fitted.params().to_vec();
    let intercept = fitted.intercept();
    Ok((weights, intercept))
}

/// K-fold metrics with stratified round-robin folds; falls back to
/// in-sample metrics when either class is too small to fold.
fn cross_validated_metrics(
    vectors: &[Vec<f32>],
    labels: &[bool],
    dimensions: usize,
    num_positives: usize,
    num_negatives: usize,
    calibration: Calibration,
) -> ConceptMetrics {
    let k = 5.min(num_positives).min(num_negatives);
    let mut pooled: Vec<(f64, bool)> = Vec::new();
    let mut cross_validated = false;

    if k >= 2 {
        // Fold assignment is round-robin within each class so every fold
        // keeps both classes in its training split.
        let mut fold_of = vec![0usize; labels.len()];
        let mut pos_seen = 0usize;
        let mut neg_seen = 0usize;
        for (i, label) in labels.iter().enumerate() {
            if *label {
                fold_of[i] = pos_seen % k;
                pos_seen += 1;
            } else {
                fold_of[i] = neg_seen % k;
                neg_seen += 1;
            }
        }
        for fold in 0..k {
            let train_idx: Vec<usize> =
                (0..labels.len()).filter(|i| fold_of[*i] != fold).collect();
            let test_idx: Vec<usize> =
                (0..labels.len()).filter(|i| fold_of[*i] == fold).collect();
            let train_vecs: Vec<Vec<f32>> =
                train_idx.iter().map(|i| vectors[*i].clone()).collect();
            let train_labels: Vec<bool> = train_idx.iter().map(|i| labels[*i]).collect();
            let Ok((weights, intercept)) = fit_logistic(&train_vecs, &train_labels, dimensions)
            else {
                continue;
            };
            for i in test_idx {
                let score = calibration.apply(sigmoid(dot(&weights, &vectors[i]) + intercept));
                pooled.push((score, labels[i]));
            }
        }
        cross_validated = pooled.len() == labels.len();
    }

    if pooled.is_empty() {
        // In-sample fallback.
        if let Ok((weights, intercept)) = fit_logistic(vectors, labels, dimensions) {
            for (v, label) in vectors.iter().zip(labels.iter()) {
                let score = calibration.apply(sigmoid(dot(&weights, v) + intercept));
                pooled.push((score, *label));
            }
        }
        cross_validated = false;
    }

    let scores: Vec<f64> = pooled.iter().map(|(s, _)| *s).collect();
    let pooled_labels: Vec<bool> = pooled.iter().map(|(_, l)| *l).collect();
    let auc = roc_auc(&scores, &pooled_labels);

    let mut tp = 0usize;
    let mut fp = 0usize;
    let mut fn_ = 0usize;
    for (score, label) in &pooled {
        let predicted = *score > 0.5;
        match (predicted, label) {
            (true, true) => tp += 1,
            (true, false) => fp += 1,
            (false, true) => fn_ += 1,
            (false, false) => {}
        }
    }
    let precision = if tp + fp > 0 {
        tp as f64 / (tp + fp) as f64
    } else {
        0.0
    };
    let recall = if tp + fn_ > 0 {
        tp as f64 / (tp + fn_) as f64
    } else {
        0.0
    };
    let f1 = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };

    ConceptMetrics {
        roc_auc: auc,
        f1,
        precision,
        recall,
        num_positives,
        num_negatives,
        cross_validated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concepts::{ConceptEdit, ConceptType, ExampleIn};
    use tempfile::TempDir;

    fn scorer() -> (TempDir, ConceptScorer, Arc<ConceptStore>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ConceptStore::new(dir.path().join("concepts")));
        let embeddings = Arc::new(EmbeddingRegistry::new());
        let scorer = ConceptScorer::new(
            store.clone(),
            embeddings,
            dir.path().join(".cache/concept_models"),
        );
        (dir, scorer, store)
    }

    fn example(label: bool, text: &str) -> ExampleIn {
        ExampleIn {
            label,
            text: text.to_string(),
            origin: None,
        }
    }

    fn seeded_concept(store: &ConceptStore) -> Concept {
        store.create("local", "gibberish", ConceptType::Text).unwrap();
        store
            .edit(
                "local",
                "gibberish",
                ConceptEdit {
                    insert: vec![
                        example(true, "asdgasdgkasd;lkgajsdl"),
                        example(true, "11757578jfdjja"),
                        example(true, "zzkqj xxplm qqrrw"),
                        example(false, "This is normal text."),
                        example(false, "The meeting starts at noon."),
                        example(false, "Please review the attached document."),
                    ],
                    ..Default::default()
                },
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_train_refuses_without_negatives() {
        let (_dir, scorer, store) = scorer();
        store.create("local", "onlypos", ConceptType::Text).unwrap();
        let concept = store
            .edit(
                "local",
                "onlypos",
                ConceptEdit {
                    insert: vec![example(true, "positive only")],
                    ..Default::default()
                },
            )
            .unwrap();
        let result = scorer.train(&concept, "hash128").await;
        assert!(matches!(
            result,
            Err(SiftError::Concept(ConceptError::NeedsNegatives { .. }))
        ));
    }

    #[tokio::test]
    async fn test_train_separates_classes() {
        let (_dir, scorer, store) = scorer();
        let concept = seeded_concept(&store);
        let model = scorer.train(&concept, "hash128").await.unwrap();

        assert_eq!(model.dimensions, 128);
        assert_eq!(model.metrics.num_positives, 3);
        assert_eq!(model.metrics.num_negatives, 3);

        let embedder = EmbeddingRegistry::new().get("hash128").unwrap();
        let vectors = embedder
            .embed_batch(&[
                "asdgasdgasdg".to_string(),
                "This is normal text.".to_string(),
            ])
            .await
            .unwrap();
        let scores = model.score(&vectors).unwrap();
        assert!(
            scores[0] > 0.5,
            "gibberish should score above threshold, got {}",
            scores[0]
        );
        assert!(
            scores[1] < 0.5,
            "normal text should score below threshold, got {}",
            scores[1]
        );
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let (_dir, scorer, store) = scorer();
        let concept = seeded_concept(&store);
        let model = scorer.train(&concept, "hash128").await.unwrap();
        let result = model.score(&[vec![0.0; 64]]);
        assert!(matches!(
            result,
            Err(SiftError::Concept(ConceptError::EmbeddingMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn test_artifact_reused_until_edit() {
        let (_dir, scorer, store) = scorer();
        seeded_concept(&store);
        let first = scorer.get_or_train("local", "gibberish", "hash128").await.unwrap();
        let second = scorer.get_or_train("local", "gibberish", "hash128").await.unwrap();
        assert_eq!(first.examples_hash, second.examples_hash);
        assert_eq!(first.trained_at, second.trained_at);

        store
            .edit(
                "local",
                "gibberish",
                ConceptEdit {
                    insert: vec![example(false, "another mundane sentence")],
                    ..Default::default()
                },
            )
            .unwrap();
        let third = scorer.get_or_train("local", "gibberish", "hash128").await.unwrap();
        assert_ne!(first.examples_hash, third.examples_hash);
    }
}
