//! Application context: project directory resolution and the shared
//! registries every dataset operation hangs off.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::warn;

use crate::concepts::{ConceptScorer, ConceptStore};
use crate::dataset::Dataset;
use crate::embedding::provider::load_provider_config;
use crate::embedding::{create_embedder, EmbeddingProviderConfig, EmbeddingRegistry};
use crate::error::SiftError;
use crate::schema::Schema;
use crate::signals::SignalRegistry;

const DATASETS_DIR: &str = "datasets";
const CONCEPTS_DIR: &str = "concepts";
const MODEL_CACHE_DIR: &str = ".cache/concept_models";

/// Shared handles for one project directory.
pub struct AppContext {
    pub project_dir: PathBuf,
    pub embeddings: Arc<EmbeddingRegistry>,
    pub concepts: Arc<ConceptStore>,
    pub scorer: Arc<ConceptScorer>,
    pub signals: Arc<SignalRegistry>,
}

impl AppContext {
    /// Resolve the project directory (flag, `SIFT_PROJECT_DIR`, or the
    /// platform data dir) and wire up the registries. The deterministic
    /// hashed embedding is always available; a configured BERT backend is
    /// registered on top when it loads.
    pub fn new(project_dir: Option<PathBuf>) -> Result<Self, SiftError> {
        let project_dir = project_dir
            .or_else(|| std::env::var_os("SIFT_PROJECT_DIR").map(PathBuf::from))
            .or_else(|| dirs::data_dir().map(|d| d.join("sift")))
            .ok_or_else(|| {
                SiftError::Validation("cannot determine a project directory".to_string())
            })?;
        std::fs::create_dir_all(&project_dir)?;

        let embeddings = Arc::new(EmbeddingRegistry::new());
        let provider = load_provider_config(&project_dir);
        if !matches!(provider, EmbeddingProviderConfig::Hashed) {
            match create_embedder(&provider) {
                Ok(embedder) => embeddings.register(embedder),
                Err(e) => warn!("configured embedding backend failed to load: {e}"),
            }
        }

        let concepts = Arc::new(ConceptStore::new(project_dir.join(CONCEPTS_DIR)));
        let scorer = Arc::new(ConceptScorer::new(
            concepts.clone(),
            embeddings.clone(),
            project_dir.join(MODEL_CACHE_DIR),
        ));
        let signals = Arc::new(SignalRegistry::new(embeddings.clone(), scorer.clone()));

        Ok(Self {
            project_dir,
            embeddings,
            concepts,
            scorer,
            signals,
        })
    }

    pub fn dataset_dir(&self, namespace: &str, name: &str) -> PathBuf {
        self.project_dir.join(DATASETS_DIR).join(namespace).join(name)
    }

    /// Create a dataset from parsed items, inferring the schema when none
    /// is given.
    pub async fn create_dataset(
        &self,
        namespace: &str,
        name: &str,
        items: &[serde_json::Value],
        schema: Option<Schema>,
    ) -> Result<Dataset, SiftError> {
        Dataset::create(
            self.dataset_dir(namespace, name),
            namespace,
            name,
            items,
            schema,
            self.signals.clone(),
        )
        .await
    }

    pub fn open_dataset(&self, namespace: &str, name: &str) -> Result<Dataset, SiftError> {
        Dataset::open(
            self.dataset_dir(namespace, name),
            namespace,
            name,
            self.signals.clone(),
        )
    }

    pub fn list_datasets(&self) -> Result<Vec<(String, String)>, SiftError> {
        let root = self.project_dir.join(DATASETS_DIR);
        let mut out = Vec::new();
        if !root.exists() {
            return Ok(out);
        }
        for ns_entry in std::fs::read_dir(&root)? {
            let ns_entry = ns_entry?;
            if !ns_entry.file_type()?.is_dir() {
                continue;
            }
            let namespace = ns_entry.file_name().to_string_lossy().into_owned();
            for ds_entry in std::fs::read_dir(ns_entry.path())? {
                let ds_entry = ds_entry?;
                if ds_entry.file_type()?.is_dir() {
                    out.push((
                        namespace.clone(),
                        ds_entry.file_name().to_string_lossy().into_owned(),
                    ));
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_context_creates_and_reopens_datasets() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = AppContext::new(Some(dir.path().to_path_buf())).unwrap();
        let items = vec![
            serde_json::json!({"q": "A"}),
            serde_json::json!({"q": "B"}),
        ];
        ctx.create_dataset("local", "demo", &items, None).await.unwrap();
        let reopened = ctx.open_dataset("local", "demo").unwrap();
        assert_eq!(reopened.num_rows(), 2);
        assert_eq!(
            ctx.list_datasets().unwrap(),
            vec![("local".to_string(), "demo".to_string())]
        );
    }

    #[test]
    fn test_missing_dataset_is_typed() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = AppContext::new(Some(dir.path().to_path_buf())).unwrap();
        assert!(matches!(
            ctx.open_dataset("local", "nope"),
            Err(SiftError::DatasetNotFound { .. })
        ));
    }
}
