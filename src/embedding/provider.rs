//! Embedding provider configuration and factory.
//!
//! Backends are selected via a tagged enum configuration loaded from
//! `{project_dir}/embedding.toml` or the `SIFT_EMBEDDING_PROVIDER` env var
//! (JSON). The deterministic hashed embedding is always registered; a
//! candle-backed BERT model is added when configured.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::embedding::candle_backend::load_bert_embedder;
use crate::embedding::{Embedder, HashedEmbedder};
use crate::error::SiftError;

/// Embedding provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum EmbeddingProviderConfig {
    /// Deterministic hashed n-gram embedding; no model files.
    Hashed,
    /// Local BERT model via candle (BGE family).
    Bert {
        /// Registry name for the embedding (e.g. "bge-small").
        name: String,
        /// HuggingFace repo id (default: BAAI/bge-small-en-v1.5).
        #[serde(default = "default_repo_id")]
        repo_id: String,
        /// Cache directory override for model files.
        #[serde(default)]
        cache_dir: Option<String>,
    },
}

fn default_repo_id() -> String {
    "BAAI/bge-small-en-v1.5".to_string()
}

impl Default for EmbeddingProviderConfig {
    fn default() -> Self {
        Self::Hashed
    }
}

/// Load provider config with priority:
/// 1. `{project_dir}/embedding.toml`
/// 2. `SIFT_EMBEDDING_PROVIDER` env var (JSON)
/// 3. Default (hashed)
pub fn load_provider_config(project_dir: &Path) -> EmbeddingProviderConfig {
    let config_path = project_dir.join("embedding.toml");
    if config_path.exists() {
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str::<EmbeddingProviderConfig>(&contents) {
                Ok(config) => {
                    info!("Loaded embedding config from {}", config_path.display());
                    return config;
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse {}: {}. Using default.",
                        config_path.display(),
                        e
                    );
                }
            },
            Err(e) => {
                tracing::warn!(
                    "Failed to read {}: {}. Using default.",
                    config_path.display(),
                    e
                );
            }
        }
    }

    if let Ok(json) = std::env::var("SIFT_EMBEDDING_PROVIDER") {
        match serde_json::from_str::<EmbeddingProviderConfig>(&json) {
            Ok(config) => {
                info!("Loaded embedding config from SIFT_EMBEDDING_PROVIDER env");
                return config;
            }
            Err(e) => {
                tracing::warn!("Failed to parse SIFT_EMBEDDING_PROVIDER: {}. Using default.", e);
            }
        }
    }

    EmbeddingProviderConfig::default()
}

/// Create an embedder from provider configuration.
pub fn create_embedder(
    config: &EmbeddingProviderConfig,
) -> Result<Arc<dyn Embedder>, SiftError> {
    match config {
        EmbeddingProviderConfig::Hashed => Ok(Arc::new(HashedEmbedder::default())),
        EmbeddingProviderConfig::Bert {
            name,
            repo_id,
            cache_dir,
        } => {
            let embedder =
                load_bert_embedder(name, repo_id, cache_dir.as_deref().map(Path::new))?;
            Ok(Arc::new(embedder))
        }
    }
}
