//! Candle-based BERT embedding backend.
//!
//! Pure-Rust ML runtime with Metal/CUDA acceleration where the feature is
//! enabled. Wraps a `BertModel` for sentence embeddings via mean pooling
//! and L2 normalization; compatible with BGE-small/base/large-en-v1.5.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use candle_core::{DType, Device, Tensor};
use candle_nn::{LayerNorm, Module, VarBuilder};
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer};

use crate::embedding::{Chunker, Embedder};
use crate::error::SiftError;

/// Paths to downloaded model files from HuggingFace Hub.
pub struct ModelFiles {
    pub config_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub weights_path: PathBuf,
}

/// Download model files from HuggingFace Hub.
///
/// Uses `hf_hub::api::sync::Api` which caches at `~/.cache/huggingface/hub/`.
/// Synchronous I/O — call from `spawn_blocking`.
pub fn download_model(repo_id: &str) -> Result<ModelFiles, SiftError> {
    let api = hf_hub::api::sync::Api::new()
        .map_err(|e| SiftError::Validation(format!("HuggingFace Hub API init failed: {e}")))?;
    let repo = api.model(repo_id.to_string());

    let get = |file: &str| {
        repo.get(file).map_err(|e| {
            SiftError::Validation(format!("failed to download {file} for {repo_id}: {e}"))
        })
    };
    Ok(ModelFiles {
        config_path: get("config.json")?,
        tokenizer_path: get("tokenizer.json")?,
        weights_path: get("model.safetensors")?,
    })
}

/// Select the best available compute device.
///
/// Probes layer-norm support since BERT requires it; falls back to CPU if
/// the GPU backend lacks the kernel.
pub fn select_device() -> Device {
    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            if probe_layer_norm(&device) {
                tracing::info!("Using Metal GPU for embedding inference");
                return device;
            }
            tracing::warn!("Metal GPU available but layer-norm not supported, falling back to CPU");
        }
    }
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            if probe_layer_norm(&device) {
                tracing::info!("Using CUDA GPU for embedding inference");
                return device;
            }
            tracing::warn!("CUDA GPU available but layer-norm not supported, falling back to CPU");
        }
    }
    tracing::info!("Using CPU for embedding inference");
    Device::Cpu
}

#[allow(dead_code)]
fn probe_layer_norm(device: &Device) -> bool {
    (|| -> candle_core::Result<()> {
        let weight = Tensor::ones(4, DType::F32, device)?;
        let bias = Tensor::zeros(4, DType::F32, device)?;
        let ln = LayerNorm::new(weight, bias, 1e-5);
        let input = Tensor::randn(0f32, 1.0, (1, 4), device)?;
        let _ = ln.forward(&input)?;
        Ok(())
    })()
    .is_ok()
}

/// BERT-based text embedder registered under a model name.
pub struct BertEmbedder {
    name: String,
    dimensions: usize,
    // Tokenizer::encode_batch takes &self but the model forward pass is
    // not Sync; serialize inference behind a mutex.
    inner: Mutex<BertInner>,
}

struct BertInner {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
}

impl BertEmbedder {
    /// Load a BERT embedding model from downloaded files.
    pub fn new(
        name: impl Into<String>,
        files: &ModelFiles,
        device: Device,
    ) -> Result<Self, SiftError> {
        let config_str = std::fs::read_to_string(&files.config_path)?;
        let config: BertConfig = serde_json::from_str(&config_str)?;
        let dimensions = config.hidden_size;

        let mut tokenizer = Tokenizer::from_file(&files.tokenizer_path)
            .map_err(|e| SiftError::Validation(format!("failed to load tokenizer: {e}")))?;
        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            ..Default::default()
        }));

        // SAFETY: mmap'd safetensors file — safe as long as the file is not
        // modified while the model is in use.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&files.weights_path], DType::F32, &device)
                .map_err(|e| SiftError::Validation(format!("failed to load weights: {e}")))?
        };
        let model = BertModel::load(vb, &config)
            .map_err(|e| SiftError::Validation(format!("failed to construct BERT model: {e}")))?;

        Ok(Self {
            name: name.into(),
            dimensions,
            inner: Mutex::new(BertInner {
                model,
                tokenizer,
                device,
            }),
        })
    }

    fn embed_blocking(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SiftError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let inner = self.inner.lock().expect("embedder mutex poisoned");
        let str_refs: Vec<&str> = texts.iter().map(|s| s.as_str()).collect();
        let encodings = inner
            .tokenizer
            .encode_batch(str_refs, true)
            .map_err(|e| SiftError::Validation(format!("tokenization failed: {e}")))?;

        let infer = || -> candle_core::Result<Vec<Vec<f32>>> {
            let batch_size = encodings.len();
            let max_len = encodings.iter().map(|e| e.get_ids().len()).max().unwrap_or(0);

            let input_ids: Vec<u32> = encodings.iter().flat_map(|e| e.get_ids().to_vec()).collect();
            let attention_mask: Vec<u32> = encodings
                .iter()
                .flat_map(|e| e.get_attention_mask().to_vec())
                .collect();
            let token_type_ids: Vec<u32> =
                encodings.iter().flat_map(|e| e.get_type_ids().to_vec()).collect();

            let input_ids = Tensor::from_vec(input_ids, (batch_size, max_len), &inner.device)?;
            let attention_mask_t =
                Tensor::from_vec(attention_mask, (batch_size, max_len), &inner.device)?;
            let token_type_ids =
                Tensor::from_vec(token_type_ids, (batch_size, max_len), &inner.device)?;

            // Forward pass -> [batch, seq_len, hidden_size]
            let output =
                inner
                    .model
                    .forward(&input_ids, &token_type_ids, Some(&attention_mask_t))?;

            // Mean pooling: mask padding tokens, sum, divide by token count
            let mask_f32 = attention_mask_t.to_dtype(DType::F32)?.unsqueeze(2)?;
            let masked = output.broadcast_mul(&mask_f32)?;
            let summed = masked.sum(1)?;
            let counts = mask_f32.sum(1)?;
            let pooled = summed.broadcast_div(&counts)?;

            // L2 normalize
            let norms = pooled.sqr()?.sum_keepdim(1)?.sqrt()?;
            let normalized = pooled.broadcast_div(&norms)?;

            normalized.to_vec2::<f32>()
        };
        infer().map_err(|e| SiftError::Validation(format!("embedding inference failed: {e}")))
    }
}

#[async_trait]
impl Embedder for BertEmbedder {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn chunker(&self) -> Chunker {
        Chunker::Sentences { max_len: 512 }
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SiftError> {
        self.embed_blocking(texts)
    }
}

/// Load a BERT embedder, downloading model files on first use.
pub fn load_bert_embedder(
    name: &str,
    repo_id: &str,
    _cache_dir: Option<&Path>,
) -> Result<BertEmbedder, SiftError> {
    let files = download_model(repo_id)?;
    BertEmbedder::new(name, &files, select_device())
}
