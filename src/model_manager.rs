use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config, DTYPE};
use hf_hub::api::sync::ApiBuilder;
use serde::Deserialize;
use tokenizers::{
    PaddingParams,
    PaddingStrategy,
    Tokenizer,
    TruncationParams,
};

use crate::{
    embedding::Embedder,
    error::{Error, Result},
};

pub const DEFAULT_MODEL_ID: &str = "sentence-transformers/all-MiniLM-L6-v2";
pub const MODEL_ENV_VAR: &str = "LOCALRAG_EMBED_MODEL";
pub const HF_TOKEN_ENV_VAR: &str = "HF_TOKEN";

/// Longer inputs are truncated to this many tokens.
const MAX_SEQUENCE_LENGTH: usize = 256;

/// Select the best available compute device.
///
/// Uses CUDA when compiled with the `cuda` feature, Metal when compiled with
/// the `metal` feature, and falls back to CPU otherwise.
fn default_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }

    Device::Cpu
}

struct LoadedModel {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    dimension: usize,
}

#[derive(Deserialize)]
struct HiddenSize {
    hidden_size: usize,
}

/// Manages the sentence-embedding model lifecycle, supporting lazy loading
/// on first use.
pub struct ModelManager {
    model: Option<LoadedModel>,
    model_id: String,
}

impl Default for ModelManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelManager {
    /// Creates a new `ModelManager`. The model ID is resolved from:
    /// 1. The `LOCALRAG_EMBED_MODEL` environment variable, if set
    /// 2. Otherwise, the default model (`sentence-transformers/all-MiniLM-L6-v2`)
    ///
    /// The model is not loaded until the first call to `embed`.
    pub fn new() -> Self {
        let model_id = std::env::var(MODEL_ENV_VAR)
            .unwrap_or_else(|_| DEFAULT_MODEL_ID.to_string());

        Self::with_model_id(model_id)
    }

    /// Creates a `ModelManager` with an explicit model ID, bypassing
    /// environment variable resolution.
    ///
    /// The ID is either a Hugging Face Hub repository or a local directory
    /// holding `config.json`, `tokenizer.json` and `model.safetensors`.
    pub fn with_model_id(model_id: String) -> Self {
        Self {
            model: None,
            model_id,
        }
    }

    /// Returns `true` if the model has already been loaded into memory.
    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Ensures the model is loaded, downloading from HuggingFace Hub if needed.
    fn ensure_loaded(&mut self) -> Result<&mut LoadedModel> {
        if self.model.is_none() {
            self.model = Some(load_model(&self.model_id)?);
        }

        self.model
            .as_mut()
            .ok_or_else(|| Error::Embedding("model failed to load".into()))
    }
}

impl Embedder for ModelManager {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&mut self) -> Result<usize> {
        Ok(self.ensure_loaded()?.dimension)
    }

    fn embed(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let loaded = self.ensure_loaded()?;
        let encodings = loaded
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| Error::Embedding(format!("tokenization failed: {e}")))?;

        let ids = encodings
            .iter()
            .map(|e| Tensor::new(e.get_ids(), &loaded.device))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let masks = encodings
            .iter()
            .map(|e| Tensor::new(e.get_attention_mask(), &loaded.device))
            .collect::<candle_core::Result<Vec<_>>>()?;

        let input_ids = Tensor::stack(&ids, 0)?;
        let attention_mask = Tensor::stack(&masks, 0)?;
        let token_type_ids = input_ids.zeros_like()?;

        let hidden =
            loaded
                .model
                .forward(&input_ids, &token_type_ids, Some(&attention_mask))?;
        let pooled = mean_pool_normalized(&hidden, &attention_mask)?;

        Ok(pooled.to_dtype(DType::F32)?.to_vec2::<f32>()?)
    }
}

fn load_model(model_id: &str) -> Result<LoadedModel> {
    tracing::info!(model = model_id, "loading embedding model");
    let (config_path, tokenizer_path, weights_path) =
        resolve_model_files(model_id)?;

    let config_json = std::fs::read_to_string(&config_path)?;
    let config: Config = serde_json::from_str(&config_json)?;
    let HiddenSize { hidden_size } = serde_json::from_str(&config_json)?;

    let mut tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|e| {
        Error::Embedding(format!(
            "failed to load tokenizer {}: {e}",
            tokenizer_path.display()
        ))
    })?;
    tokenizer.with_padding(Some(PaddingParams {
        strategy: PaddingStrategy::BatchLongest,
        ..Default::default()
    }));
    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length: MAX_SEQUENCE_LENGTH,
            ..Default::default()
        }))
        .map_err(|e| Error::Embedding(format!("invalid truncation: {e}")))?;

    let device = default_device();
    let weights = std::fs::read(&weights_path)?;
    let vb = VarBuilder::from_buffered_safetensors(weights, DTYPE, &device)?;
    let model = BertModel::load(vb, &config)?;

    tracing::debug!(dimension = hidden_size, ?device, "embedding model ready");

    Ok(LoadedModel {
        model,
        tokenizer,
        device,
        dimension: hidden_size,
    })
}

/// Locate `config.json`, `tokenizer.json` and `model.safetensors`, either in
/// a local directory or in the Hugging Face Hub cache (downloading them when
/// missing).
fn resolve_model_files(model_id: &str) -> Result<(PathBuf, PathBuf, PathBuf)> {
    let local = Path::new(model_id);
    if local.is_dir() {
        let files = (
            local.join("config.json"),
            local.join("tokenizer.json"),
            local.join("model.safetensors"),
        );
        for path in [&files.0, &files.1, &files.2] {
            if !path.is_file() {
                return Err(Error::NotFound {
                    kind: "model file",
                    name: path.display().to_string(),
                });
            }
        }
        return Ok(files);
    }

    let api = ApiBuilder::new()
        .with_token(std::env::var(HF_TOKEN_ENV_VAR).ok())
        .build()
        .map_err(|e| {
            Error::Embedding(format!("failed to create hub client: {e}"))
        })?;
    let repo = api.model(model_id.to_string());
    let fetch = |name: &str| {
        repo.get(name).map_err(|e| {
            Error::Embedding(format!("failed to fetch {name} for {model_id}: {e}"))
        })
    };

    Ok((
        fetch("config.json")?,
        fetch("tokenizer.json")?,
        fetch("model.safetensors")?,
    ))
}

/// Average token states over the attention mask, then scale each row to
/// unit length.
///
/// `hidden` is `[batch, tokens, dim]`, `mask` is `[batch, tokens]`; the
/// result is `[batch, dim]`.
fn mean_pool_normalized(hidden: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let mask = mask.to_dtype(hidden.dtype())?.unsqueeze(2)?;
    let summed = hidden.broadcast_mul(&mask)?.sum(1)?;
    let counts = mask.sum(1)?;
    let mean = summed.broadcast_div(&counts)?;

    let norm = (mean.sqr()?.sum_keepdim(1)?.sqrt()? + 1e-12)?;
    Ok(mean.broadcast_div(&norm)?)
}
