use std::{num::NonZeroU32, path::Path};

use llama_cpp_2::{
    LogOptions,
    context::params::LlamaContextParams,
    llama_backend::LlamaBackend,
    llama_batch::LlamaBatch,
    model::{AddBos, LlamaModel, Special, params::LlamaModelParams},
    sampling::LlamaSampler,
    send_logs_to_tracing,
};

use crate::{
    error::{Error, Result},
    text_util::sanitize_prompt,
};

pub const MODEL_ENV_VAR: &str = "LOCALRAG_LLM_MODEL";

/// File name looked up in the data directory's `models/` folder when no
/// model path is given.
pub const DEFAULT_MODEL_FILE: &str = "orca-mini-3b-gguf2-q4_0.gguf";

/// Produces a completion for a prompt.
pub trait Generator {
    fn complete(&mut self, prompt: &str) -> Result<String>;
}

/// Sampling and context parameters for the local language model.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    /// Context window in tokens, shared by prompt and answer.
    pub context_size: u32,
    /// Upper bound on generated tokens per answer.
    pub max_tokens: usize,
    /// 0.0 selects greedy decoding.
    pub temperature: f32,
    pub top_k: i32,
    pub top_p: f32,
    pub seed: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            context_size: 2048,
            max_tokens: 200,
            temperature: 0.7,
            top_k: 40,
            top_p: 0.4,
            seed: 42,
        }
    }
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.context_size == 0 {
            return Err(Error::Config(
                "context size must be at least 1".to_string(),
            ));
        }
        if self.max_tokens == 0 {
            return Err(Error::Config(
                "max tokens must be at least 1".to_string(),
            ));
        }
        if self.temperature.is_nan() || self.temperature < 0.0 {
            return Err(Error::Config(format!(
                "temperature must be non-negative, got {}",
                self.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(Error::Config(format!(
                "top-p must be within 0..=1, got {}",
                self.top_p
            )));
        }
        Ok(())
    }
}

/// A GGUF model run in-process through llama.cpp.
///
/// The backend may only be initialized once per process, so construct a
/// single generator and keep it for the lifetime of the query loop. Each
/// completion gets a fresh context.
pub struct LlamaGenerator {
    // Dropped before the backend it was loaded with.
    model: LlamaModel,
    backend: LlamaBackend,
    config: GenerationConfig,
}

impl LlamaGenerator {
    /// Load the model at `path`.
    ///
    /// Fails with [`Error::ModelNotFound`] before touching llama.cpp when the
    /// file does not exist.
    pub fn load(path: &Path, config: GenerationConfig) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::ModelNotFound(path.to_path_buf()));
        }
        config.validate()?;

        send_logs_to_tracing(LogOptions::default());
        let backend = LlamaBackend::init().map_err(|e| {
            Error::Generation(format!("failed to initialize llama.cpp: {e:?}"))
        })?;

        tracing::info!(model = %path.display(), "loading language model");
        let model = LlamaModel::load_from_file(
            &backend,
            path,
            &LlamaModelParams::default(),
        )
        .map_err(|e| {
            Error::Generation(format!(
                "failed to load {}: {e:?}",
                path.display()
            ))
        })?;

        Ok(Self {
            model,
            backend,
            config,
        })
    }

    fn sampler(&self) -> LlamaSampler {
        if self.config.temperature == 0.0 {
            return LlamaSampler::greedy();
        }
        LlamaSampler::chain_simple([
            LlamaSampler::top_k(self.config.top_k),
            LlamaSampler::top_p(self.config.top_p, 1),
            LlamaSampler::temp(self.config.temperature),
            LlamaSampler::dist(self.config.seed),
        ])
    }
}

impl Generator for LlamaGenerator {
    fn complete(&mut self, prompt: &str) -> Result<String> {
        let prompt = sanitize_prompt(prompt);
        let tokens = self
            .model
            .str_to_token(&prompt, AddBos::Always)
            .map_err(|e| Error::Generation(format!("tokenization failed: {e:?}")))?;

        let context_size = self.config.context_size as usize;
        if tokens.is_empty() {
            return Err(Error::Generation("prompt is empty".to_string()));
        }
        if tokens.len() >= context_size {
            return Err(Error::Generation(format!(
                "prompt is {} tokens but the context window holds {context_size}",
                tokens.len()
            )));
        }
        let budget = self.config.max_tokens.min(context_size - tokens.len());

        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(self.config.context_size))
            .with_n_batch(self.config.context_size);
        let mut ctx = self
            .model
            .new_context(&self.backend, ctx_params)
            .map_err(|e| {
                Error::Generation(format!("failed to create context: {e:?}"))
            })?;

        let mut batch = LlamaBatch::new(tokens.len(), 1);
        let last = tokens.len() - 1;
        for (i, &token) in tokens.iter().enumerate() {
            batch.add(token, i as i32, &[0], i == last).map_err(|e| {
                Error::Generation(format!("failed to queue prompt: {e:?}"))
            })?;
        }
        ctx.decode(&mut batch)
            .map_err(|e| Error::Generation(format!("decode failed: {e:?}")))?;

        let mut sampler = self.sampler();
        let eos = self.model.token_eos();
        let mut position = tokens.len();
        // Pieces may split multi-byte characters, so collect raw bytes.
        let mut output = Vec::new();

        for _ in 0..budget {
            let token = sampler.sample(&ctx, -1);
            if token == eos {
                break;
            }

            let piece = self
                .model
                .token_to_bytes(token, Special::Plaintext)
                .map_err(|e| {
                    Error::Generation(format!("failed to detokenize: {e:?}"))
                })?;
            output.extend_from_slice(&piece);

            batch.clear();
            batch.add(token, position as i32, &[0], true).map_err(|e| {
                Error::Generation(format!("failed to queue token: {e:?}"))
            })?;
            ctx.decode(&mut batch)
                .map_err(|e| Error::Generation(format!("decode failed: {e:?}")))?;
            position += 1;
        }

        tracing::debug!(
            prompt_tokens = tokens.len(),
            generated_tokens = position - tokens.len(),
            "completion finished"
        );

        Ok(String::from_utf8_lossy(&output).trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(GenerationConfig::default().validate().is_ok());
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let bad = [
            GenerationConfig {
                context_size: 0,
                ..GenerationConfig::default()
            },
            GenerationConfig {
                max_tokens: 0,
                ..GenerationConfig::default()
            },
            GenerationConfig {
                temperature: -0.5,
                ..GenerationConfig::default()
            },
            GenerationConfig {
                temperature: f32::NAN,
                ..GenerationConfig::default()
            },
            GenerationConfig {
                top_p: 1.5,
                ..GenerationConfig::default()
            },
        ];
        for config in bad {
            assert!(config.validate().is_err(), "{config:?} should be invalid");
        }
    }

    #[test]
    fn missing_model_file_fails_fast() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("absent.gguf");

        let err = LlamaGenerator::load(&path, GenerationConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::ModelNotFound(p) if p == path));
    }
}
