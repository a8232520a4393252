use kdam::{BarExt, tqdm};
use sha2::{Digest, Sha256};

use crate::{
    error::{Error, Result},
    model_manager::ModelManager,
};

/// Setting this to `1` or `true` swaps the neural embedder for
/// [`HashEmbedder`], which needs no model download.
pub const FAKE_EMBEDDINGS_ENV_VAR: &str = "LOCALRAG_FAKE_EMBEDDINGS";

/// Number of chunks sent to the embedder at once during ingestion.
pub const DEFAULT_BATCH_SIZE: usize = 32;

/// Turns text into fixed-dimension, L2-normalized vectors.
pub trait Embedder {
    /// Identifier recorded in the index manifest and checked at query time.
    fn model_id(&self) -> &str;

    /// Output dimension. May load the model.
    fn dimension(&mut self) -> Result<usize>;

    /// Embed a batch of texts, one vector per input in input order.
    fn embed(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single query string.
    fn embed_query(&mut self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text.to_string()])?
            .pop()
            .ok_or_else(|| Error::Embedding("embedder returned no vector".into()))
    }
}

/// Returns `true` when [`FAKE_EMBEDDINGS_ENV_VAR`] asks for the hash embedder.
pub fn fake_embeddings_enabled() -> bool {
    std::env::var(FAKE_EMBEDDINGS_ENV_VAR)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Build the embedder for a model id, honouring [`FAKE_EMBEDDINGS_ENV_VAR`].
///
/// Nothing is loaded here; the neural model is fetched on first use.
pub fn embedder_for(model_id: &str) -> Box<dyn Embedder> {
    if fake_embeddings_enabled() {
        tracing::info!("using hash embeddings");
        Box::new(HashEmbedder::default())
    } else {
        Box::new(ModelManager::with_model_id(model_id.to_string()))
    }
}

/// Embed `texts` in batches of `batch_size`, drawing a progress bar on
/// stderr when `progress` is set.
pub fn embed_in_batches(
    embedder: &mut dyn Embedder,
    texts: &[String],
    batch_size: usize,
    progress: bool,
) -> Result<Vec<Vec<f32>>> {
    let batch_size = batch_size.max(1);
    let mut pb = tqdm!(
        total = texts.len(),
        desc = "Embedding",
        unit = " chunks",
        disable = !progress
    );

    let mut vectors = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size) {
        let embedded = embedder.embed(batch)?;
        if embedded.len() != batch.len() {
            return Err(Error::Embedding(format!(
                "expected {} vectors, got {}",
                batch.len(),
                embedded.len()
            )));
        }
        vectors.extend(embedded);
        pb.update(batch.len())?;
    }

    if progress {
        pb.refresh()?;
        eprintln!();
    }

    tracing::debug!(count = vectors.len(), "embedded chunks");
    Ok(vectors)
}

/// Deterministic bag-of-words embedder based on feature hashing.
///
/// Lowercased alphanumeric tokens are hashed into signed buckets and the
/// result is L2-normalized, so texts sharing words score higher under cosine
/// similarity. Useful for tests and offline smoke runs, not for real
/// retrieval quality.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

pub const HASH_MODEL_ID: &str = "localrag/feature-hash-sha256";

const HASH_DIMENSION: usize = 256;

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(HASH_DIMENSION)
    }
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let hash = token_hash(&token.to_lowercase());

            let bucket = (hash % self.dimension as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        normalize(&mut vector);
        vector
    }
}

impl Embedder for HashEmbedder {
    fn model_id(&self) -> &str {
        HASH_MODEL_ID
    }

    fn dimension(&mut self) -> Result<usize> {
        Ok(self.dimension)
    }

    fn embed(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// First eight bytes of the token's SHA-256 digest. The bucket layout must
/// not change between builds, or stored hash vectors stop matching queries.
fn token_hash(token: &str) -> u64 {
    let digest = Sha256::digest(token.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head)
}

/// Scale a vector to unit length in place. Zero vectors are left as is.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}
