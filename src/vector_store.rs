use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::SystemTime,
};

use rayon::prelude::*;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::{
    chunking::{Chunk, ChunkingConfig},
    error::{Error, Result},
};

/// File name of the index database inside the index directory.
pub const INDEX_FILE_NAME: &str = "index.redb";

const CHUNKS: TableDefinition<u64, &[u8]> = TableDefinition::new("chunks");
const VECTORS: TableDefinition<u64, &[u8]> = TableDefinition::new("vectors");
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

const MANIFEST_KEY: &str = "manifest";

/// Describes how an index was built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexManifest {
    /// Embedding model that produced the vectors.
    pub model_id: String,
    pub dimension: usize,
    pub chunk_count: usize,
    pub chunking: ChunkingConfig,
    /// Build time in seconds since the Unix epoch.
    pub built_at: u64,
}

impl IndexManifest {
    pub fn new(
        model_id: impl Into<String>,
        dimension: usize,
        chunking: ChunkingConfig,
    ) -> Self {
        let built_at = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Self {
            model_id: model_id.into(),
            dimension,
            chunk_count: 0,
            chunking,
            built_at,
        }
    }
}

/// A chunk and its embedding, as written to the index.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// A retrieved chunk with its cosine similarity to the query.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// An in-memory, read-only view of a persisted index.
///
/// Search is exact: every stored vector is scored against the query.
pub struct VectorIndex {
    path: PathBuf,
    manifest: IndexManifest,
    chunks: Vec<Chunk>,
    /// Row-major `chunks.len() * manifest.dimension` values.
    vectors: Vec<f32>,
}

impl VectorIndex {
    /// Path of the index database inside `dir`.
    pub fn file_path(dir: &Path) -> PathBuf {
        dir.join(INDEX_FILE_NAME)
    }

    /// Returns `true` if an index has been built in `dir`.
    pub fn exists(dir: &Path) -> bool {
        Self::file_path(dir).is_file()
    }

    /// Write a new index into `dir`, replacing any previous one.
    ///
    /// The database is written to a temporary file next to the final one
    /// and renamed into place, so an interrupted build never leaves a
    /// half-written index behind. `manifest.chunk_count` is set from
    /// `entries`.
    ///
    /// # Examples
    ///
    /// ```
    /// # let tmp = tempfile::tempdir().unwrap();
    /// use localrag::chunking::{Chunk, ChunkingConfig};
    /// use localrag::vector_store::{IndexEntry, IndexManifest, VectorIndex};
    ///
    /// let manifest = IndexManifest::new("demo", 2, ChunkingConfig::default());
    /// let entries = vec![IndexEntry {
    ///     chunk: Chunk { source: "a.txt".into(), index: 0, text: "hi".into() },
    ///     vector: vec![1.0, 0.0],
    /// }];
    /// VectorIndex::build(tmp.path(), manifest, &entries).unwrap();
    ///
    /// let index = VectorIndex::open(tmp.path()).unwrap();
    /// assert_eq!(index.len(), 1);
    /// ```
    pub fn build(
        dir: &Path,
        mut manifest: IndexManifest,
        entries: &[IndexEntry],
    ) -> Result<PathBuf> {
        if entries.is_empty() {
            return Err(Error::Config(
                "refusing to build an index with no chunks".to_string(),
            ));
        }
        if manifest.dimension == 0 {
            return Err(Error::Config(
                "embedding dimension must be at least 1".to_string(),
            ));
        }
        for entry in entries {
            if entry.vector.len() != manifest.dimension {
                return Err(Error::DimensionMismatch {
                    expected: manifest.dimension,
                    actual: entry.vector.len(),
                });
            }
        }
        manifest.chunk_count = entries.len();

        std::fs::create_dir_all(dir)?;
        let final_path = Self::file_path(dir);
        let tmp_path =
            dir.join(format!(".{INDEX_FILE_NAME}.tmp-{}", std::process::id()));
        if tmp_path.exists() {
            std::fs::remove_file(&tmp_path)?;
        }

        if let Err(e) = write_database(&tmp_path, &manifest, entries) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e);
        }
        if let Err(e) = std::fs::rename(&tmp_path, &final_path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        tracing::info!(
            path = %final_path.display(),
            chunks = manifest.chunk_count,
            dimension = manifest.dimension,
            "index written"
        );
        Ok(final_path)
    }

    /// Load the index in `dir` into memory.
    ///
    /// Fails with [`Error::IndexNotFound`] when no index has been built.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = Self::file_path(dir);
        if !path.is_file() {
            return Err(Error::IndexNotFound(path));
        }

        let db = Database::open(&path)?;
        let txn = db.begin_read()?;

        let meta = txn.open_table(META)?;
        let manifest: IndexManifest = match meta.get(MANIFEST_KEY)? {
            Some(guard) => serde_json::from_slice(guard.value())?,
            None => {
                return Err(Error::Config(format!(
                    "index at {} has no manifest",
                    path.display()
                )));
            }
        };

        let chunk_table = txn.open_table(CHUNKS)?;
        let mut chunks = Vec::with_capacity(manifest.chunk_count);
        for entry in chunk_table.iter()? {
            let (_, value) = entry?;
            chunks.push(serde_json::from_slice::<Chunk>(value.value())?);
        }

        let vector_table = txn.open_table(VECTORS)?;
        let mut vectors =
            Vec::with_capacity(manifest.chunk_count * manifest.dimension);
        for entry in vector_table.iter()? {
            let (key, value) = entry?;
            let bytes = value.value();
            if bytes.len() != manifest.dimension * 4 {
                return Err(Error::Config(format!(
                    "corrupt vector for chunk {} in {}",
                    key.value(),
                    path.display()
                )));
            }
            vectors.extend(bytemuck::pod_collect_to_vec::<u8, f32>(bytes));
        }

        if chunks.len() != manifest.chunk_count
            || vectors.len() != manifest.chunk_count * manifest.dimension
        {
            return Err(Error::Config(format!(
                "index at {} is inconsistent with its manifest",
                path.display()
            )));
        }

        tracing::debug!(
            path = %path.display(),
            chunks = chunks.len(),
            "index loaded"
        );

        Ok(Self {
            path,
            manifest,
            chunks,
            vectors,
        })
    }

    /// Return the `k` chunks most similar to `query`, best first.
    ///
    /// Ties keep insertion order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredChunk>> {
        let dimension = self.manifest.dimension;
        if query.len() != dimension {
            return Err(Error::DimensionMismatch {
                expected: dimension,
                actual: query.len(),
            });
        }
        if k == 0 || self.chunks.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .par_chunks(dimension)
            .enumerate()
            .map(|(i, row)| (i, cosine_similarity(query, row)))
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(i, score)| ScoredChunk {
                chunk: self.chunks[i].clone(),
                score,
            })
            .collect())
    }

    pub fn manifest(&self) -> &IndexManifest {
        &self.manifest
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Source identifiers with their chunk counts, sorted by source.
    pub fn sources(&self) -> Vec<(String, usize)> {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for chunk in &self.chunks {
            *counts.entry(chunk.source.as_str()).or_default() += 1;
        }
        counts
            .into_iter()
            .map(|(source, count)| (source.to_string(), count))
            .collect()
    }
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("path", &self.path)
            .field("manifest", &self.manifest)
            .finish_non_exhaustive()
    }
}

fn write_database(
    path: &Path,
    manifest: &IndexManifest,
    entries: &[IndexEntry],
) -> Result<()> {
    let db = Database::create(path)?;

    let txn = db.begin_write()?;
    {
        let mut meta = txn.open_table(META)?;
        let manifest_json = serde_json::to_vec(manifest)?;
        meta.insert(MANIFEST_KEY, manifest_json.as_slice())?;

        let mut chunks = txn.open_table(CHUNKS)?;
        let mut vectors = txn.open_table(VECTORS)?;
        for (id, entry) in entries.iter().enumerate() {
            let id = id as u64;
            let chunk_json = serde_json::to_vec(&entry.chunk)?;
            chunks.insert(id, chunk_json.as_slice())?;
            vectors.insert(id, bytemuck::cast_slice::<f32, u8>(&entry.vector))?;
        }
    }
    txn.commit()?;
    Ok(())
}

/// Cosine similarity; zero when either vector has no magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
