use std::path::{Path, PathBuf};

use crate::{
    chunking::{Chunk, ChunkingConfig, chunk_document},
    embedding::{DEFAULT_BATCH_SIZE, Embedder, embed_in_batches},
    error::{Error, Result},
    loader::load_documents,
    vector_store::{IndexEntry, IndexManifest, VectorIndex},
    walker::discover_files,
};

/// Knobs for a single ingestion run.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub chunking: ChunkingConfig,
    /// Chunks per embedding call.
    pub batch_size: usize,
    /// Draw a progress bar while embedding.
    pub progress: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            progress: false,
        }
    }
}

/// Summary of a completed ingestion run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub documents: usize,
    pub chunks: usize,
    pub dimension: usize,
    pub index_path: PathBuf,
}

/// Build a fresh index in `index_dir` from every supported document under
/// `input_dir`.
///
/// The run is all-or-nothing: any unreadable document aborts it, and the
/// index location is not touched unless at least one document was found
/// and every chunk was embedded.
pub fn ingest_directory(
    input_dir: &Path,
    index_dir: &Path,
    embedder: &mut dyn Embedder,
    options: &IngestOptions,
) -> Result<IngestReport> {
    let files = discover_files(input_dir)?;
    if files.is_empty() {
        return Err(Error::NoDocuments(input_dir.to_path_buf()));
    }
    tracing::info!(
        files = files.len(),
        dir = %input_dir.display(),
        "discovered documents"
    );

    let documents = load_documents(&files)?;

    let chunks: Vec<Chunk> = documents
        .iter()
        .flat_map(|doc| chunk_document(doc, &options.chunking))
        .collect();
    if chunks.is_empty() {
        return Err(Error::Config(format!(
            "documents in {} contain no extractable text",
            input_dir.display()
        )));
    }
    tracing::info!(
        documents = documents.len(),
        chunks = chunks.len(),
        chunk_size = options.chunking.chunk_size,
        overlap = options.chunking.overlap,
        "split documents"
    );

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let vectors = embed_in_batches(
        embedder,
        &texts,
        options.batch_size,
        options.progress,
    )?;

    let dimension = vectors.first().map(Vec::len).unwrap_or(0);
    let manifest =
        IndexManifest::new(embedder.model_id(), dimension, options.chunking);
    let entries: Vec<IndexEntry> = chunks
        .into_iter()
        .zip(vectors)
        .map(|(chunk, vector)| IndexEntry { chunk, vector })
        .collect();

    let index_path = VectorIndex::build(index_dir, manifest, &entries)?;

    Ok(IngestReport {
        documents: documents.len(),
        chunks: entries.len(),
        dimension,
        index_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        embedding::HashEmbedder,
        loader::{PDF_FONT_RESOURCES, one_page_pdf},
    };

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn ingests_text_documents() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        write(input.path(), "leave.txt", "Employees get 25 days of leave.");
        write(input.path(), "remote.txt", "Remote work needs approval.");

        let mut embedder = HashEmbedder::new(64);
        let report = ingest_directory(
            input.path(),
            output.path(),
            &mut embedder,
            &IngestOptions::default(),
        )
        .unwrap();

        assert_eq!(report.documents, 2);
        assert_eq!(report.chunks, 2);
        assert_eq!(report.dimension, 64);
        assert_eq!(report.index_path, VectorIndex::file_path(output.path()));

        let index = VectorIndex::open(output.path()).unwrap();
        assert_eq!(index.manifest().model_id, embedder.model_id());
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn ingests_pdf_documents() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        std::fs::write(
            input.path().join("handbook.pdf"),
            one_page_pdf(
                PDF_FONT_RESOURCES,
                "BT /F1 12 Tf 72 712 Td (Annual leave is 25 days) Tj ET",
            ),
        )
        .unwrap();
        write(input.path(), "remote.txt", "Remote work needs approval.");

        let report = ingest_directory(
            input.path(),
            output.path(),
            &mut HashEmbedder::default(),
            &IngestOptions::default(),
        )
        .unwrap();
        assert_eq!(report.documents, 2);

        let index = VectorIndex::open(output.path()).unwrap();
        let sources = index.sources();
        assert!(sources.iter().any(|(s, n)| s == "handbook.pdf" && *n >= 1));

        let mut embedder = HashEmbedder::default();
        let query = embedder.embed_query("annual leave days").unwrap();
        let hits = index.search(&query, 1).unwrap();
        assert_eq!(hits[0].chunk.source, "handbook.pdf");
        assert!(hits[0].chunk.text.contains("Annual leave is 25 days"));
    }

    #[test]
    fn malformed_pdf_aborts_before_writing() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let index_dir = output.path().join("index");
        write(input.path(), "good.txt", "fine");
        std::fs::write(
            input.path().join("broken.pdf"),
            one_page_pdf("<< >>", "BT /F1 12 Tf (lost) Tj ET"),
        )
        .unwrap();

        let err = ingest_directory(
            input.path(),
            &index_dir,
            &mut HashEmbedder::default(),
            &IngestOptions::default(),
        )
        .unwrap_err();

        assert!(matches!(err, Error::Document { .. }));
        assert!(!index_dir.exists());
    }

    #[test]
    fn empty_directory_writes_nothing() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let index_dir = output.path().join("index");
        write(input.path(), "notes.md", "not supported");

        let err = ingest_directory(
            input.path(),
            &index_dir,
            &mut HashEmbedder::default(),
            &IngestOptions::default(),
        )
        .unwrap_err();

        assert!(matches!(err, Error::NoDocuments(_)));
        assert!(!index_dir.exists());
    }

    #[test]
    fn unreadable_document_aborts_and_keeps_old_index() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        write(input.path(), "good.txt", "first version");

        let mut embedder = HashEmbedder::default();
        let options = IngestOptions::default();
        ingest_directory(input.path(), output.path(), &mut embedder, &options)
            .unwrap();

        std::fs::write(input.path().join("bad.txt"), [0xff, 0xfe]).unwrap();
        let err =
            ingest_directory(input.path(), output.path(), &mut embedder, &options)
                .unwrap_err();
        assert!(matches!(err, Error::Document { .. }));

        let index = VectorIndex::open(output.path()).unwrap();
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn blank_documents_are_rejected() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        write(input.path(), "blank.txt", "   \n\n  ");

        let err = ingest_directory(
            input.path(),
            output.path(),
            &mut HashEmbedder::default(),
            &IngestOptions::default(),
        )
        .unwrap_err();

        assert!(matches!(err, Error::Config(_)));
        assert!(!VectorIndex::exists(output.path()));
    }

    #[test]
    fn reingest_replaces_index() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        write(input.path(), "a.txt", &"word ".repeat(300));

        let mut embedder = HashEmbedder::default();
        let options = IngestOptions {
            chunking: ChunkingConfig::new(100, 10).unwrap(),
            ..IngestOptions::default()
        };

        let first =
            ingest_directory(input.path(), output.path(), &mut embedder, &options)
                .unwrap();
        let second =
            ingest_directory(input.path(), output.path(), &mut embedder, &options)
                .unwrap();

        assert_eq!(first.chunks, second.chunks);
        assert_eq!(
            VectorIndex::open(output.path()).unwrap().len(),
            first.chunks
        );
    }
}
