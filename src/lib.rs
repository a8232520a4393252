//! localrag - chat with a folder of documents through a local language model.
//!
//! Ingestion walks a directory of `.txt` and `.pdf` files, splits their text
//! into overlapping chunks, embeds each chunk with a sentence-transformer run
//! on [candle](https://github.com/huggingface/candle) and writes the vectors
//! to a [redb](https://github.com/cberner/redb) index. The chat loop embeds
//! each question, retrieves the closest chunks and asks a GGUF model, run
//! in-process through llama.cpp, to answer from them.
//!
//! # Quick start
//!
//! ```no_run
//! use localrag::{DataDir, ModelManager, VectorIndex};
//! use localrag::embedding::Embedder;
//! use localrag::ingest::{ingest_directory, IngestOptions};
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let mut model = ModelManager::new();
//!
//! let report = ingest_directory(
//!     std::path::Path::new("data"),
//!     &data_dir.index_dir(),
//!     &mut model,
//!     &IngestOptions::default(),
//! )
//! .unwrap();
//! println!("indexed {} chunks", report.chunks);
//!
//! let index = VectorIndex::open(&data_dir.index_dir()).unwrap();
//! let query = model.embed_query("How many days of leave do I get?").unwrap();
//! for hit in index.search(&query, 2).unwrap() {
//!     println!("{} (score: {:.3})", hit.chunk.source, hit.score);
//! }
//! ```

pub mod chat;
pub mod chunking;
pub mod data_dir;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod ingest;
pub mod loader;
pub mod memory;
pub mod model_manager;
pub mod text_util;
pub mod vector_store;
pub mod walker;

pub use data_dir::DataDir;
pub use error::{Error, Result};
pub use model_manager::ModelManager;
pub use vector_store::VectorIndex;
