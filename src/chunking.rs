//! Recursive character splitting of documents into bounded chunks.
//!
//! Text is split on the coarsest separator that occurs in it (paragraphs,
//! then lines, then words, then single characters). Small pieces are merged
//! back together up to the chunk size, and each new chunk repeats a tail of
//! the previous one of at most `overlap` characters.
//!
//! All lengths are counted in Unicode scalar values, never bytes.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    loader::Document,
};

/// Default maximum chunk size in characters.
///
/// Kept small so that two retrieved chunks, one conversation turn and a
/// truncated question fit a 2048-token model context.
pub const DEFAULT_CHUNK_SIZE: usize = 400;

/// Default overlap between adjacent chunks in characters.
pub const DEFAULT_CHUNK_OVERLAP: usize = 50;

/// Separators tried in order; the empty separator splits into characters.
const SEPARATORS: &[&str] = &["\n\n", "\n", " ", ""];

/// Chunk size and overlap policy.
///
/// # Examples
///
/// ```
/// use localrag::chunking::ChunkingConfig;
///
/// assert!(ChunkingConfig::new(400, 50).is_ok());
/// assert!(ChunkingConfig::new(100, 100).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Maximum chunk size in characters.
    pub chunk_size: usize,
    /// Maximum overlap between adjacent chunks in characters.
    pub overlap: usize,
}

impl ChunkingConfig {
    /// Validate and build a chunking policy.
    ///
    /// Requires `chunk_size >= 1` and `overlap < chunk_size`.
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::Config(
                "chunk size must be at least 1".to_string(),
            ));
        }
        if overlap >= chunk_size {
            return Err(Error::Config(format!(
                "chunk overlap ({overlap}) must be smaller than chunk size ({chunk_size})"
            )));
        }
        Ok(Self {
            chunk_size,
            overlap,
        })
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

/// A chunk of text from a source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Source identifier inherited from the parent document.
    pub source: String,
    /// Zero-based chunk index within the document.
    pub index: usize,
    pub text: String,
}

/// Split a document into chunks carrying its source identifier.
pub fn chunk_document(document: &Document, config: &ChunkingConfig) -> Vec<Chunk> {
    split_text(&document.text, config)
        .into_iter()
        .enumerate()
        .map(|(index, text)| Chunk {
            source: document.source.clone(),
            index,
            text,
        })
        .collect()
}

/// Split text into trimmed, non-empty chunks of at most
/// `config.chunk_size` characters.
///
/// # Examples
///
/// ```
/// use localrag::chunking::{split_text, ChunkingConfig};
///
/// let config = ChunkingConfig::new(20, 0).unwrap();
/// let chunks = split_text("First paragraph.\n\nSecond paragraph.", &config);
/// assert_eq!(chunks, vec!["First paragraph.", "Second paragraph."]);
/// ```
pub fn split_text(text: &str, config: &ChunkingConfig) -> Vec<String> {
    let mut chunks = Vec::new();
    split_recursive(text, SEPARATORS, config, &mut chunks);
    chunks
}

fn split_recursive(
    text: &str,
    separators: &[&str],
    config: &ChunkingConfig,
    out: &mut Vec<String>,
) {
    let Some((position, separator)) = separators
        .iter()
        .enumerate()
        .find(|(_, sep)| sep.is_empty() || text.contains(**sep))
        .map(|(i, sep)| (i, *sep))
    else {
        push_trimmed(text, out);
        return;
    };
    let finer = &separators[position + 1..];

    let pieces: Vec<&str> = if separator.is_empty() {
        text.char_indices()
            .map(|(i, c)| &text[i..i + c.len_utf8()])
            .collect()
    } else {
        text.split(separator).filter(|p| !p.is_empty()).collect()
    };

    let mut mergeable: Vec<&str> = Vec::new();
    for piece in pieces {
        if char_len(piece) < config.chunk_size {
            mergeable.push(piece);
            continue;
        }

        if !mergeable.is_empty() {
            merge_pieces(&mergeable, separator, config, out);
            mergeable.clear();
        }

        if finer.is_empty() {
            // Only reachable with single characters and a chunk size of 1.
            push_trimmed(piece, out);
        } else {
            split_recursive(piece, finer, config, out);
        }
    }

    if !mergeable.is_empty() {
        merge_pieces(&mergeable, separator, config, out);
    }
}

/// Greedily join pieces (each shorter than the chunk size) into chunks.
fn merge_pieces(
    pieces: &[&str],
    separator: &str,
    config: &ChunkingConfig,
    out: &mut Vec<String>,
) {
    let sep_len = char_len(separator);
    let mut window: VecDeque<(&str, usize)> = VecDeque::new();
    // Length of the window joined by `separator`.
    let mut total = 0usize;

    for &piece in pieces {
        let len = char_len(piece);
        let joiner = |window: &VecDeque<(&str, usize)>| {
            if window.is_empty() { 0 } else { sep_len }
        };

        if total + len + joiner(&window) > config.chunk_size
            && !window.is_empty()
        {
            push_trimmed(&join(&window, separator), out);

            while total > config.overlap
                || (total > 0
                    && total + len + joiner(&window) > config.chunk_size)
            {
                let Some((_, front_len)) = window.pop_front() else {
                    break;
                };
                total -= front_len + joiner(&window);
            }
        }

        total += len + joiner(&window);
        window.push_back((piece, len));
    }

    if !window.is_empty() {
        push_trimmed(&join(&window, separator), out);
    }
}

fn join(window: &VecDeque<(&str, usize)>, separator: &str) -> String {
    window
        .iter()
        .map(|(piece, _)| *piece)
        .collect::<Vec<_>>()
        .join(separator)
}

fn push_trimmed(text: &str, out: &mut Vec<String>) {
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}
