use crate::document::PageText;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Separators tried in order; the empty separator splits into characters
const SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

/// Represents a text chunk with its citation metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// The actual text content of this chunk
    pub text: String,
    /// File name of the document this chunk was cut from
    pub source: String,
    /// 1-based page number within that document
    pub page: usize,
}

/// Chunk size and overlap, both measured in characters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        ChunkingConfig {
            chunk_size: 1000,
            chunk_overlap: 150,
        }
    }
}

/// Recursive character splitter.
///
/// Text is cut on the coarsest separator it contains (paragraphs, then
/// lines, then words, then characters). Pieces are packed greedily into
/// chunks of at most `chunk_size` characters, and each new chunk starts with
/// up to `chunk_overlap` characters taken from the end of the previous one.
/// Pieces that are too large on their own are split again with the next
/// separator. Output depends only on the input and the configuration.
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Self {
        Chunker { config }
    }

    pub fn config(&self) -> ChunkingConfig {
        self.config
    }

    /// Split every page, keeping each chunk's page and file metadata
    pub fn split_pages(&self, pages: &[PageText]) -> Vec<Chunk> {
        pages
            .iter()
            .flat_map(|page| {
                self.split_text(&page.text)
                    .into_iter()
                    .map(move |text| Chunk {
                        text,
                        source: page.source.clone(),
                        page: page.page,
                    })
            })
            .collect()
    }

    /// Split a single text into trimmed, non-empty chunks
    pub fn split_text(&self, text: &str) -> Vec<String> {
        self.split_recursive(text, &SEPARATORS)
    }

    fn split_recursive(&self, text: &str, separators: &[&str]) -> Vec<String> {
        let mut separator = "";
        let mut finer: &[&str] = &[];
        for (idx, sep) in separators.iter().enumerate() {
            if sep.is_empty() {
                break;
            }
            if text.contains(sep) {
                separator = sep;
                finer = &separators[idx + 1..];
                break;
            }
        }

        let mut chunks = Vec::new();
        let mut pending: Vec<&str> = Vec::new();

        for piece in split_keep_separator(text, separator) {
            if char_len(piece) < self.config.chunk_size {
                pending.push(piece);
                continue;
            }

            if !pending.is_empty() {
                chunks.extend(self.merge_pieces(&pending));
                pending.clear();
            }

            if finer.is_empty() {
                push_trimmed(&mut chunks, piece);
            } else {
                chunks.extend(self.split_recursive(piece, finer));
            }
        }

        if !pending.is_empty() {
            chunks.extend(self.merge_pieces(&pending));
        }

        chunks
    }

    /// Pack small pieces into chunks, carrying the overlap forward
    fn merge_pieces(&self, pieces: &[&str]) -> Vec<String> {
        let ChunkingConfig {
            chunk_size,
            chunk_overlap,
        } = self.config;

        let mut chunks = Vec::new();
        let mut window: VecDeque<&str> = VecDeque::new();
        let mut total = 0;

        for piece in pieces {
            let len = char_len(piece);

            if total + len > chunk_size && !window.is_empty() {
                push_trimmed(&mut chunks, &window.iter().copied().collect::<String>());

                // Drop from the front until only the overlap remains and the
                // next piece fits.
                while total > chunk_overlap || (total + len > chunk_size && total > 0) {
                    match window.pop_front() {
                        Some(front) => total -= char_len(front),
                        None => break,
                    }
                }
            }

            window.push_back(piece);
            total += len;
        }

        push_trimmed(&mut chunks, &window.iter().copied().collect::<String>());
        chunks
    }
}

/// Split on `separator`, attaching each separator to the piece after it.
/// Empty pieces are dropped; an empty separator yields single characters.
fn split_keep_separator<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    if separator.is_empty() {
        return text
            .char_indices()
            .map(|(idx, c)| &text[idx..idx + c.len_utf8()])
            .collect();
    }

    let mut pieces = Vec::new();
    let mut start = 0;
    for (pos, _) in text.match_indices(separator) {
        if pos > start {
            pieces.push(&text[start..pos]);
        }
        start = pos;
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

fn push_trimmed(chunks: &mut Vec<String>, text: &str) {
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}
