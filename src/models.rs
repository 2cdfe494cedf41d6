//! Core data models used throughout the service.
//!
//! These types represent the pages, chunks, conversation turns, and source
//! references that flow through the indexing and chat pipeline.

use serde::{Deserialize, Serialize};

/// One page of extracted document text. `number` is 0-based.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub number: usize,
    pub text: String,
}

/// A chunk of a page's text, the unit of retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub page: usize,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
}

/// A chunk returned by similarity search, with its cosine score.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// One completed question/answer exchange held in conversation memory.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub question: String,
    pub answer: String,
}

/// Source reference surfaced to API callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub page: String,
    pub text: String,
}

impl SourceRef {
    /// Build a reference from a retrieved chunk, truncating its text to
    /// `max_chars` characters followed by `...` when it is longer.
    pub fn from_chunk(chunk: &Chunk, max_chars: usize) -> Self {
        Self {
            page: chunk.page.to_string(),
            text: preview(&chunk.text, max_chars),
        }
    }
}

/// Truncate on character (not byte) boundaries.
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}...", &text[..byte_idx]),
        None => text.to_string(),
    }
}
