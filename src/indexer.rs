//! Document indexing pipeline.
//!
//! Coordinates one upload's flow: read file → extract pages → split into
//! chunks → embed in batches → build a [`VectorIndex`] → save it under the
//! session's index directory.
//!
//! Failures are returned as a typed [`IndexError`]. Nothing written before
//! the failure is cleaned up.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::chunk::TextSplitter;
use crate::config::{Config, StorageConfig};
use crate::embedding::Embedder;
use crate::extract::{extract_pages, DocumentKind, ExtractError};
use crate::vector_index::VectorIndex;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("failed to read upload: {0}")]
    Read(#[source] std::io::Error),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("document contains no extractable text")]
    EmptyDocument,
    #[error("embedding failed: {0:#}")]
    Embedding(anyhow::Error),
    #[error("failed to persist index: {0:#}")]
    Storage(anyhow::Error),
    #[error("indexing task aborted: {0}")]
    Aborted(String),
}

impl IndexError {
    /// Stable machine-readable code for API responses and logs.
    pub fn code(&self) -> &'static str {
        match self {
            IndexError::Read(_) => "read_failed",
            IndexError::Extract(_) => "extract_failed",
            IndexError::EmptyDocument => "empty_document",
            IndexError::Embedding(_) => "embedding_failed",
            IndexError::Storage(_) => "storage_failed",
            IndexError::Aborted(_) => "aborted",
        }
    }
}

pub struct Indexer {
    splitter: TextSplitter,
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
    storage: StorageConfig,
}

impl Indexer {
    pub fn new(config: &Config, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            splitter: TextSplitter::new(config.chunking.chunk_size, config.chunking.chunk_overlap),
            embedder,
            batch_size: config.embedding.batch_size.max(1),
            storage: config.storage.clone(),
        }
    }

    /// Index the file at `path` for `session_id` and persist the result.
    pub async fn index_file(&self, session_id: &str, path: &Path) -> Result<VectorIndex, IndexError> {
        let bytes = tokio::fs::read(path).await.map_err(IndexError::Read)?;
        let kind = DocumentKind::from_path(path);

        // pdf-extract is CPU-bound and synchronous.
        let pages = tokio::task::spawn_blocking(move || extract_pages(&bytes, kind))
            .await
            .map_err(|e| {
                if e.is_panic() {
                    IndexError::Extract(ExtractError::Pdf("parser panicked".to_string()))
                } else {
                    IndexError::Aborted(e.to_string())
                }
            })??;

        let chunks = self.splitter.split_pages(&pages);
        if chunks.is_empty() {
            return Err(IndexError::EmptyDocument);
        }
        tracing::debug!(
            session_id,
            pages = pages.len(),
            chunks = chunks.len(),
            "document split"
        );

        let mut vectors = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let embedded = self
                .embedder
                .embed(&texts)
                .await
                .map_err(IndexError::Embedding)?;
            if embedded.len() != texts.len() {
                return Err(IndexError::Embedding(anyhow::anyhow!(
                    "provider returned {} vectors for {} chunks",
                    embedded.len(),
                    texts.len()
                )));
            }
            vectors.extend(embedded);
        }

        let index = VectorIndex::build(self.embedder.model_name(), chunks, vectors)
            .map_err(IndexError::Embedding)?;
        index
            .save(&self.storage.index_dir(session_id))
            .await
            .map_err(IndexError::Storage)?;

        Ok(index)
    }
}
