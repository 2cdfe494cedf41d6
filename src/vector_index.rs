//! Brute-force cosine similarity index with directory persistence.
//!
//! An index directory holds two files:
//!
//! | File | Contents |
//! |------|----------|
//! | `index.json` | format version, embedding model, dims, creation time, chunk records |
//! | `vectors.bin` | `chunks.len() × dims` little-endian `f32`, row-major |
//!
//! Once saved, a directory is never rewritten; rehydration only reads it.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::embedding::{bytes_to_vec, cosine_similarity, vec_to_bytes};
use crate::models::{Chunk, ScoredChunk};

const FORMAT_VERSION: u32 = 1;
const META_FILE: &str = "index.json";
const VECTORS_FILE: &str = "vectors.bin";

#[derive(Debug, Serialize, Deserialize)]
struct IndexMeta {
    version: u32,
    model: String,
    dims: usize,
    created_at: DateTime<Utc>,
    chunks: Vec<Chunk>,
}

#[derive(Debug, Clone)]
pub struct VectorIndex {
    model: String,
    dims: usize,
    chunks: Vec<Chunk>,
    vectors: Vec<Vec<f32>>,
}

impl VectorIndex {
    /// Build an index over `chunks` and their embeddings (same order).
    pub fn build(model: &str, chunks: Vec<Chunk>, vectors: Vec<Vec<f32>>) -> Result<Self> {
        if chunks.len() != vectors.len() {
            bail!(
                "chunk/vector count mismatch: {} chunks, {} vectors",
                chunks.len(),
                vectors.len()
            );
        }
        let dims = vectors.first().map(Vec::len).unwrap_or(0);
        if let Some((i, v)) = vectors.iter().enumerate().find(|(_, v)| v.len() != dims) {
            bail!("vector {} has {} dims, expected {}", i, v.len(), dims);
        }
        Ok(Self {
            model: model.to_string(),
            dims,
            chunks,
            vectors,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Top-`k` chunks by cosine similarity, best first.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<ScoredChunk> {
        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i, cosine_similarity(query, v)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored
            .into_iter()
            .take(k)
            .map(|(i, score)| ScoredChunk {
                chunk: self.chunks[i].clone(),
                score,
            })
            .collect()
    }

    /// Write `index.json` and `vectors.bin` into `dir`, creating it if needed.
    pub async fn save(&self, dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create index directory: {}", dir.display()))?;

        let meta = IndexMeta {
            version: FORMAT_VERSION,
            model: self.model.clone(),
            dims: self.dims,
            created_at: Utc::now(),
            chunks: self.chunks.clone(),
        };
        let meta_json = serde_json::to_vec_pretty(&meta)?;

        let mut blob = Vec::with_capacity(self.vectors.len() * self.dims * 4);
        for v in &self.vectors {
            blob.extend_from_slice(&vec_to_bytes(v));
        }

        // Vectors first: a directory with index.json is considered complete.
        tokio::fs::write(dir.join(VECTORS_FILE), blob)
            .await
            .with_context(|| format!("Failed to write {}", VECTORS_FILE))?;
        tokio::fs::write(dir.join(META_FILE), meta_json)
            .await
            .with_context(|| format!("Failed to write {}", META_FILE))?;
        Ok(())
    }

    /// Whether `dir` holds a saved index.
    pub fn exists(dir: &Path) -> bool {
        dir.join(META_FILE).is_file()
    }

    /// Load an index saved by [`VectorIndex::save`].
    pub async fn load(dir: &Path) -> Result<Self> {
        let meta_bytes = tokio::fs::read(dir.join(META_FILE))
            .await
            .with_context(|| format!("Failed to read index metadata in {}", dir.display()))?;
        let meta: IndexMeta =
            serde_json::from_slice(&meta_bytes).with_context(|| "Failed to parse index metadata")?;
        if meta.version != FORMAT_VERSION {
            bail!("unsupported index format version {}", meta.version);
        }

        let blob = tokio::fs::read(dir.join(VECTORS_FILE))
            .await
            .with_context(|| format!("Failed to read index vectors in {}", dir.display()))?;
        let expected = meta.chunks.len() * meta.dims * 4;
        if blob.len() != expected {
            bail!(
                "corrupt index: vectors.bin is {} bytes, expected {}",
                blob.len(),
                expected
            );
        }

        let vectors = if meta.dims == 0 {
            vec![Vec::new(); meta.chunks.len()]
        } else {
            blob.chunks_exact(meta.dims * 4).map(bytes_to_vec).collect()
        };

        Ok(Self {
            model: meta.model,
            dims: meta.dims,
            chunks: meta.chunks,
            vectors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str, page: usize) -> Chunk {
        Chunk {
            id: format!("id-{}", text),
            page,
            chunk_index: 0,
            text: text.to_string(),
            hash: String::new(),
        }
    }

    fn sample() -> VectorIndex {
        VectorIndex::build(
            "test-model",
            vec![chunk("east", 0), chunk("north", 1), chunk("west", 2)],
            vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![-1.0, 0.0]],
        )
        .unwrap()
    }

    #[test]
    fn search_orders_by_similarity() {
        let hits = sample().search(&[0.9, 0.1], 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.text, "east");
        assert_eq!(hits[1].chunk.text, "north");
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn search_k_larger_than_index() {
        assert_eq!(sample().search(&[1.0, 0.0], 10).len(), 3);
    }

    #[test]
    fn build_rejects_mismatched_counts() {
        let err = VectorIndex::build("m", vec![chunk("a", 0)], vec![]).unwrap_err();
        assert!(err.to_string().contains("mismatch"));
    }

    #[test]
    fn build_rejects_ragged_dims() {
        let err = VectorIndex::build(
            "m",
            vec![chunk("a", 0), chunk("b", 0)],
            vec![vec![1.0, 0.0], vec![1.0]],
        )
        .unwrap_err();
        assert!(err.to_string().contains("dims"));
    }

    #[tokio::test]
    async fn save_then_load_preserves_search() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("session");
        let index = sample();
        index.save(&dir).await.unwrap();
        assert!(VectorIndex::exists(&dir));

        let loaded = VectorIndex::load(&dir).await.unwrap();
        assert_eq!(loaded.model(), "test-model");
        assert_eq!(loaded.dims(), 2);
        assert_eq!(loaded.len(), 3);
        let hits = loaded.search(&[0.0, 1.0], 1);
        assert_eq!(hits[0].chunk.text, "north");
        assert_eq!(hits[0].chunk.page, 1);
    }

    #[tokio::test]
    async fn load_detects_truncated_vectors() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("session");
        sample().save(&dir).await.unwrap();
        tokio::fs::write(dir.join(VECTORS_FILE), [0u8; 5]).await.unwrap();
        let err = VectorIndex::load(&dir).await.unwrap_err();
        assert!(err.to_string().contains("corrupt index"));
    }

    #[tokio::test]
    async fn missing_directory_does_not_exist() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(!VectorIndex::exists(&tmp.path().join("nope")));
        assert!(VectorIndex::load(&tmp.path().join("nope")).await.is_err());
    }
}
