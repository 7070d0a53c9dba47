//! Vector store — flat inner-product index over node embeddings.
//!
//! Embeddings are L2-normalized on insert and stored row-major in one
//! `Vec<f32>` for cache-friendly scans. The index is exact (recall 1.0),
//! which trivially clears the recall bar for the project sizes this
//! serves; `distance = 1 − dot`, smaller is closer. Rows back-map to the
//! snapshot's node arena by index, and node names map to rows for lookup
//! by symbol.

use crate::error::{Error, Result};
use crate::types::NodeArena;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// ANN index over a snapshot's embedded nodes.
#[derive(Default)]
pub struct VectorStore {
    dim: usize,
    /// `rows.len() == arena_ids.len() * dim`, normalized vectors.
    rows: Vec<f32>,
    /// Row id (monotonic insert order) → arena index.
    arena_ids: Vec<u32>,
    /// Node name → row id.
    by_name: HashMap<String, u32>,
}

impl VectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.arena_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena_ids.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Insert every listed node that carries a full-dimension embedding.
    /// Nodes with empty embeddings (pending a later sync) are skipped.
    /// The first inserted vector fixes the index dimensionality.
    pub fn add(&mut self, arena: &NodeArena, indices: impl IntoIterator<Item = u32>) {
        for idx in indices {
            let node = arena.get(idx);
            if node.embedding.is_empty() {
                continue;
            }
            if self.dim == 0 {
                self.dim = node.embedding.len();
            }
            if node.embedding.len() != self.dim {
                continue;
            }
            let row_id = self.arena_ids.len() as u32;
            self.rows.extend(normalized(&node.embedding));
            self.arena_ids.push(idx);
            self.by_name.insert(node.name.clone(), row_id);
        }
    }

    /// `k` nearest nodes to `query` as `(arena index, distance)`, distance
    /// ascending. Ties break toward the earlier row for determinism.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(u32, f32)> {
        if self.is_empty() || query.len() != self.dim || k == 0 {
            return Vec::new();
        }
        let query = normalized(query);
        let mut scored: Vec<(u32, f32)> = (0..self.arena_ids.len())
            .map(|row| {
                let offset = row * self.dim;
                let dot: f32 =
                    query.iter().zip(&self.rows[offset..offset + self.dim]).map(|(a, b)| a * b).sum();
                (row as u32, 1.0 - dot)
            })
            .collect();
        scored.sort_by(|a, b| {
            a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0))
        });
        scored.truncate(k);
        scored.into_iter().map(|(row, dist)| (self.arena_ids[row as usize], dist)).collect()
    }

    /// Arena index of the node with this name, if embedded.
    pub fn lookup_name(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).map(|&row| self.arena_ids[row as usize])
    }

    // -----------------------------------------------------------------------
    // Persistence — atomic directory swap
    // -----------------------------------------------------------------------

    /// Persist into `dir`, replacing any previous snapshot in one rename.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let parent = dir.parent().ok_or_else(|| {
            Error::Config(format!("vector dir has no parent: {}", dir.display()))
        })?;
        std::fs::create_dir_all(parent)?;

        let staging = parent.join(format!(
            ".{}.tmp-{}",
            dir.file_name().and_then(|n| n.to_str()).unwrap_or("vectors"),
            uuid::Uuid::new_v4()
        ));
        std::fs::create_dir_all(&staging)?;

        let meta = IndexMeta {
            dim: self.dim,
            arena_ids: self.arena_ids.clone(),
            names: self.by_name.iter().map(|(n, r)| (n.clone(), *r)).collect(),
        };
        std::fs::write(staging.join("index.json"), serde_json::to_vec(&meta)?)?;

        let mut bytes = Vec::with_capacity(self.rows.len() * 4);
        for v in &self.rows {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        std::fs::write(staging.join("embeddings.bin"), bytes)?;

        if dir.exists() {
            let trash = parent.join(format!(".vectors.old-{}", uuid::Uuid::new_v4()));
            std::fs::rename(dir, &trash)?;
            std::fs::rename(&staging, dir)?;
            let _ = std::fs::remove_dir_all(trash);
        } else {
            std::fs::rename(&staging, dir)?;
        }
        Ok(())
    }

    /// Restore a snapshot written by [`VectorStore::save`]. A missing
    /// directory loads as an empty store.
    pub fn load(dir: &Path) -> Result<Self> {
        if !dir.exists() {
            return Ok(Self::new());
        }
        let meta: IndexMeta =
            serde_json::from_slice(&std::fs::read(dir.join("index.json"))?)
                .map_err(|e| Error::Config(format!("corrupt vector index: {e}")))?;
        let bytes = std::fs::read(dir.join("embeddings.bin"))?;
        let expected = meta.arena_ids.len() * meta.dim * 4;
        if bytes.len() != expected {
            return Err(Error::Config(format!(
                "corrupt vector snapshot: {} bytes, expected {expected}",
                bytes.len()
            )));
        }
        let rows = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self {
            dim: meta.dim,
            rows,
            arena_ids: meta.arena_ids,
            by_name: meta.names.into_iter().collect(),
        })
    }
}

#[derive(Serialize, Deserialize)]
struct IndexMeta {
    dim: usize,
    arena_ids: Vec<u32>,
    names: Vec<(String, u32)>,
}

/// L2-normalized copy; zero vectors pass through unchanged.
fn normalized(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm <= f32::EPSILON {
        return v.to_vec();
    }
    v.iter().map(|x| x / norm).collect()
}
