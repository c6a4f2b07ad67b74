//! Text-to-vector embedding.
//!
//! Provides the async [`Embedder`] trait the engine calls once per sector, and
//! a deterministic feature-hashing implementation ([`synthetic::SyntheticEmbedder`])
//! that needs no model files. Production providers plug in behind the same trait.

pub mod synthetic;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{EmbeddingConfig, SectorsConfig};
use crate::error::Result;
use crate::memory::types::Sector;

/// Trait for embedding text into per-sector vectors.
///
/// Implementations must return vectors of exactly [`Embedder::dimensions`]
/// entries. They need not be normalized; the engine normalizes where it matters.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed `text` as seen from one sector.
    async fn embed(&self, text: &str, sector: Sector) -> Result<Vec<f32>>;

    /// Embed `text` once per sector. Implementations may override for batched calls.
    async fn embed_all(&self, text: &str, sectors: &[Sector]) -> Result<HashMap<Sector, Vec<f32>>> {
        let mut out = HashMap::with_capacity(sectors.len());
        for &sector in sectors {
            out.insert(sector, self.embed(text, sector).await?);
        }
        Ok(out)
    }

    /// Number of dimensions this provider produces.
    fn dimensions(&self) -> usize;
}

/// Create an embedding provider from config.
///
/// Only `"synthetic"` ships with the crate.
pub fn create_provider(
    config: &EmbeddingConfig,
    sectors: &SectorsConfig,
) -> anyhow::Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "synthetic" => Ok(Arc::new(synthetic::SyntheticEmbedder::new(
            config.dimensions,
            sectors,
        ))),
        other => anyhow::bail!("unknown embedding provider: {other}. Supported: synthetic"),
    }
}

/// Cosine similarity between two vectors. Mismatched lengths or zero vectors yield 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// Scale `v` to unit length in place. Zero vectors are left alone.
pub fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

/// Convert an f32 embedding slice to raw bytes for BLOB columns and sqlite-vec.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            embedding.len() * std::mem::size_of::<f32>(),
        )
    }
}

/// Inverse of [`embedding_to_bytes`]. Trailing bytes that do not form a full f32 are ignored.
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
