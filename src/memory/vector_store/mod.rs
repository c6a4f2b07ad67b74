//! Pluggable per-sector vector storage.
//!
//! The engine only talks to [`VectorStore`]. Two backends ship with the crate:
//!
//! - [`sqlite::SqliteVectorStore`]: vectors as BLOBs in a plain table, cosine
//!   computed in Rust over every row of the sector. Exact, no extension needed.
//! - [`sqlite_vec::SqliteVecStore`]: one sqlite-vec `vec0` table per sector with
//!   KNN `MATCH` queries.
//!
//! Every backend orders search results by score descending, then id ascending,
//! so equal scores come back in a reproducible order.

pub mod sqlite;
pub mod sqlite_vec;

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

use crate::config::StorageConfig;
use crate::db::Database;
use crate::error::Result;
use crate::memory::types::{Sector, SectorVector};

/// One search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorHit {
    pub id: String,
    /// Cosine similarity, higher is closer.
    pub score: f64,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace the vector for `(id, sector)`.
    async fn upsert(&self, id: &str, sector: Sector, vector: &[f32], owner_id: &str) -> Result<()>;

    /// Remove one sector's vector. Missing rows are not an error.
    async fn delete(&self, id: &str, sector: Sector) -> Result<()>;

    /// Remove every sector's vector for `id`.
    async fn delete_all(&self, id: &str) -> Result<()>;

    /// Top `k` vectors in `sector` by cosine similarity to `query`,
    /// optionally restricted to one owner.
    async fn search(
        &self,
        sector: Sector,
        query: &[f32],
        k: usize,
        owner_id: Option<&str>,
    ) -> Result<Vec<VectorHit>>;

    async fn get(&self, id: &str, sector: Sector) -> Result<Option<SectorVector>>;

    /// All sector vectors of one memory, in sector declaration order.
    async fn get_all(&self, id: &str) -> Result<Vec<SectorVector>>;

    /// Every vector stored for `sector`, ordered by id.
    async fn get_by_sector(&self, sector: Sector) -> Result<Vec<SectorVector>>;

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

/// Sort by score descending then id ascending, and keep the first `k`.
pub fn rank_hits(hits: &mut Vec<VectorHit>, k: usize) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    hits.truncate(k);
}

/// Build the backend named by `storage.vector_backend`.
pub fn create_vector_store(
    config: &StorageConfig,
    db: Database,
    dim: usize,
) -> anyhow::Result<Arc<dyn VectorStore>> {
    match config.vector_backend.as_str() {
        "sqlite" => Ok(Arc::new(sqlite::SqliteVectorStore::new(db)?)),
        "sqlite-vec" => Ok(Arc::new(sqlite_vec::SqliteVecStore::new(db, dim)?)),
        other => anyhow::bail!("unknown vector backend: {other}. Supported: sqlite, sqlite-vec"),
    }
}
