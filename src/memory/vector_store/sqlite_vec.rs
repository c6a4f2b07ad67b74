//! Vector store backed by sqlite-vec `vec0` virtual tables.
//!
//! One `vec_<sector>` table per sector holds the embeddings; `vector_meta`
//! records owner and dimension for each `(id, sector)`. Vectors are
//! L2-normalized on write, so the KNN distance `d` maps back to cosine
//! similarity as `1 - d²/2`.

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};

use super::{rank_hits, VectorHit, VectorStore};
use crate::db::Database;
use crate::embedding::{bytes_to_embedding, embedding_to_bytes, normalize};
use crate::error::{MemoryError, Result};
use crate::memory::types::{Sector, SectorVector};

const META_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS vector_meta (
    id TEXT NOT NULL,
    sector TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    dim INTEGER NOT NULL,
    PRIMARY KEY (id, sector)
);
CREATE INDEX IF NOT EXISTS idx_vector_meta_owner ON vector_meta(owner_id);
"#;

fn table(sector: Sector) -> String {
    format!("vec_{}", sector.as_str())
}

pub struct SqliteVecStore {
    db: Database,
    dim: usize,
}

impl SqliteVecStore {
    /// Create the per-sector vec0 tables for `dim`-dimensional vectors.
    pub fn new(db: Database, dim: usize) -> Result<Self> {
        crate::db::load_sqlite_vec();
        {
            let conn = db.lock()?;
            conn.execute_batch(META_SQL)?;
            for sector in Sector::ALL {
                conn.execute_batch(&format!(
                    "CREATE VIRTUAL TABLE IF NOT EXISTS {} USING vec0(id TEXT PRIMARY KEY, embedding FLOAT[{dim}]);",
                    table(sector)
                ))?;
            }
        }
        Ok(Self { db, dim })
    }

    fn check_dim(&self, len: usize) -> Result<()> {
        if len != self.dim {
            return Err(MemoryError::VectorStore(format!(
                "vector has {len} dimensions, index expects {}",
                self.dim
            )));
        }
        Ok(())
    }
}

fn distance_to_cosine(d: f64) -> f64 {
    1.0 - (d * d) / 2.0
}

#[async_trait]
impl VectorStore for SqliteVecStore {
    async fn upsert(&self, id: &str, sector: Sector, vector: &[f32], owner_id: &str) -> Result<()> {
        self.check_dim(vector.len())?;
        let mut v = vector.to_vec();
        normalize(&mut v);
        let (id, owner_id, dim) = (id.to_string(), owner_id.to_string(), self.dim as i64);
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                // vec0 has no upsert
                tx.execute(&format!("DELETE FROM {} WHERE id = ?1", table(sector)), [&id])?;
                tx.execute(
                    &format!("INSERT INTO {} (id, embedding) VALUES (?1, ?2)", table(sector)),
                    params![id, embedding_to_bytes(&v)],
                )?;
                tx.execute(
                    "INSERT OR REPLACE INTO vector_meta (id, sector, owner_id, dim) VALUES (?1, ?2, ?3, ?4)",
                    params![id, sector.as_str(), owner_id, dim],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    async fn delete(&self, id: &str, sector: Sector) -> Result<()> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(&format!("DELETE FROM {} WHERE id = ?1", table(sector)), [&id])?;
                tx.execute(
                    "DELETE FROM vector_meta WHERE id = ?1 AND sector = ?2",
                    params![id, sector.as_str()],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    async fn delete_all(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                for sector in Sector::ALL {
                    tx.execute(&format!("DELETE FROM {} WHERE id = ?1", table(sector)), [&id])?;
                }
                tx.execute("DELETE FROM vector_meta WHERE id = ?1", [&id])?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    async fn search(
        &self,
        sector: Sector,
        query: &[f32],
        k: usize,
        owner_id: Option<&str>,
    ) -> Result<Vec<VectorHit>> {
        self.check_dim(query.len())?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let mut q = query.to_vec();
        normalize(&mut q);
        let owner_id = owner_id.map(str::to_string);
        self.db
            .call(move |conn| {
                // The KNN scan cannot filter on owner, so an owner-scoped search
                // walks the whole sector and filters afterwards.
                let total: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM vector_meta WHERE sector = ?1",
                    [sector.as_str()],
                    |r| r.get(0),
                )?;
                if total == 0 {
                    return Ok(Vec::new());
                }
                let mut stmt = conn.prepare(&format!(
                    "WITH knn AS (SELECT id, distance FROM {} \
                     WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2) \
                     SELECT knn.id, knn.distance, m.owner_id FROM knn \
                     JOIN vector_meta m ON m.id = knn.id AND m.sector = ?3 \
                     ORDER BY knn.distance",
                    table(sector)
                ))?;
                let bytes = embedding_to_bytes(&q).to_vec();
                let mut limit = match owner_id {
                    Some(_) => total,
                    None => (k as i64 + 1).min(total),
                };
                // Widen the window until the row past the k-th is strictly
                // farther, so equal distances at the cutoff are ranked by id.
                let rows = loop {
                    let rows = stmt
                        .query_map(params![bytes, limit, sector.as_str()], |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, f64>(1)?,
                                row.get::<_, String>(2)?,
                            ))
                        })?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    let settled = owner_id.is_some()
                        || limit >= total
                        || rows.len() <= k
                        || rows[rows.len() - 1].1 > rows[k - 1].1;
                    if settled {
                        break rows;
                    }
                    limit = (limit * 2).min(total);
                };
                let mut hits = rows
                    .into_iter()
                    .filter(|(_, _, owner)| owner_id.as_deref().map_or(true, |o| o == owner))
                    .map(|(id, d, _)| VectorHit {
                        id,
                        score: distance_to_cosine(d),
                    })
                    .collect::<Vec<_>>();
                rank_hits(&mut hits, k);
                Ok(hits)
            })
            .await
    }

    async fn get(&self, id: &str, sector: Sector) -> Result<Option<SectorVector>> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                let row = conn
                    .query_row(
                        &format!(
                            "SELECT m.owner_id, v.embedding FROM vector_meta m \
                             JOIN {} v ON v.id = m.id WHERE m.id = ?1 AND m.sector = ?2",
                            table(sector)
                        ),
                        params![id, sector.as_str()],
                        |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)),
                    )
                    .optional()?;
                Ok(row.map(|(owner_id, bytes)| SectorVector {
                    id,
                    sector,
                    owner_id,
                    vector: bytes_to_embedding(&bytes),
                }))
            })
            .await
    }

    async fn get_all(&self, id: &str) -> Result<Vec<SectorVector>> {
        let mut out = Vec::new();
        for sector in Sector::ALL {
            if let Some(v) = self.get(id, sector).await? {
                out.push(v);
            }
        }
        Ok(out)
    }

    async fn get_by_sector(&self, sector: Sector) -> Result<Vec<SectorVector>> {
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT m.id, m.owner_id, v.embedding FROM vector_meta m \
                     JOIN {} v ON v.id = m.id WHERE m.sector = ?1 ORDER BY m.id",
                    table(sector)
                ))?;
                let rows = stmt
                    .query_map([sector.as_str()], |row| {
                        let bytes: Vec<u8> = row.get(2)?;
                        Ok(SectorVector {
                            id: row.get(0)?,
                            sector,
                            owner_id: row.get(1)?,
                            vector: bytes_to_embedding(&bytes),
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
    }

    fn name(&self) -> &'static str {
        "sqlite-vec"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;

    fn store() -> SqliteVecStore {
        SqliteVecStore::new(Database::new(open_memory_database().unwrap()), 3).unwrap()
    }

    #[tokio::test]
    async fn knn_returns_cosine_scores() {
        let s = store();
        s.upsert("a", Sector::Semantic, &[1.0, 0.0, 0.0], "o").await.unwrap();
        s.upsert("b", Sector::Semantic, &[0.0, 1.0, 0.0], "o").await.unwrap();
        s.upsert("c", Sector::Semantic, &[2.0, 0.0, 0.0], "o").await.unwrap();

        let hits = s.search(Sector::Semantic, &[1.0, 0.0, 0.0], 3, None).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        // a and c are both parallel to the query; the tie breaks on id
        assert_eq!(ids, vec!["a", "c", "b"]);
        assert!((hits[0].score - 1.0).abs() < 1e-4);
        assert!(hits[2].score.abs() < 1e-4);
    }

    #[tokio::test]
    async fn ties_at_the_cutoff_rank_by_id() {
        let s = store();
        for id in ["d", "c", "b", "a"] {
            s.upsert(id, Sector::Semantic, &[0.0, 1.0, 0.0], "o").await.unwrap();
        }
        s.upsert("z", Sector::Semantic, &[1.0, 0.0, 0.0], "o").await.unwrap();

        let hits = s.search(Sector::Semantic, &[1.0, 0.1, 0.0], 2, None).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["z", "a"]);
    }

    #[tokio::test]
    async fn owner_scoped_search_filters() {
        let s = store();
        s.upsert("a", Sector::Episodic, &[1.0, 0.0, 0.0], "alice").await.unwrap();
        s.upsert("b", Sector::Episodic, &[0.9, 0.1, 0.0], "bob").await.unwrap();
        let hits = s
            .search(Sector::Episodic, &[1.0, 0.0, 0.0], 5, Some("bob"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "b");
    }

    #[tokio::test]
    async fn upsert_replaces_and_delete_all_clears() {
        let s = store();
        s.upsert("a", Sector::Semantic, &[1.0, 0.0, 0.0], "o").await.unwrap();
        s.upsert("a", Sector::Semantic, &[0.0, 0.0, 1.0], "o").await.unwrap();
        s.upsert("a", Sector::Reflective, &[0.0, 1.0, 0.0], "o").await.unwrap();
        let got = s.get("a", Sector::Semantic).await.unwrap().unwrap();
        assert_eq!(got.vector, vec![0.0, 0.0, 1.0]);
        assert_eq!(s.get_by_sector(Sector::Semantic).await.unwrap().len(), 1);

        s.delete_all("a").await.unwrap();
        assert!(s.get_all("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn wrong_dimension_is_rejected() {
        let s = store();
        let err = s.upsert("a", Sector::Semantic, &[1.0, 0.0], "o").await;
        assert!(matches!(err, Err(MemoryError::VectorStore(_))));
    }
}
