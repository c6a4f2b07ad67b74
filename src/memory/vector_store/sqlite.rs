//! Brute-force vector store over a plain SQLite table.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use super::{rank_hits, VectorHit, VectorStore};
use crate::db::Database;
use crate::embedding::{bytes_to_embedding, cosine_similarity, embedding_to_bytes};
use crate::error::Result;
use crate::memory::types::{Sector, SectorVector};

const VECTORS_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS vectors (
    id TEXT NOT NULL,
    sector TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    v BLOB NOT NULL,
    dim INTEGER NOT NULL,
    PRIMARY KEY (id, sector)
);
CREATE INDEX IF NOT EXISTS idx_vectors_sector ON vectors(sector);
CREATE INDEX IF NOT EXISTS idx_vectors_owner ON vectors(owner_id);
"#;

pub struct SqliteVectorStore {
    db: Database,
}

impl SqliteVectorStore {
    /// Create the `vectors` table if needed.
    pub fn new(db: Database) -> Result<Self> {
        db.lock()?.execute_batch(VECTORS_SQL)?;
        Ok(Self { db })
    }
}

fn parse_sector(s: String) -> rusqlite::Result<Sector> {
    s.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
    })
}

fn read_vectors(
    conn: &Connection,
    sql: &str,
    param: &str,
) -> rusqlite::Result<Vec<SectorVector>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([param], |row| {
            let bytes: Vec<u8> = row.get(3)?;
            Ok(SectorVector {
                id: row.get(0)?,
                sector: parse_sector(row.get(1)?)?,
                owner_id: row.get(2)?,
                vector: bytes_to_embedding(&bytes),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn upsert(&self, id: &str, sector: Sector, vector: &[f32], owner_id: &str) -> Result<()> {
        let (id, owner_id, bytes) = (id.to_string(), owner_id.to_string(), embedding_to_bytes(vector).to_vec());
        let dim = vector.len() as i64;
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO vectors (id, sector, owner_id, v, dim) VALUES (?1, ?2, ?3, ?4, ?5) \
                     ON CONFLICT(id, sector) DO UPDATE SET owner_id = excluded.owner_id, v = excluded.v, dim = excluded.dim",
                    params![id, sector.as_str(), owner_id, bytes, dim],
                )?;
                Ok(())
            })
            .await
    }

    async fn delete(&self, id: &str, sector: Sector) -> Result<()> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM vectors WHERE id = ?1 AND sector = ?2",
                    params![id, sector.as_str()],
                )?;
                Ok(())
            })
            .await
    }

    async fn delete_all(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                conn.execute("DELETE FROM vectors WHERE id = ?1", [id])?;
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
        let query = query.to_vec();
        let owner_id = owner_id.map(str::to_string);
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, v FROM vectors WHERE sector = ?1 AND (?2 IS NULL OR owner_id = ?2)",
                )?;
                let mut hits = stmt
                    .query_map(params![sector.as_str(), owner_id], |row| {
                        let bytes: Vec<u8> = row.get(1)?;
                        Ok(VectorHit {
                            id: row.get(0)?,
                            score: cosine_similarity(&query, &bytes_to_embedding(&bytes)),
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
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
                        "SELECT owner_id, v FROM vectors WHERE id = ?1 AND sector = ?2",
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
        let id = id.to_string();
        let mut vectors = self
            .db
            .call(move |conn| {
                Ok(read_vectors(
                    conn,
                    "SELECT id, sector, owner_id, v FROM vectors WHERE id = ?1",
                    &id,
                )?)
            })
            .await?;
        vectors.sort_by_key(|v| v.sector);
        Ok(vectors)
    }

    async fn get_by_sector(&self, sector: Sector) -> Result<Vec<SectorVector>> {
        self.db
            .call(move |conn| {
                Ok(read_vectors(
                    conn,
                    "SELECT id, sector, owner_id, v FROM vectors WHERE sector = ?1 ORDER BY id",
                    sector.as_str(),
                )?)
            })
            .await
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}
