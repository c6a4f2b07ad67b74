use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::Result;

/// Response from [`store_stats`].
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub total_memories: u64,
    pub by_sector: BTreeMap<String, u64>,
    pub owners: u64,
    pub segments: u64,
    pub waypoints: u64,
    pub avg_salience: f64,
    pub vector_backend: String,
    pub db_size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_memory: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_memory: Option<i64>,
    /// Most recent run of each maintenance operation, epoch millis.
    pub last_maintenance: BTreeMap<String, i64>,
}

/// Compute store statistics.
///
/// `db_path` is used for file size calculation; pass None for in-memory databases.
pub fn store_stats(conn: &Connection, vector_backend: &str, db_path: Option<&Path>) -> Result<StatsResponse> {
    let (total, owners, segments, avg_salience, oldest, newest): (i64, i64, i64, Option<f64>, Option<i64>, Option<i64>) =
        conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT owner_id), COUNT(DISTINCT segment), AVG(salience), \
             MIN(created_at), MAX(created_at) FROM memories",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?)),
        )?;
    let waypoints: i64 = conn.query_row("SELECT COUNT(*) FROM waypoints", [], |r| r.get(0))?;

    let db_size_bytes = db_path
        .and_then(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .unwrap_or(0);

    Ok(StatsResponse {
        total_memories: total as u64,
        by_sector: count_by_sector(conn)?,
        owners: owners as u64,
        segments: segments as u64,
        waypoints: waypoints as u64,
        avg_salience: avg_salience.unwrap_or(0.0),
        vector_backend: vector_backend.to_string(),
        db_size_bytes,
        oldest_memory: oldest,
        newest_memory: newest,
        last_maintenance: last_maintenance(conn)?,
    })
}

fn count_by_sector(conn: &Connection) -> Result<BTreeMap<String, u64>> {
    let mut stmt = conn.prepare("SELECT primary_sector, COUNT(*) FROM memories GROUP BY primary_sector")?;
    let rows = stmt.query_map([], |row| {
        let sector: String = row.get(0)?;
        let count: i64 = row.get(1)?;
        Ok((sector, count as u64))
    })?;
    let mut map = BTreeMap::new();
    for row in rows {
        let (k, v) = row?;
        map.insert(k, v);
    }
    Ok(map)
}

fn last_maintenance(conn: &Connection) -> Result<BTreeMap<String, i64>> {
    let mut stmt = conn.prepare("SELECT operation, MAX(created_at) FROM maintenance_log GROUP BY operation")?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
        .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
    Ok(rows)
}
