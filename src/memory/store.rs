//! Relational write path: memory rows, segments, mean vectors, the maintenance log.
//!
//! Everything here is synchronous and takes a `&Connection` (or `&mut` where a
//! transaction is opened). The engine runs these through
//! [`crate::db::Database::call`] after the sector vectors are written, so a
//! failed commit leaves nothing behind in the `memories` or `waypoints` tables.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use crate::config::{IngestionConfig, SectorsConfig};
use crate::embedding::{bytes_to_embedding, embedding_to_bytes};
use crate::error::{MemoryError, Result};
use crate::memory::dynamics::clamp_unit;
use crate::memory::simhash;
use crate::memory::types::{Memory, Sector};
use crate::memory::waypoints::{self, SeedLink};

/// Dimension of the pooled copy of the mean vector kept under the smart tier.
pub const COMPRESSED_DIM: usize = 128;

const MEAN_EPSILON: f64 = 1e-8;

/// Shortens content that exceeds the configured length before it is stored.
pub trait Summarizer: Send + Sync {
    fn shorten(&self, content: &str, sector: Sector, max_len: usize) -> String;
}

// ── Vectors ──────────────────────────────────────────────────────────────────

/// Softmax-weighted average of a memory's sector vectors.
///
/// Each sector contributes `e^(beta * weight) / Σ e^(beta * weight)`. The
/// result is divided by its L2 norm plus a small epsilon.
pub fn mean_vector(vectors: &[(Sector, Vec<f32>)], sectors: &SectorsConfig, beta: f64) -> Vec<f32> {
    let Some((_, first)) = vectors.first() else {
        return Vec::new();
    };
    let dim = first.len();
    let exp_sum: f64 = vectors
        .iter()
        .map(|(s, _)| (beta * sectors.get(*s).weight).exp())
        .sum();

    let mut sum = vec![0.0f64; dim];
    for (sector, v) in vectors {
        let w = (beta * sectors.get(*sector).weight).exp() / exp_sum;
        for (acc, x) in sum.iter_mut().zip(v) {
            *acc += *x as f64 * w;
        }
    }
    let norm = sum.iter().map(|x| x * x).sum::<f64>().sqrt() + MEAN_EPSILON;
    sum.into_iter().map(|x| (x / norm) as f32).collect()
}

/// Bucket-average `v` down to `target` dimensions and L2-normalize.
/// Vectors already at or below `target` come back unchanged.
pub fn compress_vector(v: &[f32], target: usize) -> Vec<f32> {
    if v.len() <= target || target == 0 {
        return v.to_vec();
    }
    let bucket = v.len() as f64 / target as f64;
    let mut out: Vec<f32> = (0..target)
        .map(|i| {
            let start = (i as f64 * bucket).floor() as usize;
            let end = (((i + 1) as f64 * bucket).floor() as usize).min(v.len());
            if end > start {
                v[start..end].iter().sum::<f32>() / (end - start) as f32
            } else {
                0.0
            }
        })
        .collect();
    crate::embedding::normalize(&mut out);
    out
}

// ── Rows ─────────────────────────────────────────────────────────────────────

const MEMORY_COLUMNS: &str = "id, owner_id, segment, content, simhash, primary_sector, tags, metadata, \
     created_at, updated_at, last_seen_at, salience, decay_lambda, version, mean_dim, mean_vec, \
     compressed_vec, feedback_score";

fn row_to_memory(row: &Row<'_>) -> rusqlite::Result<Memory> {
    let simhash_hex: String = row.get(4)?;
    let sector_str: String = row.get(5)?;
    let tags_json: String = row.get(6)?;
    let metadata_json: String = row.get(7)?;
    let mean: Option<Vec<u8>> = row.get(15)?;
    let compressed: Option<Vec<u8>> = row.get(16)?;

    let primary_sector = sector_str.parse::<Sector>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, e.into())
    })?;

    Ok(Memory {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        segment: row.get(2)?,
        content: row.get(3)?,
        simhash: simhash::from_hex(&simhash_hex).unwrap_or(0),
        primary_sector,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        metadata: serde_json::from_str(&metadata_json).unwrap_or(Value::Object(Default::default())),
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        last_seen_at: row.get(10)?,
        salience: clamp_unit(row.get(11)?),
        decay_lambda: row.get(12)?,
        version: row.get(13)?,
        mean_dim: row.get::<_, i64>(14)? as usize,
        mean_vector: mean.map(|b| bytes_to_embedding(&b)).unwrap_or_default(),
        compressed_vector: compressed.map(|b| bytes_to_embedding(&b)),
        feedback_score: row.get(17)?,
    })
}

pub fn get_memory(conn: &Connection, id: &str) -> Result<Option<Memory>> {
    let sql = format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], row_to_memory).optional()?)
}

/// Like [`get_memory`] but a missing id is [`MemoryError::NotFound`].
pub fn require_memory(conn: &Connection, id: &str) -> Result<Memory> {
    get_memory(conn, id)?.ok_or_else(|| MemoryError::NotFound(id.to_string()))
}

/// An existing memory of `owner_id` with exactly this fingerprint.
pub fn find_by_simhash(conn: &Connection, signature: u64, owner_id: &str) -> Result<Option<Memory>> {
    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM memories WHERE simhash = ?1 AND owner_id = ?2 \
         ORDER BY created_at, id LIMIT 1"
    );
    Ok(conn
        .query_row(&sql, params![simhash::to_hex(signature), owner_id], row_to_memory)
        .optional()?)
}

/// The most recently created memories, newest first.
pub fn list_recent(conn: &Connection, limit: usize) -> Result<Vec<Memory>> {
    let sql = format!("SELECT {MEMORY_COLUMNS} FROM memories ORDER BY created_at DESC, id LIMIT ?1");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([limit as i64], row_to_memory)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn count_memories(conn: &Connection) -> Result<usize> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0))?;
    Ok(n as usize)
}

pub fn max_segment(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COALESCE(MAX(segment), 0) FROM memories", [], |r| r.get(0))?)
}

/// Segment a new memory belongs in: the current one, or the next when the
/// current one already holds `segment_size` rows.
pub fn resolve_segment(conn: &Connection, segment_size: i64) -> Result<i64> {
    let current = max_segment(conn)?;
    let occupancy: i64 = conn.query_row(
        "SELECT COUNT(*) FROM memories WHERE segment = ?1",
        [current],
        |r| r.get(0),
    )?;
    if segment_size > 0 && occupancy >= segment_size {
        tracing::info!(from = current, to = current + 1, "rotating memory segment");
        Ok(current + 1)
    } else {
        Ok(current)
    }
}

fn insert_row(conn: &Connection, m: &Memory) -> Result<()> {
    let compressed = m.compressed_vector.as_deref().map(embedding_to_bytes);
    conn.execute(
        "INSERT INTO memories (id, owner_id, segment, content, simhash, primary_sector, tags, metadata, \
         created_at, updated_at, last_seen_at, salience, decay_lambda, version, mean_dim, mean_vec, \
         compressed_vec, feedback_score) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            m.id,
            m.owner_id,
            m.segment,
            m.content,
            simhash::to_hex(m.simhash),
            m.primary_sector.as_str(),
            serde_json::to_string(&m.tags)?,
            serde_json::to_string(&m.metadata)?,
            m.created_at,
            m.updated_at,
            m.last_seen_at,
            clamp_unit(m.salience),
            m.decay_lambda,
            m.version,
            m.mean_vector.len() as i64,
            embedding_to_bytes(&m.mean_vector),
            compressed,
            m.feedback_score,
        ],
    )?;
    Ok(())
}

/// Write a new memory in one transaction: resolve the segment, shorten the
/// content if a summarizer is configured, insert the row, seed its waypoint.
///
/// Returns the memory as stored and the seed link. On error nothing is committed.
pub fn commit_new_memory(
    conn: &mut Connection,
    mut memory: Memory,
    summarizer: Option<&dyn Summarizer>,
    cfg: &IngestionConfig,
) -> Result<(Memory, SeedLink)> {
    let tx = conn.transaction()?;

    memory.segment = resolve_segment(&tx, cfg.segment_size)?;
    if let Some(summarizer) = summarizer {
        if memory.content.chars().count() > cfg.summary_max_length {
            memory.content = summarizer.shorten(&memory.content, memory.primary_sector, cfg.summary_max_length);
        }
    }
    memory.mean_dim = memory.mean_vector.len();
    insert_row(&tx, &memory)?;

    let seed = waypoints::seed_waypoint(
        &tx,
        &memory.id,
        &memory.mean_vector,
        &memory.owner_id,
        cfg.seed_scan_limit,
        memory.created_at,
    )?;

    tx.commit()?;
    Ok((memory, seed))
}

/// Persist an edited memory. When `reseed` is set (content changed) a new
/// nearest-neighbor waypoint is seeded in the same transaction.
pub fn commit_update(conn: &mut Connection, memory: &Memory, reseed: bool, cfg: &IngestionConfig) -> Result<()> {
    let tx = conn.transaction()?;
    let compressed = memory.compressed_vector.as_deref().map(embedding_to_bytes);
    let changed = tx.execute(
        "UPDATE memories SET content = ?1, simhash = ?2, primary_sector = ?3, tags = ?4, metadata = ?5, \
         updated_at = ?6, decay_lambda = ?7, version = ?8, mean_dim = ?9, mean_vec = ?10, compressed_vec = ?11 \
         WHERE id = ?12",
        params![
            memory.content,
            simhash::to_hex(memory.simhash),
            memory.primary_sector.as_str(),
            serde_json::to_string(&memory.tags)?,
            serde_json::to_string(&memory.metadata)?,
            memory.updated_at,
            memory.decay_lambda,
            memory.version,
            memory.mean_vector.len() as i64,
            embedding_to_bytes(&memory.mean_vector),
            compressed,
            memory.id,
        ],
    )?;
    if changed == 0 {
        return Err(MemoryError::NotFound(memory.id.clone()));
    }
    if reseed {
        waypoints::seed_waypoint(
            &tx,
            &memory.id,
            &memory.mean_vector,
            &memory.owner_id,
            cfg.seed_scan_limit,
            memory.updated_at,
        )?;
    }
    tx.commit()?;
    Ok(())
}

// ── Field updates ────────────────────────────────────────────────────────────

pub fn set_salience(conn: &Connection, id: &str, salience: f64, now: i64) -> Result<()> {
    conn.execute(
        "UPDATE memories SET salience = ?1, updated_at = ?2 WHERE id = ?3",
        params![clamp_unit(salience), now, id],
    )?;
    Ok(())
}

/// Record a recall: new salience and last-seen time.
pub fn mark_seen(conn: &Connection, id: &str, salience: f64, now: i64) -> Result<()> {
    conn.execute(
        "UPDATE memories SET salience = ?1, last_seen_at = ?2, updated_at = ?2 WHERE id = ?3",
        params![clamp_unit(salience), now, id],
    )?;
    Ok(())
}

pub fn set_feedback(conn: &Connection, id: &str, feedback: f64) -> Result<()> {
    conn.execute(
        "UPDATE memories SET feedback_score = ?1 WHERE id = ?2",
        params![feedback, id],
    )?;
    Ok(())
}

/// Delete the row and every waypoint touching it. Returns `false` if absent.
pub fn delete_memory(conn: &mut Connection, id: &str) -> Result<bool> {
    let tx = conn.transaction()?;
    let removed = tx.execute("DELETE FROM memories WHERE id = ?1", [id])?;
    waypoints::delete_for_memory(&tx, id)?;
    tx.commit()?;
    Ok(removed > 0)
}

// ── Maintenance log ──────────────────────────────────────────────────────────

/// Operations recorded in `maintenance_log`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceOp {
    Decay,
    Prune,
    Reflect,
    Consolidate,
}

impl MaintenanceOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decay => "decay",
            Self::Prune => "prune",
            Self::Reflect => "reflect",
            Self::Consolidate => "consolidate",
        }
    }
}

pub fn log_maintenance_op(
    conn: &Connection,
    op: MaintenanceOp,
    count: usize,
    details: Option<&Value>,
    now: i64,
) -> Result<()> {
    let details = details.map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO maintenance_log (operation, count, details, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![op.as_str(), count as i64, details, now],
    )?;
    Ok(())
}
