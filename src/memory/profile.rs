//! Per-owner profile summaries, refreshed by a background job.

use chrono::{TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::error::Result;

/// Stored summary of one owner's memories.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OwnerProfile {
    pub owner_id: String,
    pub summary: String,
    pub memory_count: u64,
    pub reflection_count: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

fn format_millis(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}

/// Build the summary line for one owner. Returns the text, memory count,
/// and reflection count.
pub fn summarize_owner(conn: &Connection, owner_id: &str) -> Result<(String, u64, u64)> {
    let (count, last_active): (i64, Option<i64>) = conn.query_row(
        "SELECT COUNT(*), MAX(created_at) FROM memories WHERE owner_id = ?1",
        [owner_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    if count == 0 {
        return Ok(("No memories recorded yet.".to_string(), 0, 0));
    }

    let sectors: Vec<(String, i64)> = {
        let mut stmt = conn.prepare(
            "SELECT primary_sector, COUNT(*) FROM memories WHERE owner_id = ?1 \
             GROUP BY primary_sector ORDER BY COUNT(*) DESC, primary_sector",
        )?;
        let rows = stmt
            .query_map([owner_id], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };

    let tags: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT t.value, COUNT(*) AS n FROM memories m, json_each(m.tags) t \
             WHERE m.owner_id = ?1 GROUP BY t.value ORDER BY n DESC, t.value LIMIT 3",
        )?;
        let rows = stmt
            .query_map([owner_id], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };

    let reflections: i64 = conn.query_row(
        "SELECT COUNT(*) FROM memories WHERE owner_id = ?1 \
         AND json_extract(metadata, '$.type') = 'auto_reflect'",
        [owner_id],
        |r| r.get(0),
    )?;

    let sector_str = sectors
        .iter()
        .map(|(s, n)| format!("{s} {n}"))
        .collect::<Vec<_>>()
        .join(", ");
    let tag_str = if tags.is_empty() {
        "none".to_string()
    } else {
        tags.join(", ")
    };
    let last = last_active.map(format_millis).unwrap_or_else(|| "unknown".into());

    let summary = format!(
        "{count} memories ({sector_str}). Top tags: {tag_str}. {reflections} reflections. Last active: {last}."
    );
    Ok((summary, count as u64, reflections as u64))
}

/// Recompute the profile of every owner with at least one memory.
/// Returns the number of profiles written.
pub fn refresh_profiles(conn: &mut Connection, now: i64) -> Result<usize> {
    let owners: Vec<String> = {
        let mut stmt = conn.prepare("SELECT DISTINCT owner_id FROM memories ORDER BY owner_id")?;
        let rows = stmt
            .query_map([], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };

    let tx = conn.transaction()?;
    for owner in &owners {
        let (summary, memories, reflections) = summarize_owner(&tx, owner)?;
        tx.execute(
            "INSERT INTO owners (owner_id, summary, memory_count, reflection_count, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?5) \
             ON CONFLICT(owner_id) DO UPDATE SET summary = excluded.summary, \
             memory_count = excluded.memory_count, reflection_count = excluded.reflection_count, \
             updated_at = excluded.updated_at",
            params![owner, summary, memories as i64, reflections as i64, now],
        )?;
    }
    tx.commit()?;
    tracing::debug!(owners = owners.len(), "owner profiles refreshed");
    Ok(owners.len())
}

pub fn get_profile(conn: &Connection, owner_id: &str) -> Result<Option<OwnerProfile>> {
    Ok(conn
        .query_row(
            "SELECT owner_id, summary, memory_count, reflection_count, created_at, updated_at \
             FROM owners WHERE owner_id = ?1",
            [owner_id],
            |r| {
                Ok(OwnerProfile {
                    owner_id: r.get(0)?,
                    summary: r.get(1)?,
                    memory_count: r.get::<_, i64>(2)? as u64,
                    reflection_count: r.get::<_, i64>(3)? as u64,
                    created_at: r.get(4)?,
                    updated_at: r.get(5)?,
                })
            },
        )
        .optional()?)
}
