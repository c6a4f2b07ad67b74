//! Associative waypoint graph: directed, weighted edges between memories.
//!
//! Edges are created at ingest (one nearest-neighbor seed), by explicit linking
//! (same-sector, cross-sector, contextual), and by co-activation of memories
//! recalled together. Recall walks the graph breadth-first from vector hits.
//! Only the prune job removes edges.
//!
//! Weights read from storage are clamped to `[0.0, 1.0]` before use, so a
//! corrupted row can never push a score or a traversal out of range.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use crate::config::WaypointConfig;
use crate::embedding::{bytes_to_embedding, cosine_similarity};
use crate::error::Result;
use crate::memory::dynamics::clamp_unit;
use crate::memory::types::{Sector, SectorVector, Waypoint};

// ── Edge storage ─────────────────────────────────────────────────────────────

/// Insert the edge or overwrite its weight.
pub fn upsert_waypoint(
    conn: &Connection,
    src: &str,
    dst: &str,
    owner_id: &str,
    weight: f64,
    now: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO waypoints (src_id, dst_id, owner_id, weight, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?5) \
         ON CONFLICT(src_id, dst_id, owner_id) DO UPDATE SET weight = excluded.weight, updated_at = excluded.updated_at",
        params![src, dst, owner_id, clamp_unit(weight), now],
    )?;
    Ok(())
}

fn row_to_waypoint(row: &rusqlite::Row<'_>) -> rusqlite::Result<Waypoint> {
    Ok(Waypoint {
        src_id: row.get(0)?,
        dst_id: row.get(1)?,
        owner_id: row.get(2)?,
        weight: clamp_unit(row.get(3)?),
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

/// The `src → dst` edge. When several owners hold the same pair, the
/// lexicographically first owner's edge is returned.
pub fn get_waypoint(conn: &Connection, src: &str, dst: &str) -> Result<Option<Waypoint>> {
    Ok(conn
        .query_row(
            "SELECT src_id, dst_id, owner_id, weight, created_at, updated_at FROM waypoints \
             WHERE src_id = ?1 AND dst_id = ?2 ORDER BY owner_id LIMIT 1",
            params![src, dst],
            row_to_waypoint,
        )
        .optional()?)
}

/// Outgoing edges, strongest first, ties by destination id.
pub fn outgoing(conn: &Connection, src: &str) -> Result<Vec<Waypoint>> {
    let mut stmt = conn.prepare(
        "SELECT src_id, dst_id, owner_id, weight, created_at, updated_at FROM waypoints \
         WHERE src_id = ?1 ORDER BY weight DESC, dst_id",
    )?;
    let rows = stmt
        .query_map([src], row_to_waypoint)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Remove every edge touching `id`, including its synthetic per-sector nodes.
pub fn delete_for_memory(conn: &Connection, id: &str) -> Result<usize> {
    let prefix = format!("{id}:%");
    Ok(conn.execute(
        "DELETE FROM waypoints WHERE src_id = ?1 OR dst_id = ?1 OR src_id LIKE ?2 OR dst_id LIKE ?2",
        params![id, prefix],
    )?)
}

// ── Creation ─────────────────────────────────────────────────────────────────

/// Outcome of [`seed_waypoint`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeedLink {
    pub dst_id: String,
    pub weight: f64,
}

/// Link a new memory to its nearest neighbor by mean vector.
///
/// Scans up to `scan_limit` of the owner's most recent memories. With no
/// candidates the memory gets a self-loop of weight 1.0.
pub fn seed_waypoint(
    conn: &Connection,
    id: &str,
    mean_vector: &[f32],
    owner_id: &str,
    scan_limit: usize,
    now: i64,
) -> Result<SeedLink> {
    let mut stmt = conn.prepare(
        "SELECT id, mean_vec FROM memories \
         WHERE owner_id = ?1 AND id != ?2 AND mean_vec IS NOT NULL \
         ORDER BY created_at DESC, id LIMIT ?3",
    )?;
    let mut best: Option<(String, f64)> = None;
    let rows = stmt.query_map(params![owner_id, id, scan_limit as i64], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
    })?;
    for row in rows {
        let (candidate, bytes) = row?;
        let sim = cosine_similarity(mean_vector, &bytes_to_embedding(&bytes));
        if best.as_ref().map_or(true, |(_, s)| sim > *s) {
            best = Some((candidate, sim));
        }
    }

    let link = match best {
        Some((dst_id, sim)) => SeedLink {
            dst_id,
            weight: clamp_unit(sim),
        },
        None => SeedLink {
            dst_id: id.to_string(),
            weight: 1.0,
        },
    };
    upsert_waypoint(conn, id, &link.dst_id, owner_id, link.weight, now)?;
    Ok(link)
}

/// Bidirectional links of fixed weight to every same-sector vector at or
/// above the similarity threshold. Returns the number of neighbors linked.
pub fn link_same_sector(
    conn: &Connection,
    id: &str,
    owner_id: &str,
    vector: &[f32],
    existing: &[SectorVector],
    cfg: &WaypointConfig,
    now: i64,
) -> Result<usize> {
    let mut linked = 0;
    for other in existing {
        if other.id == id {
            continue;
        }
        if cosine_similarity(vector, &other.vector) >= cfg.same_sector_threshold {
            upsert_waypoint(conn, id, &other.id, owner_id, cfg.link_weight, now)?;
            upsert_waypoint(conn, &other.id, id, owner_id, cfg.link_weight, now)?;
            linked += 1;
        }
    }
    Ok(linked)
}

/// Node id standing for one sector of a memory.
pub fn sector_node(id: &str, sector: Sector) -> String {
    format!("{id}:{sector}")
}

/// Links in both directions between a memory and its per-sector nodes.
pub fn link_cross_sector(
    conn: &Connection,
    id: &str,
    sectors: &[Sector],
    owner_id: &str,
    cfg: &WaypointConfig,
    now: i64,
) -> Result<usize> {
    for &sector in sectors {
        let node = sector_node(id, sector);
        upsert_waypoint(conn, id, &node, owner_id, cfg.link_weight, now)?;
        upsert_waypoint(conn, &node, id, owner_id, cfg.link_weight, now)?;
    }
    Ok(sectors.len())
}

/// Strengthen `id → related` edges by the contextual increment, creating
/// missing ones at `base_weight`. Self-links are skipped.
pub fn link_contextual(
    conn: &Connection,
    id: &str,
    related: &[String],
    owner_id: &str,
    base_weight: f64,
    cfg: &WaypointConfig,
    now: i64,
) -> Result<usize> {
    let mut touched = 0;
    for rel in related {
        if rel == id {
            continue;
        }
        let weight = match get_waypoint(conn, id, rel)? {
            Some(wp) => clamp_unit(wp.weight + cfg.contextual_increment),
            None => base_weight,
        };
        upsert_waypoint(conn, id, rel, owner_id, weight, now)?;
        touched += 1;
    }
    Ok(touched)
}

// ── Traversal ────────────────────────────────────────────────────────────────

/// A node reached by [`expand_via_waypoints`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Expansion {
    pub id: String,
    pub weight: f64,
    /// Seed first, this node last.
    pub path: Vec<String>,
}

/// Breadth-first expansion from `seeds`.
///
/// Seeds come back at weight 1.0. A child's weight is
/// `parent × edge × expansion_decay`; children below `expansion_floor` are
/// dropped. No id is visited twice, and at most `max_expansion` non-seed
/// nodes are added.
pub fn expand_via_waypoints(
    conn: &Connection,
    seeds: &[String],
    max_expansion: usize,
    cfg: &WaypointConfig,
) -> Result<Vec<Expansion>> {
    let mut out: Vec<Expansion> = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<Expansion> = VecDeque::new();

    for seed in seeds {
        if visited.insert(seed.clone()) {
            let e = Expansion {
                id: seed.clone(),
                weight: 1.0,
                path: vec![seed.clone()],
            };
            queue.push_back(e.clone());
            out.push(e);
        }
    }

    let mut added = 0;
    let mut stmt = conn.prepare(
        "SELECT dst_id, weight FROM waypoints WHERE src_id = ?1 ORDER BY weight DESC, dst_id",
    )?;
    'outer: while let Some(current) = queue.pop_front() {
        if added >= max_expansion {
            break;
        }
        let neighbors = stmt
            .query_map([&current.id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (dst, weight) in neighbors {
            if visited.contains(&dst) {
                continue;
            }
            let w = current.weight * clamp_unit(weight) * cfg.expansion_decay;
            if w < cfg.expansion_floor {
                continue;
            }
            let mut path = current.path.clone();
            path.push(dst.clone());
            visited.insert(dst.clone());
            let e = Expansion { id: dst, weight: w, path };
            queue.push_back(e.clone());
            out.push(e);
            added += 1;
            if added >= max_expansion {
                break 'outer;
            }
        }
    }
    Ok(out)
}

// ── Reinforcement, co-activation, pruning ────────────────────────────────────

/// Add the reinforcement increment to every existing edge along `path`.
/// Missing edges are not created. Returns the number of edges touched.
pub fn reinforce_path(conn: &Connection, path: &[String], cfg: &WaypointConfig, now: i64) -> Result<usize> {
    let mut touched = 0;
    for pair in path.windows(2) {
        if let Some(wp) = get_waypoint(conn, &pair[0], &pair[1])? {
            conn.execute(
                "UPDATE waypoints SET weight = ?1, updated_at = ?2 \
                 WHERE src_id = ?3 AND dst_id = ?4 AND owner_id = ?5",
                params![
                    clamp_unit(wp.weight + cfg.reinforce_increment),
                    now,
                    wp.src_id,
                    wp.dst_id,
                    wp.owner_id
                ],
            )?;
            touched += 1;
        }
    }
    Ok(touched)
}

/// Strengthen `a → b` for two memories recalled together.
///
/// The nudge `eta × (1 − w) × e^(−Δt/τ)` shrinks as their last-seen times
/// drift apart. Creates the edge when absent. Returns the new weight, or
/// `None` if either memory is gone.
pub fn coactivate(conn: &Connection, a: &str, b: &str, cfg: &WaypointConfig, now: i64) -> Result<Option<f64>> {
    let seen = |id: &str| -> Result<Option<(i64, String)>> {
        Ok(conn
            .query_row(
                "SELECT last_seen_at, owner_id FROM memories WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?)
    };
    let (Some((seen_a, owner_a)), Some((seen_b, _))) = (seen(a)?, seen(b)?) else {
        return Ok(None);
    };

    let tau_ms = cfg.coactivation_tau_hours * 3_600_000.0;
    let gap = (seen_a - seen_b).abs() as f64;
    let factor = if tau_ms > 0.0 { (-gap / tau_ms).exp() } else { 0.0 };

    let existing = get_waypoint(conn, a, b)?;
    let current = existing.as_ref().map_or(0.0, |wp| wp.weight);
    let owner = existing.as_ref().map_or(owner_a, |wp| wp.owner_id.clone());
    let weight = clamp_unit(current + cfg.coactivation_eta * (1.0 - current) * factor);
    upsert_waypoint(conn, a, b, &owner, weight, now)?;
    Ok(Some(weight))
}

/// Pairs of memories recalled together, waiting for the next flush.
///
/// Holds at most `capacity` pairs; pushing past it drops the oldest.
#[derive(Debug)]
pub struct CoactivationBuffer {
    pairs: Mutex<VecDeque<(String, String)>>,
    capacity: usize,
}

impl Default for CoactivationBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_COACTIVATION_CAPACITY)
    }
}

const DEFAULT_COACTIVATION_CAPACITY: usize = 4096;

impl CoactivationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pairs: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push_all(&self, pairs: impl IntoIterator<Item = (String, String)>) {
        let mut buf = self.pairs.lock().unwrap_or_else(|e| e.into_inner());
        buf.extend(pairs);
        let overflow = buf.len().saturating_sub(self.capacity);
        if overflow > 0 {
            buf.drain(..overflow);
            tracing::debug!(dropped = overflow, capacity = self.capacity, "co-activation buffer full");
        }
    }

    /// Remove and return up to `max` pairs, oldest first.
    pub fn drain(&self, max: usize) -> Vec<(String, String)> {
        let mut buf = self.pairs.lock().unwrap_or_else(|e| e.into_inner());
        let n = max.min(buf.len());
        buf.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.pairs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Delete every edge below the prune threshold. Returns the number removed.
pub fn prune_waypoints(conn: &Connection, threshold: f64) -> Result<usize> {
    Ok(conn.execute("DELETE FROM waypoints WHERE weight < ?1", [threshold])?)
}
