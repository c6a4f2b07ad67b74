//! SQL DDL for the relational side of the store.
//!
//! Defines the `memories`, `waypoints`, `maintenance_log`, `owners`, and
//! `schema_meta` tables. Vector tables belong to the vector-store backends and
//! are created by them. All DDL uses `IF NOT EXISTS` for idempotent
//! initialization.

use rusqlite::{Connection, OptionalExtension};

/// The schema version that the current binary writes.
pub const SCHEMA_VERSION: u32 = 1;

const SCHEMA_SQL: &str = r#"
-- Core memory storage. Timestamps are epoch milliseconds.
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    segment INTEGER NOT NULL DEFAULT 0,
    content TEXT NOT NULL,
    simhash TEXT NOT NULL,
    primary_sector TEXT NOT NULL
        CHECK(primary_sector IN ('episodic','semantic','procedural','emotional','reflective')),
    tags TEXT NOT NULL DEFAULT '[]',
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    last_seen_at INTEGER NOT NULL,
    salience REAL NOT NULL CHECK(salience >= 0.0 AND salience <= 1.0),
    decay_lambda REAL NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    mean_dim INTEGER NOT NULL DEFAULT 0,
    mean_vec BLOB,
    compressed_vec BLOB,
    feedback_score REAL NOT NULL DEFAULT 0.0
);

CREATE INDEX IF NOT EXISTS idx_memories_owner ON memories(owner_id);
CREATE INDEX IF NOT EXISTS idx_memories_segment ON memories(segment);
CREATE INDEX IF NOT EXISTS idx_memories_simhash ON memories(simhash);
CREATE INDEX IF NOT EXISTS idx_memories_sector ON memories(primary_sector);
CREATE INDEX IF NOT EXISTS idx_memories_last_seen ON memories(last_seen_at);
CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at);

-- Associative graph. Weights are not constrained here; readers clamp.
CREATE TABLE IF NOT EXISTS waypoints (
    src_id TEXT NOT NULL,
    dst_id TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    weight REAL NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (src_id, dst_id, owner_id)
);

CREATE INDEX IF NOT EXISTS idx_waypoints_dst ON waypoints(dst_id);
CREATE INDEX IF NOT EXISTS idx_waypoints_weight ON waypoints(weight);

-- Counters for background work
CREATE TABLE IF NOT EXISTS maintenance_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL
        CHECK(operation IN ('decay','prune','reflect','consolidate')),
    count INTEGER NOT NULL,
    details TEXT,
    created_at INTEGER NOT NULL
);

-- Per-owner profile summaries
CREATE TABLE IF NOT EXISTS owners (
    owner_id TEXT PRIMARY KEY,
    summary TEXT NOT NULL,
    memory_count INTEGER NOT NULL DEFAULT 0,
    reflection_count INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

/// Get the stored schema version.
pub fn get_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT value FROM schema_meta WHERE key = 'schema_version'",
        [],
        |row| {
            let val: String = row.get(0)?;
            Ok(val.parse::<u32>().unwrap_or(0))
        },
    )
}

/// Get the embedding dimension the store was first written with, if any.
pub fn get_embedding_dim(conn: &Connection) -> rusqlite::Result<Option<usize>> {
    let val: Option<String> = conn
        .query_row(
            "SELECT value FROM schema_meta WHERE key = 'embedding_dim'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(val.and_then(|v| v.parse().ok()))
}

/// Record the embedding dimension on first use. An existing value is kept.
pub fn set_embedding_dim(conn: &Connection, dim: usize) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('embedding_dim', ?1)",
        [dim.to_string()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_all_tables() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        for expected in ["memories", "waypoints", "maintenance_log", "owners", "schema_meta"] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap(); // second call should not error
    }

    #[test]
    fn embedding_dim_is_write_once() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        assert_eq!(get_embedding_dim(&conn).unwrap(), None);

        set_embedding_dim(&conn, 256).unwrap();
        set_embedding_dim(&conn, 384).unwrap();
        assert_eq!(get_embedding_dim(&conn).unwrap(), Some(256));
    }

    #[test]
    fn salience_outside_unit_interval_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        let err = conn.execute(
            "INSERT INTO memories (id, owner_id, content, simhash, primary_sector, created_at, updated_at, last_seen_at, salience, decay_lambda) \
             VALUES ('a', 'o', 'c', '0', 'semantic', 0, 0, 0, 1.5, 0.005)",
            [],
        );
        assert!(err.is_err());
    }
}
