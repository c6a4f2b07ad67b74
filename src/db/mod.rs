pub mod schema;

use anyhow::{Context, Result};
use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, Once};
use std::time::Duration;

use crate::error::MemoryError;

static SQLITE_VEC_INIT: Once = Once::new();

/// Register the sqlite-vec extension globally. Safe to call multiple times.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// Open (or create) the store at the given path, with all extensions loaded
/// and schema initialized.
pub fn open_database(path: impl AsRef<Path>, busy_timeout_ms: u64) -> Result<Connection> {
    let path = path.as_ref();

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    load_sqlite_vec();

    let conn = Connection::open(path)
        .with_context(|| format!("failed to open database at {}", path.display()))?;

    // WAL lets background jobs read while a foreground write is in flight
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(Duration::from_millis(busy_timeout_ms))?;

    schema::init_schema(&conn).context("failed to initialize schema")?;

    tracing::info!(path = %path.display(), "database initialized");
    Ok(conn)
}

/// Open an in-memory database, used by tests and throwaway engines.
pub fn open_memory_database() -> Result<Connection> {
    load_sqlite_vec();
    let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    schema::init_schema(&conn).context("failed to initialize schema")?;
    Ok(conn)
}

/// Warn when the store was created with a different embedding dimension,
/// otherwise record the current one.
pub fn check_embedding_dim(conn: &Connection, dim: usize) -> rusqlite::Result<()> {
    match schema::get_embedding_dim(conn)? {
        Some(stored) if stored != dim => {
            tracing::warn!(
                stored,
                configured = dim,
                "embedding dimension changed; vectors written earlier will be refreshed on recall"
            );
        }
        Some(_) => {}
        None => schema::set_embedding_dim(conn, dim)?,
    }
    Ok(())
}

/// Shared handle to the single SQLite connection.
///
/// Synchronous SQL functions take `&Connection` / `&mut Connection`; async
/// callers go through [`Database::call`], which runs them on the blocking pool.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Lock the connection on the current thread.
    pub fn lock(&self) -> crate::error::Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| MemoryError::Internal(format!("db lock poisoned: {e}")))
    }

    /// Run `f` against the connection on the blocking thread pool.
    pub async fn call<F, T>(&self, f: F) -> crate::error::Result<T>
    where
        F: FnOnce(&mut Connection) -> crate::error::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = db
                .lock()
                .map_err(|e| MemoryError::Internal(format!("db lock poisoned: {e}")))?;
            f(&mut conn)
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_database_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("memory.db");
        let conn = open_database(&path, 1000).unwrap();
        assert!(path.exists());

        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |r| r.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn sqlite_vec_is_available() {
        let conn = open_memory_database().unwrap();
        let version: String = conn
            .query_row("SELECT vec_version()", [], |r| r.get(0))
            .unwrap();
        assert!(!version.is_empty());
    }

    #[test]
    fn embedding_dim_recorded_on_first_check() {
        let conn = open_memory_database().unwrap();
        check_embedding_dim(&conn, 128).unwrap();
        assert_eq!(schema::get_embedding_dim(&conn).unwrap(), Some(128));
        // A mismatch only warns
        check_embedding_dim(&conn, 64).unwrap();
        assert_eq!(schema::get_embedding_dim(&conn).unwrap(), Some(128));
    }

    #[tokio::test]
    async fn call_runs_on_blocking_pool() {
        let db = Database::new(open_memory_database().unwrap());
        let n: i64 = db
            .call(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(n, 0);
    }
}
