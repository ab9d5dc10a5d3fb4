//! Embedded relational store: WAL-disciplined SQLite with a scoped-acquisition
//! primitive, versioned idempotent schema migrations, and a pooled read path.
//!
//! The teardown sequence on every scoped write matches the kernel's original
//! connection-management helpers: close the working connection, then open a fresh
//! short-lived connection solely to issue a truncating checkpoint, then close that
//! too. On platforms with advisory file locking this is the only reliable way to
//! release the WAL auxiliary files; we pay the cost of a second connection open on
//! every write rather than risk leaving `-wal`/`-shm` files behind after shutdown.

pub mod fts;
pub mod persistence;

use crate::error::KernelError;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// Minimum busy-wait honoured on every connection, per the store's contract.
const BUSY_TIMEOUT_MS: u32 = 5_000;

/// Delay after closing connections to let the OS release file handles before the
/// checkpoint runs. Named for what it buys us, not which platform needs it most.
const HANDLE_RELEASE_DELAY: Duration = Duration::from_millis(50);

/// Current schema version this binary knows how to produce / migrate to.
const SCHEMA_VERSION: i64 = 1;

pub struct Store {
    db_path: PathBuf,
    pool: Pool<SqliteConnectionManager>,
}

fn set_wal_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;",
    )?;
    conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS as u64))?;
    Ok(())
}

fn windows_release_handles() {
    thread::sleep(HANDLE_RELEASE_DELAY);
}

/// Run `PRAGMA wal_checkpoint(TRUNCATE)` on a fresh, short-lived connection. Never
/// called on a connection that's still in use elsewhere.
fn wal_checkpoint_truncate(db_path: &Path) -> rusqlite::Result<()> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
    drop(conn);
    windows_release_handles();
    Ok(())
}

impl Store {
    /// Open (creating if necessary) the store at `db_path`, applying pragmas and
    /// schema migrations, and build the pooled read path. Uses the default FTS
    /// tokenizer ("porter"); see [`Store::open_with_tokenizer`] for config-driven
    /// tokenizer selection.
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self, KernelError> {
        Self::open_with_tokenizer(db_path, fts::DEFAULT_TOKENIZER)
    }

    /// Same as [`Store::open`], but with an explicit FTS tokenizer (`retrieval.fts_tokenizer`
    /// in config, e.g. `"porter"` or `"unicode61 remove_diacritics 2"`).
    pub fn open_with_tokenizer(db_path: impl Into<PathBuf>, tokenizer: &str) -> Result<Self, KernelError> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| KernelError::StoreUnavailable(format!("create db dir: {e}")))?;
        }

        {
            let conn = Connection::open(&db_path)
                .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?;
            set_wal_pragmas(&conn).map_err(|e| KernelError::StoreUnavailable(e.to_string()))?;
            Self::migrate(&conn)?;
            fts::init_schema_with_tokenizer(&conn, tokenizer)?;
        }
        // The schema-applying connection above must be closed and checkpointed
        // before we hand out pooled connections, otherwise the pool's first
        // connection could race the checkpoint.
        wal_checkpoint_truncate(&db_path)
            .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?;

        let manager = SqliteConnectionManager::file(&db_path).with_init(|conn| {
            set_wal_pragmas(conn)?;
            Ok(())
        });
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?;

        Ok(Self { db_path, pool })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn migrate(conn: &Connection) -> Result<(), KernelError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS metadata (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
        )
        .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT COALESCE((SELECT value FROM metadata WHERE key = 'schema_version'), '0')",
                [],
                |row| row.get::<_, String>(0),
            )
            .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?
            .parse()
            .unwrap_or(0);

        if current_version < 1 {
            Self::apply_schema_v1(conn)?;
        }

        conn.execute(
            "INSERT INTO metadata(key, value) VALUES ('schema_version', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [SCHEMA_VERSION.to_string()],
        )
        .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?;

        Ok(())
    }

    fn apply_schema_v1(conn: &Connection) -> Result<(), KernelError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS memories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                summary TEXT,
                ts TEXT NOT NULL,
                ts_s INTEGER NOT NULL,
                UNIQUE(kind, key)
            );
            CREATE INDEX IF NOT EXISTS idx_memories_kind_ts ON memories(kind, ts_s DESC);

            CREATE TABLE IF NOT EXISTS scheduled_tasks (
                id TEXT PRIMARY KEY,
                cadence TEXT NOT NULL,
                next_run_ts INTEGER NOT NULL,
                last_run_ts INTEGER,
                window_state TEXT
            );

            CREATE TABLE IF NOT EXISTS ticks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                started_ts INTEGER NOT NULL,
                finished_ts INTEGER,
                success INTEGER NOT NULL DEFAULT 0,
                idempotency_key TEXT NOT NULL UNIQUE,
                result_meta TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_ticks_task_started ON ticks(task_id, started_ts DESC);

            CREATE TABLE IF NOT EXISTS nudges (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                message TEXT NOT NULL,
                actions TEXT NOT NULL,
                reason TEXT NOT NULL,
                created_ts TEXT NOT NULL,
                created_ts_s INTEGER NOT NULL,
                acted_ts TEXT,
                acted_ts_s INTEGER,
                status TEXT NOT NULL DEFAULT 'pending'
            );
            CREATE INDEX IF NOT EXISTS idx_nudges_status ON nudges(status, created_ts_s DESC);

            CREATE TABLE IF NOT EXISTS reflections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                meta TEXT NOT NULL,
                ts TEXT NOT NULL,
                ts_s INTEGER NOT NULL,
                pinned INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_reflections_kind_ts ON reflections(kind, ts_s DESC);

            CREATE TABLE IF NOT EXISTS system_flags (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )
        .map_err(|e| KernelError::StoreUnavailable(e.to_string()))
    }

    /// Scoped-acquisition primitive (§4.1): open a dedicated connection, run `f`
    /// against it, then unconditionally checkpoint-and-truncate the WAL with a
    /// fresh connection once `f` (and the working connection) is done. This is the
    /// only path the Scheduler and Brake use to write; read-mostly call sites use
    /// [`Store::pool_conn`] instead since they don't need the checkpoint guarantee
    /// on every acquisition.
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, KernelError>,
    ) -> Result<T, KernelError> {
        let conn = Connection::open(&self.db_path)
            .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?;
        set_wal_pragmas(&conn).map_err(|e| KernelError::StoreUnavailable(e.to_string()))?;

        let result = f(&conn);

        drop(conn);
        if let Err(e) = wal_checkpoint_truncate(&self.db_path) {
            tracing::warn!("wal checkpoint failed: {e}");
        }

        result
    }

    /// Pooled connection for read-mostly paths (FTS search, nudge/reflection
    /// listing, metrics, health). Does not checkpoint on release.
    pub fn pool_conn(
        &self,
    ) -> Result<r2d2::PooledConnection<SqliteConnectionManager>, KernelError> {
        self.pool
            .get()
            .map_err(|e| KernelError::Busy(e.to_string()))
    }

    /// Close the store: drop the pool, then run a final truncating checkpoint.
    /// Called once by the Daemon on shutdown.
    pub fn close(self) -> Result<(), KernelError> {
        drop(self.pool);
        windows_release_handles();
        wal_checkpoint_truncate(&self.db_path).map_err(|e| KernelError::StoreUnavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_schema_and_checkpoints_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("barth.db");
        let store = Store::open(&db_path).unwrap();

        store
            .with_connection(|conn| {
                conn.execute(
                    "INSERT INTO memories(kind, key, value, ts, ts_s) VALUES ('t','k','v','2020',0)",
                    [],
                )
                .map_err(|e| KernelError::Persistence(e.to_string()))
            })
            .unwrap();

        assert!(db_path.exists());
        // WAL auxiliary files should not exist right after a scoped release.
        assert!(!db_path.with_extension("db-wal").exists());
        assert!(!db_path.with_extension("db-shm").exists());

        store.close().unwrap();
    }

    #[test]
    fn pool_conn_reads_committed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("barth.db");
        let store = Store::open(&db_path).unwrap();

        store
            .with_connection(|conn| {
                conn.execute(
                    "INSERT INTO memories(kind, key, value, ts, ts_s) VALUES ('t','k','v','2020',0)",
                    [],
                )
                .map_err(|e| KernelError::Persistence(e.to_string()))
            })
            .unwrap();

        let conn = store.pool_conn().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
