//! External-content FTS5 index over `memories(value, summary)`, with self-healing
//! schema migration, bm25 ranking with a manual fallback ranker, and snippet
//! generation. Ported from the kernel's `fts_client.py`: same trigger shapes, same
//! self-heal query, same fallback math, expressed as SQL + a registered scalar
//! function instead of Python string formatting.

use crate::error::KernelError;
use crate::util::truncate_utf8_safe;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

/// Default tokenizer when no config overrides it.
pub const DEFAULT_TOKENIZER: &str = "porter";

fn fts5_available(conn: &Connection) -> bool {
    let probe = conn.execute_batch(
        "CREATE VIRTUAL TABLE temp.__fts5_probe USING fts5(x); DROP TABLE temp.__fts5_probe;",
    );
    probe.is_ok()
}

/// Create the `memory_fts` virtual table, its tracking table, and the three
/// mirror triggers, then run the self-heal migration. Idempotent: safe to call on
/// every startup.
pub fn init_schema(conn: &Connection) -> Result<(), KernelError> {
    init_schema_with_tokenizer(conn, DEFAULT_TOKENIZER)
}

pub fn init_schema_with_tokenizer(conn: &Connection, tokenizer: &str) -> Result<(), KernelError> {
    if !fts5_available(conn) {
        return Err(KernelError::FeatureUnavailable(
            "SQLite FTS5 is not available in this build. Install/link a SQLite compiled \
             with FTS5. This is unrelated to the separate vector-search extension (vss0)."
                .to_string(),
        ));
    }

    let schema = format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS memory_fts USING fts5(
            value,
            summary,
            content='memories',
            content_rowid='id',
            tokenize='{tokenizer}'
        );

        CREATE TABLE IF NOT EXISTS memory_fts_map (
            memory_id INTEGER PRIMARY KEY,
            indexed_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            FOREIGN KEY(memory_id) REFERENCES memories(id) ON DELETE CASCADE
        );

        CREATE TRIGGER IF NOT EXISTS memory_fts_insert AFTER INSERT ON memories
        BEGIN
            INSERT INTO memory_fts(rowid, value, summary)
            VALUES (new.id, new.value, new.summary);
            INSERT OR IGNORE INTO memory_fts_map(memory_id) VALUES (new.id);
        END;

        CREATE TRIGGER IF NOT EXISTS memory_fts_update AFTER UPDATE ON memories
        BEGIN
            INSERT INTO memory_fts(memory_fts, rowid, value, summary)
            VALUES ('delete', old.id, old.value, old.summary);
            INSERT INTO memory_fts(rowid, value, summary)
            VALUES (new.id, new.value, new.summary);
        END;

        CREATE TRIGGER IF NOT EXISTS memory_fts_delete AFTER DELETE ON memories
        BEGIN
            INSERT INTO memory_fts(memory_fts, rowid, value, summary)
            VALUES ('delete', old.id, old.value, old.summary);
            DELETE FROM memory_fts_map WHERE memory_id = old.id;
        END;"
    );

    conn.execute_batch(&schema)
        .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?;

    migrate_schema(conn)
}

/// Self-healing migration (§4.2, property 4): if any FTS rowid has no matching
/// Memory row, purge the index and the tracking table and rebuild both from
/// `memories`. Idempotent — a clean index makes this a no-op.
pub fn migrate_schema(conn: &Connection) -> Result<(), KernelError> {
    let has_mismatch: bool = conn
        .query_row(
            "SELECT EXISTS(
                SELECT 1 FROM memory_fts f
                LEFT JOIN memories m ON f.rowid = m.id
                WHERE m.id IS NULL
            )",
            [],
            |row| row.get(0),
        )
        .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?;

    if !has_mismatch {
        return Ok(());
    }

    tracing::warn!("FTS rowid mismatch detected, rebuilding index");
    rebuild_index(conn)?;
    Ok(())
}

/// Rebuild the entire index from `memories`. Returns the number indexed.
fn rebuild_index(conn: &Connection) -> Result<i64, KernelError> {
    conn.execute_batch(
        "DELETE FROM memory_fts;
         DELETE FROM memory_fts_map;
         INSERT INTO memory_fts(rowid, value, summary) SELECT id, value, summary FROM memories;
         INSERT INTO memory_fts_map(memory_id) SELECT id FROM memories;",
    )
    .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?;

    conn.query_row("SELECT COUNT(*) FROM memory_fts_map", [], |r| r.get(0))
        .map_err(|e| KernelError::StoreUnavailable(e.to_string()))
}

/// Merge FTS segments. Called by the `fts_optimize` drive.
pub fn optimize(conn: &Connection) -> Result<(), KernelError> {
    conn.execute("INSERT INTO memory_fts(memory_fts) VALUES ('optimize')", [])
        .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?;
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: i64,
    pub kind: String,
    pub key: String,
    pub value: String,
    pub summary: Option<String>,
    pub ts: String,
    pub rank: f64,
    pub snippet: String,
}

/// Approximate BM25-like score from `matchinfo('pcx')`, used only when the
/// native `bm25()` UDF is unavailable. Negated by the caller so that, like the
/// native ranker, lower values mean a better match.
fn rank_pcx(blob: &[u8]) -> f64 {
    if blob.len() < 8 {
        return 0.0;
    }
    let ints: Vec<u32> = blob
        .chunks_exact(4)
        .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    if ints.len() < 2 {
        return 0.0;
    }
    let p = ints[0] as usize;
    let c = ints[1] as usize;
    let mut idx = 2usize;
    let mut score = 0.0f64;
    for _ in 0..p {
        for _ in 0..c {
            if idx + 2 >= ints.len() {
                break;
            }
            let hits_this_row = ints[idx];
            let docs_with_hits = ints[idx + 2];
            idx += 3;
            if docs_with_hits > 0 {
                score += hits_this_row as f64 / (docs_with_hits as f64 + 1.0);
            }
        }
    }
    score
}

fn register_rank_pcx(conn: &Connection) -> Result<(), KernelError> {
    conn.create_scalar_function(
        "rank_pcx",
        1,
        rusqlite::functions::FunctionFlags::SQLITE_UTF8 | rusqlite::functions::FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let blob = ctx.get_raw(0).as_blob().unwrap_or(&[]);
            Ok(rank_pcx(blob))
        },
    )
    .map_err(|e| KernelError::StoreUnavailable(e.to_string()))
}

/// Post-search filter plug-in. Mirrors the Brake's `AuditSink` pattern: a trait
/// object the Daemon may or may not install, never required for search to work.
pub trait ConsentGate: Send + Sync {
    fn allows(&self, hit: &SearchHit) -> bool;
}

/// The gate used when the Daemon hasn't wired one: every hit passes through.
pub struct IdentityGate;

impl ConsentGate for IdentityGate {
    fn allows(&self, _hit: &SearchHit) -> bool {
        true
    }
}

/// [`search`] plus an optional [`ConsentGate`] post-filter. When a gate is
/// wired, results are over-fetched at `3 * limit` so that filtering happens
/// before truncation to the caller's limit, not after — otherwise a gate that
/// rejects even a few of the top matches would silently return fewer than
/// `limit` rows instead of backfilling from the next-best matches.
pub fn search_with_gate(
    conn: &Connection,
    query: &str,
    limit: i64,
    offset: i64,
    order_by_rank: bool,
    force_fallback: bool,
    gate: Option<&dyn ConsentGate>,
) -> Result<Vec<SearchHit>, KernelError> {
    let Some(gate) = gate else {
        return search(conn, query, limit, offset, order_by_rank, force_fallback);
    };

    let over_fetch_limit = limit.saturating_mul(3);
    let hits = search(conn, query, over_fetch_limit, offset, order_by_rank, force_fallback)?;

    Ok(hits.into_iter().filter(|hit| gate.allows(hit)).take(limit.max(0) as usize).collect())
}

/// `BARTHO_FORCE_BM25_FALLBACK=1` pins every search onto the [`rank_pcx`]
/// fallback path regardless of what a caller passes for `force_fallback`,
/// for deterministic fallback-path test coverage without a DB built
/// specially to lack the `bm25()` UDF.
fn force_fallback_from_env() -> bool {
    match std::env::var("BARTHO_FORCE_BM25_FALLBACK") {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => false,
    }
}

/// True when a `prepare()` error is SQLite rejecting the `bm25()` call itself
/// (function not registered) rather than some other statement problem.
fn is_missing_bm25_function(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(_, Some(msg)) => msg.to_lowercase().contains("no such function: bm25"),
        _ => false,
    }
}

/// Search over the FTS index. `query` is a raw FTS5 match expression. When
/// `force_fallback` is false, the native `bm25()` ranker is tried first; on
/// "no such function: bm25" it falls back to [`rank_pcx`] transparently.
pub fn search(
    conn: &Connection,
    query: &str,
    limit: i64,
    offset: i64,
    order_by_rank: bool,
    force_fallback: bool,
) -> Result<Vec<SearchHit>, KernelError> {
    let force_fallback = force_fallback || force_fallback_from_env();
    let order_clause = if order_by_rank { "ORDER BY rank ASC" } else { "ORDER BY m.id DESC" };

    let sql_bm25 = format!(
        "SELECT m.id, m.kind, m.key, m.value, m.summary, m.ts,
                bm25(memory_fts) as rank,
                snippet(memory_fts, 0, '[', ']', ' … ', 8) as snippet
         FROM memory_fts
         JOIN memories m ON memory_fts.rowid = m.id
         WHERE memory_fts MATCH ?1
         {order_clause}
         LIMIT ?2 OFFSET ?3"
    );

    let sql_fallback = format!(
        "SELECT m.id, m.kind, m.key, m.value, m.summary, m.ts,
                -rank_pcx(matchinfo(memory_fts, 'pcx')) as rank,
                snippet(memory_fts, 0, '[', ']', ' … ', 8) as snippet
         FROM memory_fts
         JOIN memories m ON memory_fts.rowid = m.id
         WHERE memory_fts MATCH ?1
         {order_clause}
         LIMIT ?2 OFFSET ?3"
    );

    let map_row = |row: &rusqlite::Row| -> rusqlite::Result<SearchHit> {
        Ok(SearchHit {
            id: row.get(0)?,
            kind: row.get(1)?,
            key: row.get(2)?,
            value: row.get(3)?,
            summary: row.get(4)?,
            ts: row.get(5)?,
            rank: row.get(6)?,
            snippet: row.get(7)?,
        })
    };

    if !force_fallback {
        // SQLite reports an unknown scalar function ("no such function: bm25") at
        // `prepare` time, not at `query_map` time - there's no row cursor yet for
        // it to fail inside. Check the `prepare` error itself for the missing-
        // function message before falling back.
        match conn.prepare(&sql_bm25) {
            Ok(mut stmt) => {
                return stmt
                    .query_map(rusqlite::params![query, limit, offset], map_row)
                    .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| KernelError::StoreUnavailable(e.to_string()));
            }
            Err(e) if is_missing_bm25_function(&e) => {
                tracing::info!("bm25 UDF not available, using matchinfo fallback");
            }
            Err(e) => return Err(KernelError::StoreUnavailable(e.to_string())),
        }
    }

    register_rank_pcx(conn)?;
    let mut stmt = conn
        .prepare(&sql_fallback)
        .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?;
    stmt.query_map(rusqlite::params![query, limit, offset], map_row)
        .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| KernelError::StoreUnavailable(e.to_string()))
}

/// Truncate a snippet defensively to a byte budget, respecting UTF-8 boundaries,
/// for surfaces (HTTP responses, CLI output) that cap result size.
pub fn truncate_snippet(snippet: &str, max_bytes: usize) -> &str {
    truncate_utf8_safe(snippet, max_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn seed(conn: &Connection, kind: &str, key: &str, value: &str) -> i64 {
        conn.execute(
            "INSERT INTO memories(kind, key, value, ts, ts_s) VALUES (?1, ?2, ?3, '2020', 0)",
            rusqlite::params![kind, key, value],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    #[test]
    fn self_heal_removes_orphan_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("barth.db")).unwrap();

        store
            .with_connection(|conn| {
                seed(conn, "note", "a", "privacy matters a lot");
                conn.execute(
                    "INSERT INTO memory_fts(rowid, value, summary) VALUES (9999, 'orphan', NULL)",
                    [],
                )
                .unwrap();
                Ok(())
            })
            .unwrap();

        store
            .with_connection(|conn| {
                migrate_schema(conn)?;
                let orphan_gone: bool = conn
                    .query_row(
                        "SELECT NOT EXISTS(SELECT 1 FROM memory_fts WHERE rowid = 9999)",
                        [],
                        |r| r.get(0),
                    )
                    .unwrap();
                assert!(orphan_gone);
                // Idempotent: running it twice more changes nothing further.
                migrate_schema(conn)?;
                migrate_schema(conn)?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn fallback_ranking_prefers_denser_matches() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("barth.db")).unwrap();

        store
            .with_connection(|conn| {
                seed(conn, "note", "dense", "privacy privacy privacy and other words here");
                seed(conn, "note", "sparse", "privacy and other words here");
                Ok(())
            })
            .unwrap();

        let conn = store.pool_conn().unwrap();
        let hits = search(&conn, "privacy", 10, 0, true, true).unwrap();
        assert_eq!(hits.len(), 2);
        let dense = hits.iter().find(|h| h.key == "dense").unwrap();
        let sparse = hits.iter().find(|h| h.key == "sparse").unwrap();
        assert!(dense.rank < sparse.rank, "denser match should rank lower (better)");
    }

    #[test]
    fn consent_gate_over_fetches_so_filtering_precedes_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("barth.db")).unwrap();

        store
            .with_connection(|conn| {
                for i in 0..5 {
                    seed(conn, "note", &format!("k{i}"), "privacy matters here");
                }
                Ok(())
            })
            .unwrap();

        struct RejectFirstTwo;
        impl ConsentGate for RejectFirstTwo {
            fn allows(&self, hit: &SearchHit) -> bool {
                hit.key != "k0" && hit.key != "k1"
            }
        }

        let conn = store.pool_conn().unwrap();
        // Without over-fetch, asking for 2 after rejecting the top 2 matches
        // of a 5-row result set would come back empty. The gate must see
        // enough candidates (3x limit) to still fill the requested limit.
        let hits = search_with_gate(&conn, "privacy", 2, 0, false, true, Some(&RejectFirstTwo)).unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.key != "k0" && h.key != "k1"));
    }

    #[test]
    fn identity_gate_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("barth.db")).unwrap();
        store.with_connection(|conn| { seed(conn, "note", "a", "privacy"); Ok(()) }).unwrap();

        let conn = store.pool_conn().unwrap();
        let hits = search_with_gate(&conn, "privacy", 10, 0, false, true, Some(&IdentityGate)).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn env_var_forces_fallback_even_when_caller_passes_false() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("barth.db")).unwrap();
        store
            .with_connection(|conn| {
                seed(conn, "note", "a", "privacy matters a lot");
                Ok(())
            })
            .unwrap();
        let conn = store.pool_conn().unwrap();

        std::env::set_var("BARTHO_FORCE_BM25_FALLBACK", "1");
        let hits = search(&conn, "privacy", 10, 0, false, false).unwrap();
        std::env::remove_var("BARTHO_FORCE_BM25_FALLBACK");

        assert_eq!(hits.len(), 1);
    }
}
