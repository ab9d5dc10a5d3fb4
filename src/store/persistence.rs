//! Scheduler-adjacent persistence: scheduled tasks, ticks, nudges, reflections.
//!
//! Table shapes live in `store::apply_schema_v1`; this module is just the query
//! layer the Scheduler and Daemon call through `Store::with_connection`. Ported
//! from the kernel's `scheduler/persistence.py` — same statements, same return
//! shapes, minus the `wal_db` plumbing (the Store's scoped-acquisition primitive
//! already wraps every call site).

use crate::error::KernelError;
use crate::models::{Memory, Nudge, NudgeAction, NudgeStatus, Reflection, ScheduledTask, Tick};
use chrono::{TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

pub fn upsert_scheduled_tasks(
    conn: &Connection,
    tasks: &[(String, String)],
    now_ts: i64,
) -> Result<(), KernelError> {
    for (task_id, cadence) in tasks {
        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM scheduled_tasks WHERE id = ?1)",
                [task_id],
                |r| r.get(0),
            )
            .map_err(|e| KernelError::Persistence(e.to_string()))?;

        if !exists {
            conn.execute(
                "INSERT INTO scheduled_tasks (id, cadence, next_run_ts) VALUES (?1, ?2, ?3)",
                params![task_id, cadence, now_ts],
            )
            .map_err(|e| KernelError::Persistence(e.to_string()))?;
        }
    }
    Ok(())
}

pub fn next_due_task(conn: &Connection, now_ts: i64) -> Result<Option<ScheduledTask>, KernelError> {
    conn.query_row(
        "SELECT id, cadence, next_run_ts, last_run_ts, window_state
         FROM scheduled_tasks
         WHERE next_run_ts <= ?1
         ORDER BY next_run_ts ASC, id ASC
         LIMIT 1",
        [now_ts],
        |row| {
            let window_state: Option<String> = row.get(4)?;
            Ok(ScheduledTask {
                id: row.get(0)?,
                cadence: row.get(1)?,
                next_run_ts: row.get(2)?,
                last_run_ts: row.get(3)?,
                window_state: window_state.and_then(|s| serde_json::from_str(&s).ok()),
            })
        },
    )
    .optional()
    .map_err(|e| KernelError::Persistence(e.to_string()))
}

pub fn tick_exists(conn: &Connection, idempotency_key: &str) -> Result<bool, KernelError> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM ticks WHERE idempotency_key = ?1)",
        [idempotency_key],
        |r| r.get(0),
    )
    .map_err(|e| KernelError::Persistence(e.to_string()))
}

#[allow(clippy::too_many_arguments)]
pub fn insert_tick(
    conn: &Connection,
    task_id: &str,
    started_ts: i64,
    finished_ts: Option<i64>,
    success: bool,
    idempotency_key: &str,
    result_meta: Option<&serde_json::Value>,
) -> Result<i64, KernelError> {
    let result_json = result_meta.map(|v| v.to_string());

    let inserted = conn.execute(
        "INSERT INTO ticks (task_id, started_ts, finished_ts, success, idempotency_key, result_meta)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![task_id, started_ts, finished_ts, success as i64, idempotency_key, result_json],
    );

    match inserted {
        Ok(_) => Ok(conn.last_insert_rowid()),
        // Duplicate idempotency_key: another process/restart already recorded this
        // occurrence. Treated as "already ran", not an error (spec §4.5 step 4).
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
            tick_id_for_key(conn, idempotency_key)
        }
        Err(e) => Err(KernelError::Persistence(e.to_string())),
    }
}

fn tick_id_for_key(conn: &Connection, idempotency_key: &str) -> Result<i64, KernelError> {
    conn.query_row(
        "SELECT id FROM ticks WHERE idempotency_key = ?1",
        [idempotency_key],
        |r| r.get(0),
    )
    .map_err(|e| KernelError::Persistence(e.to_string()))
}

pub fn insert_nudge(
    conn: &Connection,
    kind: &str,
    message: &str,
    actions: &[NudgeAction],
    reason: &str,
    created_ts_s: i64,
) -> Result<i64, KernelError> {
    let actions_json = serde_json::to_string(actions).map_err(|e| KernelError::Persistence(e.to_string()))?;
    let created_iso = Utc
        .timestamp_opt(created_ts_s, 0)
        .single()
        .ok_or_else(|| KernelError::Persistence("invalid timestamp".to_string()))?
        .to_rfc3339();

    conn.execute(
        "INSERT INTO nudges (kind, message, actions, reason, created_ts, created_ts_s, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending')",
        params![kind, message, actions_json, reason, created_iso, created_ts_s],
    )
    .map_err(|e| KernelError::Persistence(e.to_string()))?;

    Ok(conn.last_insert_rowid())
}

pub fn insert_reflection(
    conn: &Connection,
    kind: &str,
    content: &str,
    meta: &serde_json::Value,
    ts_s: i64,
    pinned: bool,
) -> Result<i64, KernelError> {
    let ts_iso = Utc
        .timestamp_opt(ts_s, 0)
        .single()
        .ok_or_else(|| KernelError::Persistence("invalid timestamp".to_string()))?
        .to_rfc3339();

    conn.execute(
        "INSERT INTO reflections (kind, content, meta, ts, ts_s, pinned) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![kind, content, meta.to_string(), ts_iso, ts_s, pinned as i64],
    )
    .map_err(|e| KernelError::Persistence(e.to_string()))?;

    Ok(conn.last_insert_rowid())
}

pub fn insert_memory(
    conn: &Connection,
    kind: &str,
    key: &str,
    value: &str,
    summary: Option<&str>,
    ts_s: i64,
) -> Result<i64, KernelError> {
    let ts_iso = Utc
        .timestamp_opt(ts_s, 0)
        .single()
        .ok_or_else(|| KernelError::Persistence("invalid timestamp".to_string()))?
        .to_rfc3339();

    conn.execute(
        "INSERT INTO memories (kind, key, value, summary, ts, ts_s) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(kind, key) DO UPDATE SET value = excluded.value, summary = excluded.summary,
            ts = excluded.ts, ts_s = excluded.ts_s",
        params![kind, key, value, summary, ts_iso, ts_s],
    )
    .map_err(|e| KernelError::Persistence(e.to_string()))?;

    conn.query_row(
        "SELECT id FROM memories WHERE kind = ?1 AND key = ?2",
        [kind, key],
        |r| r.get(0),
    )
    .map_err(|e| KernelError::Persistence(e.to_string()))
}

pub fn update_next_run(
    conn: &Connection,
    task_id: &str,
    next_run_ts: i64,
    last_run_ts: i64,
    window_state: Option<&serde_json::Value>,
) -> Result<(), KernelError> {
    let window_json = window_state.map(|v| v.to_string());
    conn.execute(
        "UPDATE scheduled_tasks SET next_run_ts = ?1, last_run_ts = ?2, window_state = ?3 WHERE id = ?4",
        params![next_run_ts, last_run_ts, window_json, task_id],
    )
    .map_err(|e| KernelError::Persistence(e.to_string()))?;
    Ok(())
}

pub fn pending_nudge_count(conn: &Connection) -> Result<i64, KernelError> {
    conn.query_row(
        "SELECT COUNT(*) FROM nudges WHERE status = 'pending'",
        [],
        |r| r.get(0),
    )
    .map_err(|e| KernelError::Persistence(e.to_string()))
}

pub fn list_pending_nudges(conn: &Connection, limit: i64) -> Result<Vec<Nudge>, KernelError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, kind, message, actions, reason, created_ts, created_ts_s,
                    acted_ts, acted_ts_s, status
             FROM nudges WHERE status = 'pending'
             ORDER BY created_ts_s DESC LIMIT ?1",
        )
        .map_err(|e| KernelError::Persistence(e.to_string()))?;

    stmt.query_map([limit], row_to_nudge)
        .map_err(|e| KernelError::Persistence(e.to_string()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| KernelError::Persistence(e.to_string()))
}

pub fn set_nudge_status(
    conn: &Connection,
    nudge_id: i64,
    status: NudgeStatus,
    acted_ts_s: i64,
) -> Result<Option<Nudge>, KernelError> {
    let acted_iso = Utc
        .timestamp_opt(acted_ts_s, 0)
        .single()
        .ok_or_else(|| KernelError::Persistence("invalid timestamp".to_string()))?
        .to_rfc3339();

    conn.execute(
        "UPDATE nudges SET status = ?1, acted_ts = ?2, acted_ts_s = ?3 WHERE id = ?4 AND status = 'pending'",
        params![status.as_str(), acted_iso, acted_ts_s, nudge_id],
    )
    .map_err(|e| KernelError::Persistence(e.to_string()))?;

    conn.query_row(
        "SELECT id, kind, message, actions, reason, created_ts, created_ts_s,
                acted_ts, acted_ts_s, status
         FROM nudges WHERE id = ?1",
        [nudge_id],
        row_to_nudge,
    )
    .optional()
    .map_err(|e| KernelError::Persistence(e.to_string()))
}

fn row_to_nudge(row: &rusqlite::Row) -> rusqlite::Result<Nudge> {
    let actions_json: String = row.get(3)?;
    let status_str: String = row.get(9)?;
    Ok(Nudge {
        id: row.get(0)?,
        kind: row.get(1)?,
        message: row.get(2)?,
        actions: serde_json::from_str(&actions_json).unwrap_or_default(),
        reason: row.get(4)?,
        created_ts: row.get(5)?,
        created_ts_s: row.get(6)?,
        acted_ts: row.get(7)?,
        acted_ts_s: row.get(8)?,
        status: NudgeStatus::parse(&status_str).unwrap_or(NudgeStatus::Pending),
    })
}

pub fn latest_reflection(conn: &Connection, kind: &str) -> Result<Option<Reflection>, KernelError> {
    conn.query_row(
        "SELECT id, kind, content, meta, ts, ts_s, pinned FROM reflections
         WHERE kind = ?1 ORDER BY ts_s DESC LIMIT 1",
        [kind],
        row_to_reflection,
    )
    .optional()
    .map_err(|e| KernelError::Persistence(e.to_string()))
}

fn row_to_reflection(row: &rusqlite::Row) -> rusqlite::Result<Reflection> {
    let meta_json: String = row.get(3)?;
    Ok(Reflection {
        id: row.get(0)?,
        kind: row.get(1)?,
        content: row.get(2)?,
        meta: serde_json::from_str(&meta_json).unwrap_or(serde_json::Value::Null),
        ts: row.get(4)?,
        ts_s: row.get(5)?,
        pinned: row.get::<_, i64>(6)? != 0,
    })
}

pub fn last_daily_reflection_ts(conn: &Connection) -> Result<Option<i64>, KernelError> {
    conn.query_row(
        "SELECT ts_s FROM reflections WHERE kind = 'daily_journal' ORDER BY ts_s DESC LIMIT 1",
        [],
        |r| r.get(0),
    )
    .optional()
    .map_err(|e| KernelError::Persistence(e.to_string()))
}

pub fn memory_by_id(conn: &Connection, id: i64) -> Result<Option<Memory>, KernelError> {
    conn.query_row(
        "SELECT id, kind, key, value, summary, ts, ts_s FROM memories WHERE id = ?1",
        [id],
        |row| {
            Ok(Memory {
                id: row.get(0)?,
                kind: row.get(1)?,
                key: row.get(2)?,
                value: row.get(3)?,
                summary: row.get(4)?,
                ts: row.get(5)?,
                ts_s: row.get(6)?,
            })
        },
    )
    .optional()
    .map_err(|e| KernelError::Persistence(e.to_string()))
}

/// Ticks recorded for a given task, most recent first. Used by tests and the
/// end-to-end scenario check, not by any production code path.
pub fn ticks_for_task(conn: &Connection, task_id: &str) -> Result<Vec<Tick>, KernelError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, task_id, started_ts, finished_ts, success, idempotency_key, result_meta
             FROM ticks WHERE task_id = ?1 ORDER BY started_ts DESC",
        )
        .map_err(|e| KernelError::Persistence(e.to_string()))?;

    stmt.query_map([task_id], |row| {
        let meta_json: Option<String> = row.get(6)?;
        Ok(Tick {
            id: row.get(0)?,
            task_id: row.get(1)?,
            started_ts: row.get(2)?,
            finished_ts: row.get(3)?,
            success: row.get::<_, i64>(4)? != 0,
            idempotency_key: row.get(5)?,
            result_meta: meta_json.and_then(|s| serde_json::from_str(&s).ok()),
        })
    })
    .map_err(|e| KernelError::Persistence(e.to_string()))?
    .collect::<Result<Vec<_>, _>>()
    .map_err(|e| KernelError::Persistence(e.to_string()))
}
