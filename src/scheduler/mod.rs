//! Autonomy loop: runs registered drives on their resolved cadences, brake-gated,
//! idempotency-key protected against duplicate execution across restarts.
//!
//! Ported from the kernel's `scheduler/loop.py`. Two behaviours it did not have
//! are layered on top, both decided and recorded rather than left as open
//! questions: a brake check before dispatch (producing [`DriveOutcome::Blocked`]
//! instead of running), and advancing `next_run_ts` on a blocked tick so a
//! blocked drive doesn't busy-loop the whole registry.

pub mod cadence;
pub mod drives;

use crate::error::KernelError;
use crate::models::SystemMetrics;
use crate::safety::brake::Brake;
use crate::scheduler::drives::DriveContext;
use crate::store::{persistence, Store};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Outcome of one pass through the loop body, in place of the original's bare
/// exception-or-not control flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveOutcome {
    Ran { task_id: String, success: bool, duration_ms: i64 },
    Skipped { task_id: String },
    Blocked { task_id: String, scope: String },
    Idle,
}

/// Resolve each registered drive's cadence: env override (`DRIVE_<ID>`) beats
/// config override (`config_drives[id]`) beats the registry default.
pub fn resolve_cadences(config_drives: &HashMap<String, String>) -> HashMap<String, String> {
    let mut resolved = HashMap::new();

    for entry in drives::registry() {
        let mut cadence = entry.default_cadence.to_string();

        if let Some(cfg) = config_drives.get(entry.id) {
            cadence = cfg.clone();
        }

        let env_key = format!("DRIVE_{}", entry.id.to_uppercase());
        if let Ok(env_val) = std::env::var(&env_key) {
            if !env_val.is_empty() {
                cadence = env_val;
            }
        }

        resolved.insert(entry.id.to_string(), cadence);
    }

    resolved
}

struct StoreDriveContext<'a> {
    store: &'a Store,
}

impl<'a> DriveContext for StoreDriveContext<'a> {
    fn system_metrics(&self) -> Result<SystemMetrics, KernelError> {
        get_system_metrics(self.store)
    }

    fn insert_reflection(
        &self,
        kind: &str,
        content: &str,
        meta: &serde_json::Value,
        ts_s: i64,
        pinned: bool,
    ) -> Result<i64, KernelError> {
        self.store.with_connection(|conn| persistence::insert_reflection(conn, kind, content, meta, ts_s, pinned))
    }

    fn insert_memory(&self, kind: &str, key: &str, value: &str, summary: Option<&str>) -> Result<i64, KernelError> {
        let now = chrono::Utc::now().timestamp();
        self.store.with_connection(|conn| persistence::insert_memory(conn, kind, key, value, summary, now))
    }

    fn fts_optimize(&self) -> Result<(), KernelError> {
        self.store.with_connection(|conn| crate::store::fts::optimize(conn))
    }
}

/// Snapshot system health via the pooled read path. Best-effort: a database
/// access failure is reported as `db_ok: false`, not propagated as an error.
pub fn get_system_metrics(store: &Store) -> Result<SystemMetrics, KernelError> {
    let db_ok = store.db_path().exists();
    let db_size_bytes = std::fs::metadata(store.db_path()).map(|m| m.len()).unwrap_or(0);

    let conn = match store.pool_conn() {
        Ok(conn) => conn,
        Err(_) => {
            return Ok(SystemMetrics { db_ok: false, db_size_bytes, pending_nudges: 0, last_daily_reflection_ts: None })
        }
    };

    let pending_nudges = persistence::pending_nudge_count(&conn).unwrap_or(0);
    let last_daily_reflection_ts = persistence::last_daily_reflection_ts(&conn).unwrap_or(None);

    Ok(SystemMetrics { db_ok, db_size_bytes, pending_nudges, last_daily_reflection_ts })
}

/// One pass: find the next due task, skip it if already ticked (restart
/// protection), check the brake, run it, persist the tick and any nudge, then
/// advance `next_run_ts`.
fn run_once(store: &Store, brake: &Brake, now_ts: i64) -> Result<DriveOutcome, KernelError> {
    let due = store.with_connection(|conn| persistence::next_due_task(conn, now_ts))?;

    let Some(due_task) = due else {
        return Ok(DriveOutcome::Idle);
    };

    let task_id = due_task.id.clone();
    let scheduled_ts = due_task.next_run_ts;
    let idempotency_key = format!("{task_id}:{scheduled_ts}");

    let already_ran = store.with_connection(|conn| persistence::tick_exists(conn, &idempotency_key))?;
    if already_ran {
        advance_next_run(store, &due_task, now_ts)?;
        return Ok(DriveOutcome::Skipped { task_id });
    }

    // `scheduler` is the scope the autonomy loop runs under; `global` also
    // blocks it since it supersedes every specific scope.
    if brake.is_blocked("scheduler") {
        let reason_meta = serde_json::json!({"reason": "brake"});
        store.with_connection(|conn| {
            persistence::insert_tick(conn, &task_id, now_ts, Some(now_ts), false, &idempotency_key, Some(&reason_meta))
        })?;
        advance_next_run(store, &due_task, now_ts)?;
        return Ok(DriveOutcome::Blocked { task_id, scope: "scheduler".to_string() });
    }

    let entry = drives::registry().into_iter().find(|e| e.id == task_id);
    let Some(entry) = entry else {
        tracing::warn!("scheduled task {task_id} has no registered drive, skipping");
        advance_next_run(store, &due_task, now_ts)?;
        return Ok(DriveOutcome::Skipped { task_id });
    };

    let started_ts = now_ts;
    let ctx = StoreDriveContext { store };
    let (success, result_meta, nudge) = match (entry.run)(&ctx) {
        Ok(nudge) => (true, None, nudge),
        Err(e) => {
            tracing::warn!("drive {task_id} failed: {e}");
            (false, Some(serde_json::json!({"error": e.to_string()})), None)
        }
    };
    let finished_ts = chrono::Utc::now().timestamp();
    let duration_ms = (finished_ts - started_ts) * 1000;

    store.with_connection(|conn| {
        persistence::insert_tick(conn, &task_id, started_ts, Some(finished_ts), success, &idempotency_key, result_meta.as_ref())
    })?;

    if let Some(nudge) = nudge {
        if let Err(e) = store.with_connection(|conn| {
            persistence::insert_nudge(conn, &nudge.kind, &nudge.message, &nudge.actions, &nudge.reason, chrono::Utc::now().timestamp())
        }) {
            tracing::warn!("error inserting nudge from {task_id}: {e}");
        }
    }

    advance_next_run(store, &due_task, now_ts)?;

    tracing::info!(task = %task_id, ok = success, dur_ms = duration_ms, "drive tick");
    Ok(DriveOutcome::Ran { task_id, success, duration_ms })
}

fn advance_next_run(store: &Store, due_task: &crate::models::ScheduledTask, now_ts: i64) -> Result<(), KernelError> {
    let (next_ts, new_window_state) = cadence::compute_next_run(
        Some(due_task.next_run_ts),
        Some(due_task.next_run_ts),
        &due_task.cadence,
        now_ts,
        due_task.window_state.as_ref(),
    )?;

    store.with_connection(|conn| {
        persistence::update_next_run(conn, &due_task.id, next_ts, due_task.next_run_ts, new_window_state.as_ref())
    })
}

/// Register (or update) every drive from the resolved cadence map as a
/// `scheduled_tasks` row, new tasks becoming immediately due.
fn seed_scheduled_tasks(store: &Store, resolved: &HashMap<String, String>) -> Result<(), KernelError> {
    let now_ts = chrono::Utc::now().timestamp();
    let tasks: Vec<(String, String)> = resolved.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    store.with_connection(|conn| persistence::upsert_scheduled_tasks(conn, &tasks, now_ts))
}

/// Run the autonomy loop until `shutdown` fires. Sleeps 5s whenever nothing is
/// due or the pass errored, matching the original's backoff.
pub async fn run(store: Arc<Store>, brake: Arc<Brake>, config_drives: HashMap<String, String>, mut shutdown: oneshot::Receiver<()>) {
    let resolved = resolve_cadences(&config_drives);
    tracing::info!(?resolved, "scheduler: resolved cadences");

    if let Err(e) = seed_scheduled_tasks(&store, &resolved) {
        tracing::error!("scheduler: failed to seed scheduled tasks: {e}");
    }

    tracing::info!("scheduler: autonomy loop started");

    loop {
        if shutdown.try_recv().is_ok() {
            break;
        }

        let now_ts = chrono::Utc::now().timestamp();
        let outcome = {
            let store = store.clone();
            let brake = brake.clone();
            tokio::task::spawn_blocking(move || run_once(&store, &brake, now_ts)).await
        };

        let sleep_for = match outcome {
            Ok(Ok(DriveOutcome::Idle)) => Duration::from_secs(5),
            Ok(Ok(_)) => Duration::from_secs(0),
            Ok(Err(e)) => {
                tracing::warn!("scheduler: unexpected error in loop: {e}");
                Duration::from_secs(5)
            }
            Err(e) => {
                tracing::warn!("scheduler: tick task panicked: {e}");
                Duration::from_secs(5)
            }
        };

        if sleep_for.is_zero() {
            continue;
        }

        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = &mut shutdown => break,
        }
    }

    tracing::info!("scheduler: autonomy loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, Arc<Store>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("barth.db")).unwrap());
        (dir, store)
    }

    #[test]
    fn resolve_cadences_falls_back_to_registry_defaults() {
        let resolved = resolve_cadences(&HashMap::new());
        assert_eq!(resolved.get("self_check").unwrap(), "every:900");
        assert_eq!(resolved.get("curiosity_probe").unwrap(), "window:3600:2");
    }

    #[test]
    fn resolve_cadences_config_overrides_registry() {
        let mut cfg = HashMap::new();
        cfg.insert("self_check".to_string(), "every:60".to_string());
        let resolved = resolve_cadences(&cfg);
        assert_eq!(resolved.get("self_check").unwrap(), "every:60");
    }

    #[test]
    fn resolve_cadences_env_overrides_config() {
        std::env::set_var("DRIVE_SELF_CHECK", "every:30");
        let mut cfg = HashMap::new();
        cfg.insert("self_check".to_string(), "every:60".to_string());
        let resolved = resolve_cadences(&cfg);
        assert_eq!(resolved.get("self_check").unwrap(), "every:30");
        std::env::remove_var("DRIVE_SELF_CHECK");
    }

    #[test]
    fn run_once_is_idle_when_nothing_due() {
        let (_dir, store) = open_store();
        let brake = Brake::load(store.clone(), None).unwrap();
        let outcome = run_once(&store, &brake, 0).unwrap();
        assert_eq!(outcome, DriveOutcome::Idle);
    }

    #[test]
    fn run_once_executes_due_task_and_advances_next_run() {
        let (_dir, store) = open_store();
        let now = chrono::Utc::now().timestamp();
        store.with_connection(|conn| persistence::upsert_scheduled_tasks(conn, &[("self_check".to_string(), "every:900".to_string())], now)).unwrap();

        let brake = Brake::load(store.clone(), None).unwrap();
        let outcome = run_once(&store, &brake, now).unwrap();
        match outcome {
            DriveOutcome::Ran { task_id, .. } => assert_eq!(task_id, "self_check"),
            other => panic!("expected Ran, got {other:?}"),
        }

        let due_again = store.with_connection(|conn| persistence::next_due_task(conn, now)).unwrap();
        assert!(due_again.is_none(), "next_run_ts should have advanced past now");
    }

    #[test]
    fn run_once_skips_already_ticked_idempotency_key() {
        let (_dir, store) = open_store();
        let now = chrono::Utc::now().timestamp();
        store.with_connection(|conn| persistence::upsert_scheduled_tasks(conn, &[("self_check".to_string(), "every:900".to_string())], now)).unwrap();
        store.with_connection(|conn| persistence::insert_tick(conn, "self_check", now, Some(now), true, &format!("self_check:{now}"), None)).unwrap();

        let brake = Brake::load(store.clone(), None).unwrap();
        let outcome = run_once(&store, &brake, now).unwrap();
        assert_eq!(outcome, DriveOutcome::Skipped { task_id: "self_check".to_string() });
    }

    #[test]
    fn run_once_blocked_when_scheduler_scope_engaged() {
        let (_dir, store) = open_store();
        let now = chrono::Utc::now().timestamp();
        store.with_connection(|conn| persistence::upsert_scheduled_tasks(conn, &[("self_check".to_string(), "every:900".to_string())], now)).unwrap();

        let brake = Brake::load(store.clone(), None).unwrap();
        brake.engage(&["scheduler".to_string()]).unwrap();

        let outcome = run_once(&store, &brake, now).unwrap();
        assert_eq!(outcome, DriveOutcome::Blocked { task_id: "self_check".to_string(), scope: "scheduler".to_string() });

        // Blocked ticks still advance next_run_ts so the registry doesn't busy-loop.
        let due_again = store.with_connection(|conn| persistence::next_due_task(conn, now)).unwrap();
        assert!(due_again.is_none());

        // A failed tick is recorded too, so blocked runs show up in history/metrics.
        let ticks = store.with_connection(|conn| persistence::ticks_for_task(conn, "self_check")).unwrap();
        assert_eq!(ticks.len(), 1);
        assert!(!ticks[0].success);
        assert_eq!(ticks[0].result_meta, Some(serde_json::json!({"reason": "brake"})));
    }
}
