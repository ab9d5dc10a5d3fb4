//! Composition root: opens the Store, loads the Brake, and spawns the three
//! cooperative background loops (scheduler, reflection-window, event-consumer).
//! Ported from the kernel's own daemon/process wiring — one Daemon per process,
//! no module-level globals; every loop is handed exactly the state it needs.

use crate::config::Config;
use crate::eventbus::EventBus;
use crate::error::KernelError;
use crate::models::{Command, CommandResult};
use crate::safety::brake::{Brake, StoreAuditSink};
use crate::scheduler::{self, get_system_metrics};
use crate::store::{persistence, Store};
use chrono::{Datelike, TimeZone, Timelike, Utc};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Shared, passed-not-global handle into the running Daemon. Used by the HTTP
/// surface and the CLI's "hit a live daemon" paths alike.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub brake: Brake,
    pub event_bus: EventBus,
    pub config: Arc<Config>,
    pub start_instant: Instant,
    pub last_beat: Arc<RwLock<i64>>,
}

impl AppState {
    pub fn touch_beat(&self) {
        *self.last_beat.write().expect("last_beat lock poisoned") = Utc::now().timestamp();
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_instant.elapsed().as_secs()
    }
}

pub struct Daemon {
    pub state: AppState,
    shutdown_txs: Vec<oneshot::Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Open the Store (schemas + FTS self-heal included in `Store::open_with_tokenizer`),
    /// load the Brake, and spawn every background loop.
    pub fn start(config: Config) -> Result<Self, KernelError> {
        let store = Arc::new(Store::open_with_tokenizer(&config.db_path, &config.retrieval.tokenizer_spec())?);
        let audit = Arc::new(StoreAuditSink::new(store.clone()));
        let brake = Brake::load(store.clone(), Some(audit))?;
        let event_bus = EventBus::new();
        let config = Arc::new(config);

        let now = Utc::now().timestamp();
        let state = AppState {
            store: store.clone(),
            brake: brake.clone(),
            event_bus: event_bus.clone(),
            config: config.clone(),
            start_instant: Instant::now(),
            last_beat: Arc::new(RwLock::new(now)),
        };

        let mut shutdown_txs = Vec::new();
        let mut handles = Vec::new();

        let (tx, rx) = oneshot::channel();
        shutdown_txs.push(tx);
        let scheduler_brake = Arc::new(brake.clone());
        handles.push(tokio::spawn(scheduler::run(store.clone(), scheduler_brake, config.drives.clone(), rx)));

        let (tx, rx) = oneshot::channel();
        shutdown_txs.push(tx);
        handles.push(tokio::spawn(reflection_window_loop(state.clone(), rx)));

        let (tx, rx) = oneshot::channel();
        shutdown_txs.push(tx);
        handles.push(tokio::spawn(event_consumer_loop(state.clone(), rx)));

        Ok(Self { state, shutdown_txs, handles })
    }

    /// Cancel every loop, giving each up to 5s to finish its current iteration,
    /// then close the Store (forces a final truncating checkpoint).
    pub async fn shutdown(self) -> Result<(), KernelError> {
        for tx in self.shutdown_txs {
            let _ = tx.send(());
        }

        for handle in self.handles {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                tracing::warn!("daemon: background loop did not stop within 5s");
            }
        }

        match Arc::try_unwrap(self.state.store) {
            Ok(store) => store.close(),
            Err(_) => {
                tracing::warn!("daemon: store still has outstanding references at shutdown, skipping close");
                Ok(())
            }
        }
    }
}

/// Wakes every 60s; runs the daily journal inside its nightly window, and the
/// weekly audit on its configured weekday+time (60-minute tolerance), each at
/// most once per calendar day.
async fn reflection_window_loop(state: AppState, mut shutdown: oneshot::Receiver<()>) {
    tracing::info!("reflection window loop started");

    loop {
        if shutdown.try_recv().is_ok() {
            break;
        }

        let state = state.clone();
        let outcome = tokio::task::spawn_blocking(move || reflection_window_tick(&state)).await;
        if let Err(e) = outcome {
            tracing::warn!("reflection window loop: tick task panicked: {e}");
        } else if let Ok(Err(e)) = outcome {
            tracing::warn!("reflection window loop: tick failed: {e}");
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(60)) => {}
            _ = &mut shutdown => break,
        }
    }

    tracing::info!("reflection window loop stopped");
}

fn reflection_window_tick(state: &AppState) -> Result<(), KernelError> {
    let tz: chrono_tz::Tz = state.config.timezone.parse().unwrap_or(chrono_tz::UTC);
    let now = Utc::now().with_timezone(&tz);

    if in_nightly_window(&state.config.dreaming.nightly_window, now.hour(), now.minute())
        && !ran_today(state, "daily_journal", &tz)?
    {
        run_reflection(state, Command::ReflectionRunDaily)?;
    }

    if now.weekday().to_string().starts_with(&state.config.dreaming.weekly.weekday[..3.min(state.config.dreaming.weekly.weekday.len())])
        && within_tolerance(&state.config.dreaming.weekly.time, now.hour(), now.minute(), 60)
        && !ran_today(state, "weekly_alignment_audit", &tz)?
    {
        run_reflection(state, Command::ReflectionRunWeekly)?;
    }

    Ok(())
}

fn parse_hhmm(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.split_once(':')?;
    Some((h.parse().ok()?, m.parse().ok()?))
}

/// True when `(hour, minute)` falls in the `"HH:MM-HH:MM"` window, spans-midnight included.
fn in_nightly_window(window: &str, hour: u32, minute: u32) -> bool {
    let Some((start_str, end_str)) = window.split_once('-') else { return false };
    let (Some((sh, sm)), Some((eh, em))) = (parse_hhmm(start_str), parse_hhmm(end_str)) else { return false };

    let now_m = hour * 60 + minute;
    let start_m = sh * 60 + sm;
    let end_m = eh * 60 + em;

    if start_m <= end_m {
        now_m >= start_m && now_m < end_m
    } else {
        now_m >= start_m || now_m < end_m
    }
}

fn within_tolerance(hhmm: &str, hour: u32, minute: u32, tolerance_minutes: i64) -> bool {
    let Some((th, tm)) = parse_hhmm(hhmm) else { return false };
    let now_m = (hour * 60 + minute) as i64;
    let target_m = (th * 60 + tm) as i64;
    (now_m - target_m).abs() <= tolerance_minutes
}

fn ran_today(state: &AppState, kind: &'static str, tz: &chrono_tz::Tz) -> Result<bool, KernelError> {
    let conn = state.store.pool_conn()?;
    let last_ts_s: Option<i64> = conn
        .query_row(
            "SELECT ts_s FROM reflections WHERE kind = ?1 ORDER BY ts_s DESC LIMIT 1",
            [kind],
            |r| r.get(0),
        )
        .ok();

    let Some(last_ts_s) = last_ts_s else { return Ok(false) };
    let last = Utc
        .timestamp_opt(last_ts_s, 0)
        .single()
        .ok_or_else(|| KernelError::Persistence("invalid reflection timestamp".to_string()))?
        .with_timezone(tz);
    let now = Utc::now().with_timezone(tz);

    Ok(last.date_naive() == now.date_naive())
}

fn run_reflection(state: &AppState, cmd: Command) -> Result<(), KernelError> {
    let result = handle_command(state, cmd)?;
    if !result.ok {
        tracing::warn!("reflection command {cmd:?} did not succeed: {}", result.message);
    }
    Ok(())
}

/// Events the Scheduler doesn't touch (e.g. nudges emitted from the chat path)
/// flow through here. Currently just logs; the bus exists so the Daemon has a
/// wiring point for reactive consumers added later.
async fn event_consumer_loop(state: AppState, mut shutdown: oneshot::Receiver<()>) {
    tracing::info!("event consumer loop started");
    let sub = state.event_bus.subscribe("system");

    loop {
        tokio::select! {
            event = sub.recv() => {
                match event {
                    Some(event) => tracing::debug!(?event, "event consumed"),
                    None => break,
                }
            }
            _ = &mut shutdown => break,
        }
    }

    tracing::info!("event consumer loop stopped");
}

/// Dispatch a kernel command from the CLI or the HTTP `/api/command` route.
pub fn handle_command(state: &AppState, cmd: Command) -> Result<CommandResult, KernelError> {
    let now = Utc::now().timestamp();

    match cmd {
        Command::WaterLog250 | Command::WaterLog500 => {
            let amount = if matches!(cmd, Command::WaterLog250) { "250ml" } else { "500ml" };
            state.store.with_connection(|conn| {
                persistence::insert_memory(conn, "hydration", &now.to_string(), amount, None, now)
            })?;
            Ok(CommandResult { ok: true, message: format!("logged {amount}") })
        }
        Command::ReflectionRunDaily => {
            let metrics = get_system_metrics(&state.store)?;
            let content = format!(
                "# Daily Journal\n\n{date}\n\nSystem health snapshot:\n- Database: {db}\n- Pending nudges: {pending}\n- Last daily reflection: {last}\n",
                date = Utc::now().format("%Y-%m-%d"),
                db = if metrics.db_ok { "OK" } else { "Error" },
                pending = metrics.pending_nudges,
                last = metrics.last_daily_reflection_ts.map(|t| t.to_string()).unwrap_or_else(|| "None".to_string()),
            );
            let meta = serde_json::to_value(&metrics).unwrap_or(serde_json::Value::Null);
            state.store.with_connection(|conn| persistence::insert_reflection(conn, "daily_journal", &content, &meta, now, false))?;

            let date = Utc::now().format("%Y-%m-%d").to_string();
            export_reflection("exports/sessions", &format!("{date}.md"), &content);

            Ok(CommandResult { ok: true, message: "daily journal recorded".to_string() })
        }
        Command::ReflectionRunWeekly => {
            let metrics = get_system_metrics(&state.store)?;
            let now_dt = Utc::now();
            let (year, week) = iso_week(&now_dt);
            let content = format!(
                "# Weekly Alignment Audit\n\nWeek {year}-{week:02}\n\nSystem health snapshot:\n- Database: {db}\n- Pending nudges: {pending}\n",
                db = if metrics.db_ok { "OK" } else { "Error" },
                pending = metrics.pending_nudges,
            );
            let meta = serde_json::to_value(&metrics).unwrap_or(serde_json::Value::Null);
            state.store.with_connection(|conn| persistence::insert_reflection(conn, "weekly_alignment_audit", &content, &meta, now, false))?;

            export_reflection("exports/audit_logs", &format!("week-{year}-{week:02}.md"), &content);

            Ok(CommandResult { ok: true, message: "weekly audit recorded".to_string() })
        }
    }
}

fn iso_week(dt: &chrono::DateTime<Utc>) -> (i32, u32) {
    let iso = dt.iso_week();
    (iso.year(), iso.week())
}

/// Best-effort export of a reflection's markdown to disk. A failure here must
/// never roll back the already-committed Reflection row, so errors are logged
/// and swallowed.
fn export_reflection(dir: &str, filename: &str, content: &str) {
    if let Err(e) = std::fs::create_dir_all(dir) {
        tracing::warn!("reflection export: could not create {dir}: {e}");
        return;
    }
    let path = std::path::Path::new(dir).join(filename);
    if let Err(e) = std::fs::write(&path, content) {
        tracing::warn!("reflection export: could not write {}: {e}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NudgeStatus;
    use crate::store::persistence;

    // §8 end-to-end scenario: with a sped-up cadence, ticks for every built-in
    // drive and a pending curiosity nudge should both show up well within the
    // 12s wall-clock budget the spec names, and acking a nudge sticks.
    #[tokio::test]
    async fn end_to_end_scenario_ticks_and_nudges_within_wall_clock_budget() {
        std::env::set_var("BARTH_SPEED_FACTOR", "0.01");

        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.db_path = dir.path().join("barth.db");
        let daemon = Daemon::start(config).unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;

        for drive in ["self_check", "curiosity_probe", "reflection_micro"] {
            let ticks = daemon.state.store.with_connection(|conn| persistence::ticks_for_task(conn, drive)).unwrap();
            assert!(!ticks.is_empty(), "{drive} should have ticked at least once");
        }

        let pending = {
            let conn = daemon.state.store.pool_conn().unwrap();
            persistence::list_pending_nudges(&conn, 50).unwrap()
        };
        let curiosity_nudge = pending.iter().find(|n| n.kind == "curiosity").expect("a pending curiosity nudge");
        assert_eq!(curiosity_nudge.status, NudgeStatus::Pending);

        let acked = daemon
            .state
            .store
            .with_connection(|conn| {
                persistence::set_nudge_status(conn, curiosity_nudge.id, NudgeStatus::Acked, Utc::now().timestamp())
            })
            .unwrap()
            .expect("nudge still exists after status update");
        assert_eq!(acked.status, NudgeStatus::Acked);
        assert!(acked.acted_ts_s.is_some());

        std::env::remove_var("BARTH_SPEED_FACTOR");
        daemon.shutdown().await.unwrap();
    }
}
