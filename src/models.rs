//! Shared data-model types that flow between the store, the scheduler, drives and the
//! HTTP surface. Kept separate from `store` so drives can depend on the shapes without
//! pulling in rusqlite row-mapping code.

use serde::{Deserialize, Serialize};

/// A single user-visible suggestion emitted by a drive or the chat path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nudge {
    pub id: i64,
    pub kind: String,
    pub message: String,
    pub actions: Vec<NudgeAction>,
    pub reason: String,
    pub created_ts: String,
    pub created_ts_s: i64,
    pub acted_ts: Option<String>,
    pub acted_ts_s: Option<i64>,
    pub status: NudgeStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NudgeAction {
    pub label: String,
    pub cmd: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NudgeStatus {
    Pending,
    Acked,
    Dismissed,
}

impl NudgeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NudgeStatus::Pending => "pending",
            NudgeStatus::Acked => "acked",
            NudgeStatus::Dismissed => "dismissed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(NudgeStatus::Pending),
            "acked" => Some(NudgeStatus::Acked),
            "dismissed" => Some(NudgeStatus::Dismissed),
            _ => None,
        }
    }
}

/// Output of a drive: a nudge to surface, or nothing.
pub struct NewNudge {
    pub kind: String,
    pub message: String,
    pub actions: Vec<NudgeAction>,
    pub reason: String,
}

/// A markdown journal entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reflection {
    pub id: i64,
    pub kind: String,
    pub content: String,
    pub meta: serde_json::Value,
    pub ts: String,
    pub ts_s: i64,
    pub pinned: bool,
}

/// A memory row, the unit the FTS index is built over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: i64,
    pub kind: String,
    pub key: String,
    pub value: String,
    pub summary: Option<String>,
    pub ts: String,
    pub ts_s: i64,
}

/// One execution attempt of a drive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub id: i64,
    pub task_id: String,
    pub started_ts: i64,
    pub finished_ts: Option<i64>,
    pub success: bool,
    pub idempotency_key: String,
    pub result_meta: Option<serde_json::Value>,
}

/// Row-level bookkeeping for a single registered drive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub cadence: String,
    pub next_run_ts: i64,
    pub last_run_ts: Option<i64>,
    pub window_state: Option<serde_json::Value>,
}

/// System health metrics as observed by the `self_check` drive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub db_ok: bool,
    pub db_size_bytes: u64,
    pub pending_nudges: i64,
    pub last_daily_reflection_ts: Option<i64>,
}

/// A kernel command dispatched from the CLI or the HTTP `/api/command` route.
/// Peripheral per the source's own Open Questions: `water_log_*` carry no
/// drift/nudge logic, just a state update and an audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    WaterLog250,
    WaterLog500,
    ReflectionRunDaily,
    ReflectionRunWeekly,
}

impl Command {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "water_log_250" => Some(Command::WaterLog250),
            "water_log_500" => Some(Command::WaterLog500),
            "reflection_run_daily" => Some(Command::ReflectionRunDaily),
            "reflection_run_weekly" => Some(Command::ReflectionRunWeekly),
            _ => None,
        }
    }
}

/// Result of dispatching a [`Command`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub ok: bool,
    pub message: String,
}

/// A drift condition detected from `SystemMetrics`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Drift {
    DatabaseUnreachable,
    HighPendingNudges(i64),
    StaleDailyReflection(i64),
}

impl Drift {
    pub fn as_tag(&self) -> String {
        match self {
            Drift::DatabaseUnreachable => "database_unreachable".to_string(),
            Drift::HighPendingNudges(n) => format!("high_pending_nudges:{n}"),
            Drift::StaleDailyReflection(hours) => format!("stale_daily_reflection:{hours}h"),
        }
    }
}
