//! Drive functions and registry (kernel's `scheduler/drives.py` + `health.py`).
//!
//! A drive is a small unit of autonomous behaviour run on its own cadence: check
//! system health, occasionally nudge the user toward reflection, record a
//! micro-reflection, or tidy the FTS index. Drives see the store only through
//! [`DriveContext`] rather than the full `Store`/`Brake`/event-bus surface, so a
//! drive can't reach for capabilities it has no cadence-registered business using.

use crate::error::KernelError;
use crate::models::{Drift, NewNudge, SystemMetrics};
use chrono::Utc;

/// Capabilities a drive is allowed to use. Narrower than the full daemon
/// composition root on purpose: a drive should not be able to engage the brake,
/// publish arbitrary events, or read other drives' tick history.
pub trait DriveContext {
    fn system_metrics(&self) -> Result<SystemMetrics, KernelError>;
    fn insert_reflection(
        &self,
        kind: &str,
        content: &str,
        meta: &serde_json::Value,
        ts_s: i64,
        pinned: bool,
    ) -> Result<i64, KernelError>;
    fn insert_memory(&self, kind: &str, key: &str, value: &str, summary: Option<&str>) -> Result<i64, KernelError>;
    fn fts_optimize(&self) -> Result<(), KernelError>;
}

pub fn check_drift(metrics: &SystemMetrics) -> Option<Drift> {
    if !metrics.db_ok {
        return Some(Drift::DatabaseUnreachable);
    }

    if metrics.pending_nudges > 20 {
        return Some(Drift::HighPendingNudges(metrics.pending_nudges));
    }

    if let Some(last_daily) = metrics.last_daily_reflection_ts {
        let now = Utc::now().timestamp();
        let hours_since = (now - last_daily) / 3600;
        if hours_since > 36 {
            return Some(Drift::StaleDailyReflection(hours_since));
        }
    }

    None
}

pub fn self_check(ctx: &dyn DriveContext) -> Result<Option<NewNudge>, KernelError> {
    let metrics = ctx.system_metrics()?;
    let drift = check_drift(&metrics);

    Ok(drift.map(|d| NewNudge {
        kind: "system_health".to_string(),
        message: format!("System drift detected: {}", d.as_tag()),
        actions: vec![],
        reason: "self_check_drift".to_string(),
    }))
}

const CURIOSITY_PROMPTS: &[&str] = &[
    "What's one thing you learned today?",
    "How are you feeling right now?",
    "Any highlights from today worth remembering?",
];

pub fn curiosity_probe(_ctx: &dyn DriveContext) -> Result<Option<NewNudge>, KernelError> {
    let now = Utc::now().timestamp();
    let idx = ((now / 3600) as usize) % CURIOSITY_PROMPTS.len();

    Ok(Some(NewNudge {
        kind: "curiosity".to_string(),
        message: CURIOSITY_PROMPTS[idx].to_string(),
        actions: vec![
            crate::models::NudgeAction { label: "Reflect".to_string(), cmd: "open_journal".to_string() },
            crate::models::NudgeAction { label: "Later".to_string(), cmd: "dismiss".to_string() },
        ],
        reason: "curiosity_probe".to_string(),
    }))
}

pub fn reflection_micro(ctx: &dyn DriveContext) -> Result<Option<NewNudge>, KernelError> {
    let metrics = ctx.system_metrics()?;

    let content = format!(
        "# Micro-Reflection\n\nSystem health snapshot:\n- Database: {}\n- Pending nudges: {}\n- Last daily reflection: {}\n\nStatus: Autonomy loop active\n",
        if metrics.db_ok { "OK" } else { "Error" },
        metrics.pending_nudges,
        metrics
            .last_daily_reflection_ts
            .map(|t| t.to_string())
            .unwrap_or_else(|| "None".to_string()),
    );

    let meta = serde_json::to_value(&metrics).unwrap_or(serde_json::Value::Null);
    let now = Utc::now().timestamp();

    if let Err(e) = ctx.insert_reflection("micro_reflection", &content, &meta, now, false) {
        tracing::warn!("error inserting micro-reflection: {e}");
    }

    Ok(None)
}

pub fn fts_optimize(ctx: &dyn DriveContext) -> Result<Option<NewNudge>, KernelError> {
    if let Err(e) = ctx.fts_optimize() {
        tracing::warn!("error optimizing fts index: {e}");
    } else {
        tracing::info!("fts index optimized");
    }
    Ok(None)
}

/// A drive's function pointer plus its default cadence, keyed by the
/// `scheduled_tasks.id` the Scheduler registers it under.
pub struct DriveEntry {
    pub id: &'static str,
    pub default_cadence: &'static str,
    pub run: fn(&dyn DriveContext) -> Result<Option<NewNudge>, KernelError>,
}

pub fn registry() -> Vec<DriveEntry> {
    vec![
        DriveEntry { id: "self_check", default_cadence: "every:900", run: self_check },
        DriveEntry { id: "curiosity_probe", default_cadence: "window:3600:2", run: curiosity_probe },
        DriveEntry { id: "reflection_micro", default_cadence: "every:7200", run: reflection_micro },
        DriveEntry { id: "fts_optimize", default_cadence: "every:604800", run: fts_optimize },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeCtx {
        metrics: SystemMetrics,
        fts_calls: std::cell::Cell<u32>,
    }

    impl DriveContext for FakeCtx {
        fn system_metrics(&self) -> Result<SystemMetrics, KernelError> {
            Ok(self.metrics.clone())
        }
        fn insert_reflection(
            &self,
            _kind: &str,
            _content: &str,
            _meta: &serde_json::Value,
            _ts_s: i64,
            _pinned: bool,
        ) -> Result<i64, KernelError> {
            Ok(1)
        }
        fn insert_memory(&self, _kind: &str, _key: &str, _value: &str, _summary: Option<&str>) -> Result<i64, KernelError> {
            Ok(1)
        }
        fn fts_optimize(&self) -> Result<(), KernelError> {
            self.fts_calls.set(self.fts_calls.get() + 1);
            Ok(())
        }
    }

    #[test]
    fn check_drift_flags_unreachable_db() {
        let metrics = SystemMetrics { db_ok: false, ..Default::default() };
        assert_eq!(check_drift(&metrics), Some(Drift::DatabaseUnreachable));
    }

    #[test]
    fn check_drift_flags_high_pending_nudges() {
        let metrics = SystemMetrics { db_ok: true, pending_nudges: 21, ..Default::default() };
        assert_eq!(check_drift(&metrics), Some(Drift::HighPendingNudges(21)));
    }

    #[test]
    fn check_drift_healthy_when_nominal() {
        let metrics = SystemMetrics {
            db_ok: true,
            pending_nudges: 3,
            last_daily_reflection_ts: Some(Utc::now().timestamp()),
            ..Default::default()
        };
        assert_eq!(check_drift(&metrics), None);
    }

    #[test]
    fn self_check_emits_nudge_on_drift() {
        let ctx = FakeCtx { metrics: SystemMetrics { db_ok: false, ..Default::default() }, fts_calls: std::cell::Cell::new(0) };
        let nudge = self_check(&ctx).unwrap();
        assert!(nudge.is_some());
        assert_eq!(nudge.unwrap().kind, "system_health");
    }

    #[test]
    fn self_check_silent_when_healthy() {
        let ctx = FakeCtx {
            metrics: SystemMetrics { db_ok: true, pending_nudges: 0, last_daily_reflection_ts: Some(Utc::now().timestamp()), ..Default::default() },
            fts_calls: std::cell::Cell::new(0),
        };
        assert!(self_check(&ctx).unwrap().is_none());
    }

    #[test]
    fn fts_optimize_drive_calls_through_and_emits_no_nudge() {
        let ctx = FakeCtx { metrics: SystemMetrics::default(), fts_calls: std::cell::Cell::new(0) };
        let nudge = fts_optimize(&ctx).unwrap();
        assert!(nudge.is_none());
        assert_eq!(ctx.fts_calls.get(), 1);
    }
}
