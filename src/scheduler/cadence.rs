//! Cadence parsing and next-run-timestamp calculation.
//!
//! Two cadence shapes, ported from the kernel's `scheduler/cadence.py`:
//! - `every:<seconds>` - run every N seconds, scaled by a speed factor and jittered
//! - `window:<window_seconds>:<max_runs>` - run K times evenly spaced within a window W
//!
//! Both branches are pure given their inputs (the jitter draw is the one exception,
//! and it's isolated behind [`compute_next_run_with_jitter`] so tests can pin it).

use crate::error::KernelError;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Every(i64),
    Window(i64, i64),
}

fn speed_factor() -> f64 {
    std::env::var("BARTH_SPEED_FACTOR")
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .map(|f| f.max(0.001))
        .unwrap_or(1.0)
}

pub fn parse(cadence_str: &str) -> Result<Cadence, KernelError> {
    if cadence_str.is_empty() {
        return Err(KernelError::InvalidCadence("cadence string cannot be empty".to_string()));
    }

    let parts: Vec<&str> = cadence_str.split(':').collect();

    match parts[0] {
        "every" => {
            if parts.len() != 2 {
                return Err(KernelError::InvalidCadence(format!("invalid 'every' cadence: {cadence_str}")));
            }
            let seconds: i64 = parts[1]
                .parse()
                .map_err(|_| KernelError::InvalidCadence(format!("invalid 'every' cadence seconds: {}", parts[1])))?;
            if seconds <= 0 {
                return Err(KernelError::InvalidCadence(format!("cadence seconds must be positive: {seconds}")));
            }
            Ok(Cadence::Every(seconds))
        }
        "window" => {
            if parts.len() != 3 {
                return Err(KernelError::InvalidCadence(format!("invalid 'window' cadence: {cadence_str}")));
            }
            let window_s: i64 = parts[1]
                .parse()
                .map_err(|_| KernelError::InvalidCadence(format!("invalid 'window' cadence params: {}, {}", parts[1], parts[2])))?;
            let max_runs: i64 = parts[2]
                .parse()
                .map_err(|_| KernelError::InvalidCadence(format!("invalid 'window' cadence params: {}, {}", parts[1], parts[2])))?;
            if window_s <= 0 || max_runs <= 0 {
                return Err(KernelError::InvalidCadence("window seconds and max_runs must be positive".to_string()));
            }
            Ok(Cadence::Window(window_s, max_runs))
        }
        other => Err(KernelError::InvalidCadence(format!("unknown cadence type: {other}"))),
    }
}

/// Compute the next run timestamp and updated window state for a task.
///
/// `scheduled_ts` is accepted for signature parity with the tick record it's derived
/// from but isn't consulted by either branch; `every` schedules relative to
/// `last_run_ts`, not the previous scheduled time, to avoid compounding drift.
pub fn compute_next_run(
    last_run_ts: Option<i64>,
    scheduled_ts: Option<i64>,
    cadence_str: &str,
    now_ts: i64,
    window_state: Option<&serde_json::Value>,
) -> Result<(i64, Option<serde_json::Value>), KernelError> {
    compute_next_run_with_jitter(last_run_ts, scheduled_ts, cadence_str, now_ts, window_state, draw_jitter)
}

fn draw_jitter(bound: i64) -> i64 {
    use rand::Rng;
    if bound <= 0 {
        return 0;
    }
    rand::thread_rng().gen_range(-bound..=bound)
}

/// Same as [`compute_next_run`] but with the jitter draw injected, so tests can pass
/// `|_| 0` and assert exact timestamps.
pub fn compute_next_run_with_jitter(
    last_run_ts: Option<i64>,
    _scheduled_ts: Option<i64>,
    cadence_str: &str,
    now_ts: i64,
    window_state: Option<&serde_json::Value>,
    jitter_fn: impl Fn(i64) -> i64,
) -> Result<(i64, Option<serde_json::Value>), KernelError> {
    match parse(cadence_str)? {
        Cadence::Every(seconds) => {
            let seconds = (seconds as f64 * speed_factor()).max(1.0) as i64;
            let jitter = (seconds as f64 * 0.05).max(1.0) as i64;
            let delta = (seconds + jitter_fn(jitter)).max(1);

            let next_ts = match last_run_ts {
                None => now_ts + delta,
                Some(last) => last + delta,
            };
            Ok((next_ts, None))
        }
        Cadence::Window(window_s, max_runs) => {
            let window_s = (window_s as f64 * speed_factor()).max(1.0) as i64;

            let mut window_start = window_state
                .and_then(|v| v.get("window_start_ts"))
                .and_then(|v| v.as_i64())
                .unwrap_or(now_ts);
            let mut runs_in_window = window_state
                .and_then(|v| v.get("runs_in_window"))
                .and_then(|v| v.as_i64())
                .unwrap_or(0);

            if last_run_ts.is_none() || (now_ts - window_start) >= window_s {
                window_start = now_ts;
                runs_in_window = 0;
            }

            if runs_in_window >= max_runs {
                window_start += window_s;
                runs_in_window = 0;
            }

            let interval = window_s / max_runs;
            let next_ts = (window_start + runs_in_window * interval).max(now_ts);

            let new_state = json!({
                "window_start_ts": window_start,
                "runs_in_window": runs_in_window + 1,
            });

            Ok((next_ts, Some(new_state)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_first_run_schedules_from_now_no_jitter() {
        let (next, state) = compute_next_run_with_jitter(None, None, "every:900", 1000, None, |_| 0).unwrap();
        assert_eq!(next, 1900);
        assert!(state.is_none());
    }

    #[test]
    fn every_subsequent_run_schedules_from_last_run_not_now() {
        let (next, _) = compute_next_run_with_jitter(Some(1000), Some(1900), "every:900", 2000, None, |_| 0).unwrap();
        assert_eq!(next, 2800);
    }

    #[test]
    fn every_jitter_stays_within_five_percent_bound() {
        let (next, _) = compute_next_run(Some(1000), None, "every:900", 1000 + 900, None).unwrap();
        // jitter bound is max(1, 900*0.05) = 45
        assert!((1000 + 900 - 45..=1000 + 900 + 45).contains(&next));
    }

    #[test]
    fn window_evenly_spaces_k_runs_across_w() {
        let (next1, state1) =
            compute_next_run_with_jitter(None, None, "window:3600:2", 0, None, |_| 0).unwrap();
        assert_eq!(next1, 0);

        let (next2, state2) = compute_next_run_with_jitter(Some(0), None, "window:3600:2", 10, state1.as_ref(), |_| 0).unwrap();
        assert_eq!(next2, 1800);

        let (next3, _) = compute_next_run_with_jitter(Some(1800), None, "window:3600:2", 1800, state2.as_ref(), |_| 0).unwrap();
        // runs_in_window reached max_runs, window advances by W
        assert_eq!(next3, 3600);
    }

    #[test]
    fn window_resets_after_expiry() {
        let (_, state1) = compute_next_run_with_jitter(None, None, "window:100:2", 0, None, |_| 0).unwrap();
        let (next, _) = compute_next_run_with_jitter(Some(0), None, "window:100:2", 500, state1.as_ref(), |_| 0).unwrap();
        // window expired long ago, fresh window starts at now_ts=500
        assert_eq!(next, 500);
    }

    #[test]
    fn rejects_malformed_cadence_strings() {
        assert!(parse("").is_err());
        assert!(parse("every:").is_err());
        assert!(parse("every:-5").is_err());
        assert!(parse("window:100").is_err());
        assert!(parse("bogus:1").is_err());
    }
}
