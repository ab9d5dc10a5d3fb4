//! Prometheus-style text exposition: `kernel_uptime_seconds` (gauge) and
//! `kernel_ticks_total{drive=...}` (counter, one label value per drive ever
//! observed). No external metrics crate - the surface is two numbers, hand
//! formatted, matching the ambient-stack's "thin but real" directive.

use crate::daemon::AppState;
use crate::error::KernelError;

pub fn render(state: &AppState) -> Result<String, KernelError> {
    let conn = state.store.pool_conn()?;

    let mut stmt = conn
        .prepare("SELECT task_id, COUNT(*) FROM ticks GROUP BY task_id ORDER BY task_id")
        .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?;

    let rows: Vec<(String, i64)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| KernelError::StoreUnavailable(e.to_string()))?;

    let mut out = String::new();
    out.push_str("# HELP kernel_uptime_seconds Seconds since the daemon started.\n");
    out.push_str("# TYPE kernel_uptime_seconds gauge\n");
    out.push_str(&format!("kernel_uptime_seconds {}\n", state.uptime_seconds()));

    out.push_str("# HELP kernel_ticks_total Total drive ticks recorded, by drive.\n");
    out.push_str("# TYPE kernel_ticks_total counter\n");
    for (drive, count) in rows {
        out.push_str(&format!("kernel_ticks_total{{drive=\"{drive}\"}} {count}\n"));
    }

    Ok(out)
}
