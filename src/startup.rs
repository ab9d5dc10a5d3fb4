// Startup module - displays the kernel's boot banner
//
// Shows version info, config file status, resolved drive cadences, and brake
// state before the daemon starts serving.

use crate::config::{Config, VERSION};
use crate::safety::brake::Brake;
use crate::scheduler;
use std::collections::HashMap;

/// ANSI color codes for terminal output
mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const CYAN: &str = "\x1b[36m";
    pub const GREEN: &str = "\x1b[32m";
    pub const YELLOW: &str = "\x1b[33m";
}

/// Print the startup banner to stdout before the daemon takes over logging.
pub fn print_startup(config: &Config, brake: &Brake) {
    use colors::*;

    println!();
    println!("  {BOLD}{CYAN}barth{RESET} {DIM}v{VERSION}{RESET}");
    println!("  {DIM}personal autonomy kernel{RESET}");
    println!();

    if let Some(path) = Config::config_path() {
        if path.exists() {
            println!("  {DIM}Config:{RESET} {GREEN}✓{RESET} {}", path.display());
        } else {
            println!("  {DIM}Config:{RESET} {DIM}(using defaults){RESET}");
        }
    }
    println!("  {DIM}Store:{RESET}  {}", config.db_path.display());
    println!();

    println!("  {DIM}Drives (resolved cadence):{RESET}");
    let resolved = scheduler::resolve_cadences(&config.drives);
    let mut ids: Vec<&String> = resolved.keys().collect();
    ids.sort();
    for id in ids {
        println!("    {GREEN}✓{RESET} {:<18} {DIM}{}{RESET}", id, resolved[id]);
    }
    println!();

    let state = brake.state();
    if state.engaged {
        let scopes: Vec<_> = state.scopes.iter().cloned().collect();
        println!("  {YELLOW}▸{RESET} {YELLOW}brake engaged{RESET} {DIM}({}){RESET}", scopes.join(", "));
    } else {
        println!("  {GREEN}▸{RESET} brake disengaged");
    }

    println!("  {DIM}▸{RESET} Admin surface listening on {BOLD}{}{RESET}", config.bind_addr);
    println!();
}

/// Mirror of [`print_startup`] through `tracing`, for the case where stdout
/// isn't a terminal a human is watching (log aggregators, systemd journal).
pub fn log_startup(config: &Config, brake: &Brake) {
    tracing::info!("barth v{} starting", VERSION);
    tracing::info!("store: {}", config.db_path.display());

    let resolved: HashMap<String, String> = scheduler::resolve_cadences(&config.drives);
    for (id, cadence) in &resolved {
        tracing::info!("drive {id}: {cadence}");
    }

    let state = brake.state();
    tracing::info!(engaged = state.engaged, scopes = ?state.scopes, "brake state");
    tracing::info!("admin surface listening on {}", config.bind_addr);
}
