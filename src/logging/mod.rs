//! Ambient structured logging: `tracing` + `tracing-subscriber`, with an
//! optional rotating file layer via `tracing-appender`. No in-memory buffer -
//! this binary has no screen to protect from scrollback, so logs go straight to
//! stderr (and, if configured, a log file) the way any headless service does it.

use crate::config::{LogRotation, LoggingConfig};
use tracing_subscriber::{fmt, EnvFilter};

/// Guard returned by file-layer initialization. Must be held for the process
/// lifetime or the background writer thread is dropped and buffered lines are
/// lost on exit.
pub struct LoggingGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

fn env_filter(level: &str) -> EnvFilter {
    // RUST_LOG, if set, always wins; otherwise fall back to config's level.
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initialize the global tracing subscriber. Call once, at process start,
/// before anything logs.
pub fn init(config: &LoggingConfig) -> LoggingGuard {
    if !config.file_enabled {
        tracing_subscriber::fmt().with_env_filter(env_filter(&config.level)).with_target(true).init();
        return LoggingGuard { _file_guard: None };
    }

    if let Err(e) = std::fs::create_dir_all(&config.file_dir) {
        eprintln!("warning: could not create log directory {}: {e}", config.file_dir.display());
        tracing_subscriber::fmt().with_env_filter(env_filter(&config.level)).with_target(true).init();
        return LoggingGuard { _file_guard: None };
    }

    let rotation = match config.file_rotation {
        LogRotation::Hourly => tracing_appender::rolling::hourly(&config.file_dir, &config.file_prefix),
        LogRotation::Daily => tracing_appender::rolling::daily(&config.file_dir, &config.file_prefix),
        LogRotation::Never => tracing_appender::rolling::never(&config.file_dir, &config.file_prefix),
    };
    let (non_blocking, guard) = tracing_appender::non_blocking(rotation);

    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(env_filter(&config.level))
        .with(stderr_layer)
        .with(file_layer)
        .init();

    LoggingGuard { _file_guard: Some(guard) }
}
