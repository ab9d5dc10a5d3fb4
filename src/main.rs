mod cli;
mod config;
mod daemon;
mod error;
mod eventbus;
mod http;
mod logging;
mod models;
mod safety;
mod scheduler;
mod startup;
mod store;
mod util;

use anyhow::{Context, Result};
use daemon::Daemon;

#[tokio::main]
async fn main() -> Result<()> {
    // CLI subcommands (brake, embeddings) run standalone and exit without
    // starting the daemon.
    if cli::handle_cli() {
        return Ok(());
    }

    config::Config::ensure_config_exists();
    let config = config::Config::from_env();

    let _logging_guard = logging::init(&config.logging);

    let daemon = Daemon::start(config).context("failed to start daemon")?;

    startup::print_startup(&daemon.state.config, &daemon.state.brake);
    startup::log_startup(&daemon.state.config, &daemon.state.brake);

    let (http_shutdown_tx, http_shutdown_rx) = tokio::sync::oneshot::channel();
    let http_state = daemon.state.clone();
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http::serve(http_state, http_shutdown_rx).await {
            tracing::error!("admin surface exited with error: {e}");
        }
    });

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl_c")?;
    tracing::info!("shutdown signal received");

    let _ = http_shutdown_tx.send(());
    let _ = http_handle.await;

    daemon.shutdown().await.context("error during daemon shutdown")?;

    Ok(())
}
