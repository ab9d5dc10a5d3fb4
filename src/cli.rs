// CLI module - command-line argument parsing and handlers
//
// Subcommands:
// - brake on/off/status: inspect or toggle the parking brake without starting the daemon
// - embeddings stats/rebuild-vss: inspect the FTS index or (not supported) a vector index
//
// Running with no subcommand starts the daemon (see main.rs).

use crate::config::{Config, VERSION};
use crate::safety::brake::Brake;
use crate::store::Store;
use clap::{Parser, Subcommand};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "barth")]
#[command(version = VERSION)]
#[command(about = "Personal autonomy kernel", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect or toggle the parking brake
    Brake {
        #[command(subcommand)]
        action: BrakeAction,
    },
    /// Inspect the retrieval index
    Embeddings {
        #[command(subcommand)]
        action: EmbeddingsAction,
    },
}

#[derive(Subcommand)]
pub enum BrakeAction {
    /// Engage the brake (optionally scoped; defaults to `global`)
    On {
        /// Scope to block, repeatable, e.g. `--scope scheduler --scope skills`. Omitted means `global`.
        #[arg(long = "scope")]
        scope: Vec<String>,
    },
    /// Disengage the brake
    Off,
    /// Print the current brake state
    Status,
}

#[derive(Subcommand)]
pub enum EmbeddingsAction {
    /// Print FTS index size and tokenizer configuration
    Stats,
    /// Rebuild a vector similarity index (not supported by this build)
    RebuildVss,
}

/// Handle CLI commands. Returns true if a command was handled (exit after).
pub fn handle_cli() -> bool {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Brake { action }) => {
            handle_brake(action);
            true
        }
        Some(Commands::Embeddings { action }) => {
            handle_embeddings(action);
            true
        }
        None => false, // No subcommand, run the daemon
    }
}

fn open_store_and_brake() -> (Arc<Store>, Brake) {
    let config = Config::from_env();
    let store = match Store::open_with_tokenizer(&config.db_path, &config.retrieval.tokenizer_spec()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("Error: could not open store at {}: {e}", config.db_path.display());
            std::process::exit(1);
        }
    };
    let brake = match Brake::load(store.clone(), None) {
        Ok(brake) => brake,
        Err(e) => {
            eprintln!("Error: could not load brake state: {e}");
            std::process::exit(1);
        }
    };
    (store, brake)
}

fn handle_brake(action: BrakeAction) {
    let (_store, brake) = open_store_and_brake();

    let state = match action {
        BrakeAction::On { scope } => match brake.engage(&scope) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("Error engaging brake: {e}");
                std::process::exit(1);
            }
        },
        BrakeAction::Off => match brake.disengage() {
            Ok(s) => s,
            Err(e) => {
                eprintln!("Error disengaging brake: {e}");
                std::process::exit(1);
            }
        },
        BrakeAction::Status => brake.state(),
    };

    let scopes: Vec<_> = state.scopes.iter().cloned().collect();
    let payload = serde_json::json!({"engaged": state.engaged, "scopes": scopes});
    println!("{payload}");
}

fn handle_embeddings(action: EmbeddingsAction) {
    match action {
        EmbeddingsAction::Stats => {
            let config = Config::from_env();
            let store = match Store::open_with_tokenizer(&config.db_path, &config.retrieval.tokenizer_spec()) {
                Ok(store) => store,
                Err(e) => {
                    eprintln!("Error: could not open store at {}: {e}", config.db_path.display());
                    std::process::exit(1);
                }
            };

            let conn = match store.pool_conn() {
                Ok(conn) => conn,
                Err(e) => {
                    eprintln!("Error: {e}");
                    std::process::exit(1);
                }
            };

            let memory_count: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0)).unwrap_or(0);
            let indexed_count: i64 = conn.query_row("SELECT COUNT(*) FROM memory_fts_map", [], |r| r.get(0)).unwrap_or(0);

            println!("tokenizer: {}", config.retrieval.tokenizer_spec());
            println!("memories: {memory_count}");
            println!("indexed: {indexed_count}");
        }
        EmbeddingsAction::RebuildVss => {
            eprintln!("Error: vector similarity search (vss0) is not compiled into this build.");
            eprintln!("This binary only ships the bundled FTS5 full-text index; use `barth embeddings stats` instead.");
            std::process::exit(1);
        }
    }
}
