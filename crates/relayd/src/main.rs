// ABOUTME: relayd CLI entry point.
// ABOUTME: Provides init, serve, and worker subcommands.

use clap::{Parser, Subcommand};
use relayd::{run_init, run_serve, run_worker, ServeOptions, WorkerOptions, RELAY_ENV};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "relayd")]
#[command(about = "Spawns worker processes and pairs each with its socket relay")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Where to write it (defaults to ~/.config/relayd/relayd.toml)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Run the host: bind the relay endpoint and spawn the worker pool
    Serve {
        /// Path to configuration file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Number of workers (overrides the config file)
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Run a single worker (internal, spawned by the host)
    Worker {
        /// Relay endpoint to connect back to
        #[arg(long, env = RELAY_ENV)]
        relay: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (ignore errors if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { config, force } => {
            relayd_log::init();
            run_init(config, force)
        }
        Commands::Serve { config, workers } => {
            relayd_log::init();
            run_serve(ServeOptions {
                config_path: config,
                num_workers: workers,
            })
            .await
        }
        Commands::Worker { relay } => {
            relayd_log::init_for("relayd");
            run_worker(WorkerOptions { relay }).await
        }
    }
}
