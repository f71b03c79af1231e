use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "stash",
    about = "Stash — synced mirror of ledger table state",
    version,
    propagate_version = true,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the tables a config resolves to, with their resource ids.
    Tables {
        /// Path to stash.toml
        #[arg(short, long, default_value = "stash.toml")]
        config: PathBuf,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Hydrate an in-memory store from a fixture log and print its records.
    ///
    /// The log is a JSON array of raw log entries. With --snapshot, the
    /// store is seeded from a JSON snapshot and only later blocks are
    /// replayed.
    Replay {
        #[arg(short, long, default_value = "stash.toml")]
        config: PathBuf,
        /// JSON array of raw log entries
        #[arg(short, long)]
        log: PathBuf,
        /// JSON snapshot to seed the store from
        #[arg(short, long)]
        snapshot: Option<PathBuf>,
        /// Stop catch-up at this block instead of the last logged one
        #[arg(long)]
        head: Option<u64>,
        /// Write a snapshot of the hydrated store to this path
        #[arg(long)]
        save_snapshot: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,stash=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Tables { config, format } => commands::tables::tables(&config, &format),
        Commands::Replay {
            config,
            log,
            snapshot,
            head,
            save_snapshot,
        } => {
            commands::replay::replay(commands::replay::ReplayArgs {
                config,
                log,
                snapshot,
                head,
                save_snapshot,
            })
            .await
        }
    }
}
