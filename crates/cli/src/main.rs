//! `stash`: stage content locally, sync it to the remote and keep a bounded
//! cache of what the remote suggests.

mod backend;
mod commands;
mod error;

use crate::backend::Backends;
use crate::error::{ErrorKind, Result};
use clap::{Parser, Subcommand};
use exn::ResultExt;
use stash_config::Config;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "stash", version, about = "Offline-first content cache with verified uploads")]
struct Cli {
    /// Configuration file [default: <config dir>/stash/config.toml]
    #[arg(long, short, global = true, env = "STASH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Upload pending content, then refresh the cache from the remote
    Sync {
        /// Only upload; leave the cache as it is
        #[arg(long)]
        no_pull: bool,
        /// Transfers in flight at once [default: from configuration]
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Show pending and cached ids
    Status,
    /// Stage a file for upload under the given id
    Put {
        id: String,
        file: PathBuf,
        #[arg(long)]
        mime_type: Option<String>,
    },
    /// Print (or write) the local content for an id, pending first
    Get {
        id: String,
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Drop an id from the pending and cache stores
    Delete { id: String },
    /// Clear the pending and cache stores
    Reset,
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    run(cli).await.map_err(|err| miette::miette!("{err:?}"))
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref()).or_raise(|| ErrorKind::Config)?;
    let engine = Backends::open(&config).await?.into_engine(&config).await?;
    match cli.command {
        Command::Sync { no_pull, concurrency } => {
            let pull = config.sync.pull && !no_pull;
            let concurrency = concurrency.unwrap_or(config.sync.concurrency).max(1);
            commands::sync(&engine, pull, concurrency).await
        },
        Command::Status => {
            commands::status(&engine);
            Ok(())
        },
        Command::Put { id, file, mime_type } => commands::put(&engine, &id, &file, mime_type).await,
        Command::Get { id, output } => commands::get(&engine, &id, output.as_deref()).await,
        Command::Delete { id } => commands::delete(&engine, &id).await,
        Command::Reset => commands::reset(&engine).await,
    }
}
