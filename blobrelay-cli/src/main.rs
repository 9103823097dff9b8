//! blobrelay CLI - streaming transfers between HTTP and PostgreSQL large objects
//!
//! Subcommands:
//! - `serve` runs the HTTP relay
//! - `put` / `get` move a single file in or out of a large-object store
//! - `config` shows or initializes the TOML config

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod tracing_setup;

#[derive(Parser, Debug)]
#[command(
    name = "blobrelay",
    author,
    version,
    about = "Stream files between HTTP clients and PostgreSQL large objects",
    long_about = "Relay uploads and downloads through PostgreSQL large objects or a local \
                  directory in fixed-size chunks, one transaction per transfer."
)]
struct Cli {
    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    debug: bool,

    /// Config file (default: ~/.blobrelay/config.toml)
    #[arg(long, short = 'c', global = true, env = "BLOBRELAY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP relay server
    Serve(commands::serve::ServeArgs),
    /// Upload a local file as a new large object and print its OID
    Put(commands::transfer::PutArgs),
    /// Download a large object into a local file
    Get(commands::transfer::GetArgs),
    /// Show or initialize configuration
    Config(commands::config::ConfigArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    // Picks up BLOBRELAY_PG_PASSWORD and friends from a local .env
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    tracing_setup::init_tracing(cli.debug).ok();

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Serve(args) => commands::run_serve(args, config_path).await?,
        Commands::Put(args) => commands::run_put(args, config_path).await?,
        Commands::Get(args) => commands::run_get(args, config_path).await?,
        Commands::Config(args) => commands::run_config(args, config_path)?,
    }
    Ok(())
}
