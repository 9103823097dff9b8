use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use blobrelay_core::RelayConfig;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Write a starter config file
    Init(InitArgs),
    /// Show config file path
    Path,
}

#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Force overwrite existing config
    #[arg(long, short)]
    pub force: bool,
}

pub fn run_config(args: ConfigArgs, config_path: Option<&Path>) -> Result<()> {
    match args.command {
        ConfigCommands::Show => run_show(config_path),
        ConfigCommands::Init(args) => run_init(args, config_path),
        ConfigCommands::Path => {
            println!("{}", target_path(config_path).display());
            Ok(())
        }
    }
}

fn target_path(config_path: Option<&Path>) -> PathBuf {
    config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(RelayConfig::config_path)
}

fn run_show(config_path: Option<&Path>) -> Result<()> {
    let config = RelayConfig::load(config_path)?;
    let rendered = toml::to_string_pretty(&config).context("Failed to serialize config to TOML")?;
    print!("{rendered}");
    Ok(())
}

fn run_init(args: InitArgs, config_path: Option<&Path>) -> Result<()> {
    let path = target_path(config_path);

    // Check if config already exists
    if path.exists() && !args.force {
        return Err(anyhow::anyhow!(
            "Config already exists at {:?}\n\nUse --force to overwrite",
            path
        ));
    }

    RelayConfig::template().save(&path)?;

    println!("✅ Created config at: {:?}", path);
    println!("\nNext steps:");
    println!("  1. Edit the [stores.main] section: $EDITOR {:?}", path);
    println!("  2. Export the password variable named by password_env");
    println!("  3. Run: blobrelay serve");

    Ok(())
}
