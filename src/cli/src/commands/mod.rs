//! CLI command definitions and dispatch.

mod catalog;
mod clean;
mod run;
mod status;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use imirror_core::config::MirrorConfig;

use crate::logging::LogFormat;

/// imirror - dated, per-architecture mirror of middleware container images.
#[derive(Parser)]
#[command(name = "imirror", version, about)]
pub struct Cli {
    /// Debug-level logging
    #[arg(short = 'D', long, global = true)]
    pub debug: bool,

    /// Configuration file (defaults to ./imirror.yaml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log event format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Resolve, plan and export updated images
    Run(run::RunArgs),
    /// Show the latest recorded version per component and architecture
    Status(status::StatusArgs),
    /// Show the configured catalog and filter rules
    Catalog(catalog::CatalogArgs),
    /// Remove progress, logs and optionally the exported images
    Clean(clean::CleanArgs),
}

/// Load configuration for `cli`: explicit file, `imirror.yaml`, or defaults,
/// then `IMIRROR_*` environment overrides.
pub fn load_config(cli: &Cli) -> imirror_core::Result<MirrorConfig> {
    MirrorConfig::discover(cli.config.as_deref())
}

/// Dispatch a parsed CLI to the appropriate command handler. Returns the
/// process exit code.
pub async fn dispatch(cli: Cli, config: MirrorConfig) -> Result<i32, Box<dyn std::error::Error>> {
    match cli.command {
        Command::Run(args) => run::execute(args, config).await,
        Command::Status(args) => status::execute(args, config).await,
        Command::Catalog(args) => catalog::execute(args, config).await,
        Command::Clean(args) => clean::execute(args, config).await,
    }
}
