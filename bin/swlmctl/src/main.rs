//! ---
//! swm_section: "05-networking-external-interfaces"
//! swm_subsection: "binary"
//! swm_type: "source"
//! swm_scope: "code"
//! swm_description: "Operator CLI for the software loading manager."
//! swm_version: "v0.0.0-prealpha"
//! swm_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use swm_common::logging::resolve_directive;
use swm_common::AppConfig;
use tracing_subscriber::EnvFilter;

mod call;
mod status;

#[derive(Debug, Parser)]
#[command(author, version, about = "Software loading manager control utility", long_about = None)]
struct Cli {
    /// Path to the configuration file shared with the daemon.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(flatten)]
    Call(call::CallCommand),
    /// Show persisted updates and their operations.
    Status(status::StatusOptions),
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(resolve_directive(|key| std::env::var(key).ok(), "warn"))
                .unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    let config = load_config(cli.config)?;
    match cli.command {
        Commands::Call(cmd) => call::run(cmd, &config)?,
        Commands::Status(opts) => status::run(opts, &config)?,
    }
    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<AppConfig> {
    let mut candidates = Vec::new();
    if let Some(path) = path {
        candidates.push(path);
    }
    candidates.push(PathBuf::from("configs/swlm.toml"));
    AppConfig::load(&candidates)
}
