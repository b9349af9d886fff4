//! provisor - operator CLI for provisioner plugins.
//!
//! Lists the plugin directory, verifies checksum sidecars, writes new
//! sidecars and probes plugins end to end (verify, spawn, handshake, ping).
//! `worker show` prints the effective pool size and retry schedule.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

mod commands;
mod config_bridge;
mod theme;

use commands::{plugins, worker};

/// provisor - provisioning core operator tool
#[derive(Parser)]
#[command(name = "provisor")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Load configuration from this file instead of the standard locations
    #[arg(long, global = true, env = "PROVISOR_CONFIG")]
    config: Option<PathBuf>,

    /// Override the plugin directory
    #[arg(long, global = true)]
    plugin_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage provisioner plugins
    Plugins {
        #[command(subcommand)]
        command: PluginCommands,
    },

    /// Inspect task worker settings
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },
}

#[derive(Subcommand)]
enum WorkerCommands {
    /// Show the pool size, RPC timeout and retry schedule in effect
    Show,
}

#[derive(Subcommand)]
enum PluginCommands {
    /// List plugin binaries and their checksum status
    List,

    /// Verify a module's binary against its checksum sidecar
    Verify {
        /// Module name
        module: String,
    },

    /// Write the checksum sidecar for a binary
    Checksum {
        /// Path to the plugin binary
        path: PathBuf,
    },

    /// Load a module, ping it and unload it
    Probe {
        /// Module name
        module: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => provisor_config::Config::load_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => {
            let workspace_root = std::env::current_dir().ok();
            provisor_config::Config::load(workspace_root.as_deref())
                .context("failed to load configuration")?
                .config
        },
    };
    if let Some(dir) = cli.plugin_dir {
        config.plugins.dir = dir;
    }

    let log_config = config_bridge::to_log_config(&config, cli.verbose);
    if let Err(e) = provisor_telemetry::setup_logging(&log_config) {
        eprintln!("Failed to initialize logging: {e}");
    }

    match cli.command {
        Commands::Plugins { command } => match command {
            PluginCommands::List => plugins::list(&config)?,
            PluginCommands::Verify { module } => plugins::verify(&config, &module)?,
            PluginCommands::Checksum { path } => plugins::checksum(&path)?,
            PluginCommands::Probe { module } => plugins::probe(&config, &module).await?,
        },
        Commands::Worker { command } => match command {
            WorkerCommands::Show => worker::show(&config),
        },
    }

    Ok(())
}
