// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Warmstart CLI
//!
//! Command-line interface for the warmstart microVM lifecycle coordinator.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

/// Warmstart - microVM lifecycle coordinator with snapshot-based warm starts
#[derive(Parser)]
#[command(name = "warmstart")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "warmstart.yaml")]
    pub config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        file: String,
    },

    /// Run start/stop rounds against the in-process control plane
    Simulate {
        /// Function image to start
        #[arg(short, long, default_value = "nginx:1.17-alpine")]
        image: String,

        /// Number of start/stop rounds
        #[arg(short, long, default_value_t = 3)]
        rounds: u32,

        /// Tear VMs down instead of offloading them
        #[arg(long)]
        no_snapshots: bool,

        /// Simulated VM creation latency in milliseconds
        #[arg(long, default_value_t = 0)]
        boot_latency_ms: u64,

        /// Directory for snapshot artifacts (removed on exit)
        #[arg(long)]
        snapshot_dir: Option<PathBuf>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_writer(std::io::stderr)
        .init();

    // Dispatch to command handlers
    match cli.command {
        Commands::Validate { file } => commands::validate::execute(&file).await,
        Commands::Simulate {
            image,
            rounds,
            no_snapshots,
            boot_latency_ms,
            snapshot_dir,
            json,
        } => {
            commands::simulate::execute(commands::simulate::SimulateArgs {
                config: &cli.config,
                image: &image,
                rounds,
                snapshots: !no_snapshots,
                boot_latency_ms,
                snapshot_dir,
                json,
            })
            .await
        }
    }
}
