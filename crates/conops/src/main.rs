// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! ConOps - a single-node GitOps control plane for compose applications.
//!
//! This is the binary entry point for the ConOps controller.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

mod serve;
mod shutdown;

/// ConOps - reconcile compose apps against their Git source of truth.
#[derive(Parser, Debug)]
#[command(name = "conops", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the control plane: watcher, reconciler, and HTTP API.
    Serve {
        /// Explicit config file instead of the standard lookup paths.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => {
            let loaded = match config {
                Some(path) => conops_config::load_config_from_path(&path),
                None => conops_config::load_config(),
            };
            let config = match loaded {
                Ok(config) => config,
                Err(err) => {
                    eprintln!("error: invalid configuration: {err}");
                    return ExitCode::FAILURE;
                }
            };

            if let Err(err) = serve::run_serve(config).await {
                eprintln!("error: {err}");
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
    }
}
