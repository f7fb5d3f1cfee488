// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! refclock CLI
//!
//! Probe the vblank reference clock on this machine.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use refclock::BackendPreference;

mod commands;

#[derive(Parser)]
#[command(name = "refclock")]
#[command(author, version, about = "Vblank reference clock probe", long_about = None)]
struct Cli {
    /// Config file (TOML); defaults apply to missing keys
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Backend override (auto, display-link, drm, simulated-counter,
    /// simulated-raster, simulated-wait, system)
    #[arg(long, global = true)]
    backend: Option<BackendPreference>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the clock and report its state periodically
    Probe {
        /// How long to run
        #[arg(long, default_value = "5")]
        seconds: u64,

        /// Report interval in milliseconds
        #[arg(long, default_value = "1000")]
        interval_ms: u64,

        /// Output format
        #[arg(long, value_enum, default_value = "pretty")]
        format: OutputFormat,
    },

    /// Measure the refresh rate once and exit
    Measure,

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Json,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = commands::load_config(cli.config.as_deref(), cli.backend)?;
    tracing::debug!("[refclock] Backend preference: {}", config.backend.as_str());

    match cli.command {
        Commands::Probe {
            seconds,
            interval_ms,
            format,
        } => commands::probe::run(config, seconds, interval_ms, format),
        Commands::Measure => commands::measure::run(config),
        Commands::Config => commands::config::run(&config),
    }
}
