mod alignment;
mod cli;
mod commands;
mod config;
mod consensus;
mod extract;
mod input;
mod judge;
mod metrics;
mod model;
mod papers;
mod pipeline;
mod references;
mod retrieval;
mod titles;
mod urls;
mod util;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};

fn main() {
    let _ = dotenvy::dotenv();
    init_tracing();

    if let Err(err) = run() {
        error!(error = %err, "command failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Statements(args) => async_runtime()?.block_on(commands::statements::run(args)),
        Commands::Citations(args) => async_runtime()?.block_on(commands::citations::run(args)),
        Commands::Metrics(args) => commands::metrics::run(args),
        Commands::Status(args) => commands::status::run(args),
    }
}

fn async_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
