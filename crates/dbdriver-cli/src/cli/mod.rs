//! CLI for the dbdriver session runtime.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use dbdriver_core::config::{self, DriverConfig};
use std::path::PathBuf;

use commands::{run_config, run_stress, StressOptions};

/// Top-level CLI for the dbdriver session runtime.
#[derive(Debug, Parser)]
#[command(name = "dbdriver")]
#[command(about = "dbdriver: session pool and retry runtime for a distributed database client", long_about = None)]
pub struct Cli {
    /// Read configuration from this file instead of the XDG config dir.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Print the config file location and the effective configuration.
    Config,

    /// Run a concurrent workload through the session pool against an
    /// in-memory simulated cluster and report pool and retry behavior.
    Stress {
        /// Concurrent worker tasks.
        #[arg(long, default_value = "16", value_name = "N")]
        workers: usize,
        /// Operations per worker.
        #[arg(long, default_value = "100", value_name = "N")]
        operations: usize,
        /// Fraction (0.0..=1.0) of operations failing with a random transient status.
        #[arg(long, default_value = "0.1", value_name = "RATE")]
        failure_rate: f64,
        /// Override the configured pool size limit.
        #[arg(long, value_name = "N")]
        pool_size: Option<usize>,
        /// Seed for the simulated failure generator.
        #[arg(long)]
        seed: Option<u64>,
        /// Treat operations as non-idempotent (undetermined outcomes are not retried).
        #[arg(long)]
        non_idempotent: bool,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<DriverConfig> {
    match path {
        Some(path) => config::load_from_path(path),
        None => config::load_or_init(),
    }
}

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();
        let cfg = load_config(cli.config.as_ref())?;
        tracing::debug!("loaded config: {:?}", cfg);

        match cli.command {
            CliCommand::Config => run_config(&cfg, cli.config.as_deref())?,
            CliCommand::Stress {
                workers,
                operations,
                failure_rate,
                pool_size,
                seed,
                non_idempotent,
            } => {
                let opts = StressOptions {
                    workers,
                    operations,
                    failure_rate,
                    pool_size,
                    seed,
                    idempotent: !non_idempotent,
                };
                run_stress(&cfg, opts).await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests;
