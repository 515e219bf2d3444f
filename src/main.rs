//! pktfab — multi-core packet capture fabric.
//!
//! Feeds UDP listener "devices" through per-CPU receive engines, demuxes
//! frames into group pipelines, and fans them out to consumer taps. Run
//! `pktfab --help` for usage.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod bench;
mod cli;
mod color;
mod config;
mod monitor;
mod runtime;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    // Load config (except for `init` which doesn't need it)
    let config = match &cli.command {
        Commands::Init => None,
        _ => {
            if !cli.config.exists() {
                anyhow::bail!(
                    "no config at '{}' — run `pktfab init > {}` first",
                    cli.config.display(),
                    cli.config.display()
                );
            }
            Some(config::AppConfig::load(&cli.config)?)
        }
    };

    match cli.command {
        Commands::Init => {
            let example = config::AppConfig::default_example();
            print!("{}", toml::to_string_pretty(&example)?);
        }
        Commands::Run { interval } => {
            runtime::run(config.as_ref().unwrap(), interval)?;
        }
        Commands::Monitor { interval } => {
            monitor::run(config.as_ref().unwrap(), interval)?;
        }
        Commands::Bench { duration, output } => {
            bench::run(config.as_ref().unwrap(), duration, output)?;
        }
    }

    Ok(())
}
