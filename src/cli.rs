//! CLI definitions for pktfab.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "pktfab",
    version,
    about = "Multi-core packet capture fabric\n\nIntercept frames from UDP listeners, demux them through group pipelines, and fan them out to consumer taps.",
    long_about = None
)]
pub struct Cli {
    /// Path to fabric.toml config file
    #[clap(long, short, default_value = "fabric.toml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print an example fabric.toml to stdout
    Init,

    /// Run the fabric: sources, engines, taps, and the metrics log
    Run {
        /// Metrics snapshot interval in seconds
        #[clap(long, default_value = "5")]
        interval: u64,
    },

    /// Live-updating fabric dashboard reading the metrics log (Ctrl-C to stop)
    Monitor {
        /// Dashboard refresh interval in seconds
        #[clap(long, default_value = "5")]
        interval: u64,
    },

    /// Drive synthetic traffic through the fabric and emit a JSON report
    Bench {
        /// How many seconds to run the benchmark
        #[clap(long, default_value = "10")]
        duration: u64,

        /// Write JSON report to this file (default: stdout)
        #[clap(long)]
        output: Option<PathBuf>,
    },
}
