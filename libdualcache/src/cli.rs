use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "dualcache", version, about = "Dual-cache file layer demo CLI")]
pub struct Cli {
    /// JSON bridge config; defaults are used when absent
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run walkthroughs against the in-memory engine
    Demo {
        /// Scenario to run; all of them when omitted
        scenario: Option<String>,
    },
    /// Print the effective config as JSON
    ShowConfig,
}
