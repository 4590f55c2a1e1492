//! Command-line argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "syncerd")]
#[command(about = "Your lightweight Docker registry sync engine")]
#[command(
    long_about = "SyncerD synchronizes Docker images from Docker Hub to other container \
registries (ECR, ACR, GCR, GitHub Container Registry). It can monitor for new versions \
and automatically sync them on a schedule."
)]
#[command(version)]
pub struct Cli {
    /// Configuration file
    #[arg(
        long = "config",
        global = true,
        env = "SYNCERD_CONFIG",
        help = "Config file (default is ./syncerd.yaml)"
    )]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(
        long = "verbose",
        short = 'v',
        global = true,
        conflicts_with = "quiet",
        help = "Enable verbose output"
    )]
    pub verbose: bool,

    /// Quiet mode
    #[arg(
        long = "quiet",
        short = 'q',
        global = true,
        help = "Only print warnings and errors"
    )]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Sync images according to configuration
    Sync {
        /// Run one sync pass and exit instead of following the schedule
        #[arg(long = "once")]
        once: bool,
    },
    /// Test the connection to every configured registry
    Check,
}
