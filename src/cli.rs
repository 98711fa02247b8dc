use std::path::PathBuf;

use clap::{ArgAction, Parser};

use crate::cmd::Commands;

/// Offline-first trip preparation checklist.
/// Data defaults to ~/.tripcheck or a directory passed via --data-dir.
#[derive(Parser)]
#[command(name = "tripcheck", version, about = "Trip preparation checklist with offline sync")]
pub struct Cli {
    /// Directory holding the task store, pending queue and trip files.
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Trip name or id (defaults to the most recently modified trip).
    #[arg(long, short, global = true)]
    pub trip: Option<String>,

    /// Work offline: queue changes without contacting the remote service.
    #[arg(long, global = true)]
    pub offline: bool,

    /// Remote task service base URL.
    #[arg(long, global = true)]
    pub remote_url: Option<String>,

    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}
