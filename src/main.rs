//! # tripcheck
//!
//! Command-line front end for the offline-first trip checklist.
//!
//! ## Quick Start
//!
//! ```bash
//! # Trips are JSON snapshots in ~/.tripcheck/trips/<name>_trip.json
//! tripcheck trips
//!
//! # Add and list tasks for the most recent trip
//! tripcheck add "Renew passport" --category documentation --priority blocking --due "in 3w"
//! tripcheck list
//!
//! # Pull remote state and rule tasks, then push anything queued offline
//! tripcheck --remote-url https://tasks.example.com refresh
//! tripcheck --remote-url https://tasks.example.com sync
//!
//! # Planning gaps and suggestions
//! tripcheck gaps
//! tripcheck analyze --accept
//! ```
//!
//! Every change is written locally first and queued; without a remote URL (or with
//! `--offline`) the queue simply grows until the next online `sync` or `refresh`.

use clap::Parser;

use trip_checklist::cli::Cli;
use trip_checklist::cmd::*;
use trip_checklist::config::Settings;
use trip_checklist::logging;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let settings = Settings::resolve(cli.data_dir, cli.remote_url, cli.offline);
    if let Err(e) = std::fs::create_dir_all(settings.trips_dir()) {
        eprintln!("Failed to create data directory {}: {}", settings.data_dir().display(), e);
        std::process::exit(1);
    }

    // Commands that need neither the store nor a trip.
    match &cli.command {
        Commands::Completions { shell } => {
            cmd_completions(*shell);
            return;
        }
        Commands::Trips => {
            cmd_trips(&settings);
            return;
        }
        _ => {}
    }

    let mut session = match Session::open(settings) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to open checklist data: {}", e);
            std::process::exit(1);
        }
    };

    match cli.command {
        Commands::Sync => {
            cmd_sync(&mut session).await;
            return;
        }
        Commands::Queue { action } => {
            cmd_queue(&session, action);
            return;
        }
        command => {
            let snapshot = match session.open_trip(cli.trip.as_deref()) {
                Ok(s) => s,
                Err(e) => {
                    eprintln!("Failed to open trip: {}", e);
                    std::process::exit(1);
                }
            };

            match command {
                Commands::Completions { .. } | Commands::Trips => unreachable!("handled above"),
                Commands::Sync | Commands::Queue { .. } => unreachable!("handled above"),

                Commands::Add { title, desc, due, category, priority, urgent } =>
                    cmd_add(&mut session, title, desc, due, category, priority, urgent).await,

                Commands::List { all, window, category, sort, limit } =>
                    cmd_list(&session, &snapshot, all, window, category, sort, limit),

                Commands::View { id } => cmd_view(&session, &snapshot, id),

                Commands::Toggle { id } => cmd_toggle(&mut session, id).await,

                Commands::Update { id, title, desc, clear_desc, due, clear_due, category, priority, urgent } =>
                    cmd_update(&mut session, id, title, desc, clear_desc, due, clear_due, category,
                               priority, urgent).await,

                Commands::Delete { id } => cmd_delete(&mut session, id).await,

                Commands::DeleteMatching { pattern } => cmd_delete_matching(&mut session, pattern).await,

                Commands::Refresh => cmd_refresh(&mut session, &snapshot).await,

                Commands::Gaps { json } => cmd_gaps(&session, &snapshot, json),

                Commands::Analyze { accept } => cmd_analyze(&mut session, &snapshot, accept).await,
            }
        }
    }
}
