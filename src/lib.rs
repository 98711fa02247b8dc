//! # Trip Checklist
//!
//! Offline-first preparation checklist for trips.
//!
//! Tasks are edited optimistically against a durable local store; every mutation
//! is also recorded in a pending action queue that is replayed against the remote
//! task service once connectivity returns. A reconcile pass merges remote state,
//! local unsynced edits and rule-generated tasks into one canonical list.
//!
//! Read-only helpers sit on top of the list: guidance enrichment with time
//! windows, structural gap analysis, and an optional suggestion service.
//!
//! Data lives in `~/.tripcheck/` by default:
//!
//! - `tasks.json` - local task store
//! - `pending_actions.json` - queued remote mutations
//! - `trips/<name>_trip.json` - trip snapshots

pub mod cli;
pub mod cmd;
pub mod config;
pub mod connectivity;
pub mod controller;
pub mod display;
pub mod enrich;
pub mod error;
pub mod fields;
pub mod gaps;
pub mod logging;
pub mod queue;
pub mod remote;
pub mod rules;
pub mod store;
pub mod suggest;
pub mod sync;
pub mod task;
pub mod trip;

pub use error::{Error, Result};
