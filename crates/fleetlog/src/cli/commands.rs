//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand};
use uuid::Uuid;

/// Departure arguments.
#[derive(Debug, Args)]
pub struct DepartCommand {
    /// Vehicle license plate (e.g. ABC1234 or ABC1D23)
    #[arg(short, long)]
    pub plate: String,

    /// Purpose of the trip
    #[arg(short, long)]
    pub description: String,
}

/// Selects a trip; defaults to the user's open trip.
#[derive(Debug, Args)]
pub struct TripRefCommand {
    /// Trip identifier
    #[arg(long)]
    pub id: Option<Uuid>,
}

/// Foreground capture arguments.
#[derive(Debug, Args)]
pub struct CaptureCommand {
    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(short, long)]
    pub seconds: Option<u64>,
}

/// Depart, capture and arrive in one go.
#[derive(Debug, Args)]
pub struct TrackCommand {
    /// Vehicle license plate (e.g. ABC1234 or ABC1D23)
    #[arg(short, long)]
    pub plate: String,

    /// Purpose of the trip
    #[arg(short, long)]
    pub description: String,

    /// Arrive after this many seconds instead of waiting for Ctrl-C
    #[arg(short, long)]
    pub seconds: Option<u64>,
}

/// History listing arguments.
#[derive(Debug, Args)]
pub struct HistoryCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,

    /// Maximum number of trips to show
    #[arg(short, long)]
    pub limit: Option<usize>,
}

/// Sync arguments.
#[derive(Debug, Args)]
pub struct SyncCommand {
    /// Give up waiting for upload confirmation after this many seconds
    #[arg(short, long, default_value = "30")]
    pub timeout: u64,
}

/// Status command arguments.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}
