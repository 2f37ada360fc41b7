//! Command-line interface for fleetlog.
//!
//! This module provides the CLI structure for the `fleetlog` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::logging::Verbosity;

pub use commands::{
    CaptureCommand, ConfigCommand, DepartCommand, HistoryCommand, StatusCommand, SyncCommand,
    TrackCommand, TripRefCommand,
};

/// fleetlog - Record vehicle trips, even offline
///
/// Opens a trip on departure, samples the vehicle's location into a durable
/// local buffer while it is in use, commits the route on arrival, and keeps
/// track of which trips have reached the remote store.
#[derive(Debug, Parser)]
#[command(name = "fleetlog")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Act as this user instead of the configured one
    #[arg(short, long, global = true, value_name = "USER")]
    pub user: Option<String>,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Register a departure and open a trip
    Depart(DepartCommand),

    /// Register an arrival and close the open trip
    Arrive(TripRefCommand),

    /// Cancel the open trip and discard its samples
    Cancel(TripRefCommand),

    /// Capture location for the open trip in the foreground
    Capture(CaptureCommand),

    /// Depart, capture in the foreground, then arrive
    Track(TrackCommand),

    /// List closed trips
    History(HistoryCommand),

    /// Upload pending trips and wait for confirmation
    Sync(SyncCommand),

    /// Show trip, capture and sync status
    Status(StatusCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from_flags(self.quiet, self.verbose)
    }

    /// The acting user: `--user`, else the configured one.
    #[must_use]
    pub fn user_id<'a>(&'a self, config: &'a Config) -> &'a str {
        self.user.as_deref().unwrap_or_else(|| config.user_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_cli_name() {
        assert_eq!(Cli::command().get_name(), "fleetlog");
    }

    #[test]
    fn test_cli_verify() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_verbosity_flags() {
        assert_eq!(parse(&["fleetlog", "status"]).verbosity(), Verbosity::Normal);
        assert_eq!(parse(&["fleetlog", "-v", "status"]).verbosity(), Verbosity::Verbose);
        assert_eq!(parse(&["fleetlog", "-vv", "status"]).verbosity(), Verbosity::Trace);
        assert_eq!(parse(&["fleetlog", "-q", "status"]).verbosity(), Verbosity::Quiet);
    }

    #[test]
    fn test_parse_depart() {
        let cli = parse(&["fleetlog", "depart", "--plate", "ABC1234", "-d", "delivery"]);
        let Command::Depart(cmd) = cli.command else {
            panic!("expected depart");
        };
        assert_eq!(cmd.plate, "ABC1234");
        assert_eq!(cmd.description, "delivery");
    }

    #[test]
    fn test_depart_requires_plate() {
        assert!(Cli::try_parse_from(["fleetlog", "depart", "-d", "delivery"]).is_err());
    }

    #[test]
    fn test_parse_arrive_with_id() {
        let id = uuid::Uuid::new_v4();
        let cli = parse(&["fleetlog", "arrive", "--id", &id.to_string()]);
        let Command::Arrive(cmd) = cli.command else {
            panic!("expected arrive");
        };
        assert_eq!(cmd.id, Some(id));
    }

    #[test]
    fn test_parse_arrive_rejects_bad_id() {
        assert!(Cli::try_parse_from(["fleetlog", "arrive", "--id", "nope"]).is_err());
    }

    #[test]
    fn test_parse_track() {
        let cli = parse(&["fleetlog", "track", "-p", "ABC1234", "-d", "x", "-s", "10"]);
        let Command::Track(cmd) = cli.command else {
            panic!("expected track");
        };
        assert_eq!(cmd.seconds, Some(10));
    }

    #[test]
    fn test_parse_history() {
        let cli = parse(&["fleetlog", "history", "--json", "--limit", "5"]);
        let Command::History(cmd) = cli.command else {
            panic!("expected history");
        };
        assert!(cmd.json);
        assert_eq!(cmd.limit, Some(5));
    }

    #[test]
    fn test_parse_sync_default_timeout() {
        let Command::Sync(cmd) = parse(&["fleetlog", "sync"]).command else {
            panic!("expected sync");
        };
        assert_eq!(cmd.timeout, 30);
    }

    #[test]
    fn test_parse_with_config() {
        let cli = parse(&["fleetlog", "-c", "/custom/config.toml", "status"]);
        assert_eq!(cli.config, Some(PathBuf::from("/custom/config.toml")));
    }

    #[test]
    fn test_user_override() {
        let config = Config::default();
        assert_eq!(parse(&["fleetlog", "status"]).user_id(&config), "local");
        assert_eq!(
            parse(&["fleetlog", "--user", "u1", "status"]).user_id(&config),
            "u1"
        );
    }

    #[test]
    fn test_parse_config_validate() {
        let cli = parse(&["fleetlog", "config", "validate", "--file", "/tmp/x.toml"]);
        assert!(matches!(
            cli.command,
            Command::Config(ConfigCommand::Validate { file: Some(_) })
        ));
    }
}
