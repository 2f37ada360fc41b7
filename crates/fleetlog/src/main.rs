//! `fleetlog` - CLI for the fleetlog trip recorder
//!
//! Each invocation opens the local database, performs one operation and
//! exits. `capture` and `track` keep the process alive as the background
//! capture context until interrupted.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use fleetlog::cli::{
    CaptureCommand, Cli, Command, ConfigCommand, DepartCommand, HistoryCommand, StatusCommand,
    SyncCommand, TrackCommand, TripRefCommand,
};
use fleetlog::location::{ChannelProvider, LocationProvider, LocationSampler, ReplayProvider};
use fleetlog::sync::{DirectoryRemote, RemoteStore, SyncStatus, UploadProgress};
use fleetlog::{init_logging, Config, Storage, Tracker};

/// How often `capture` checks whether the trip was closed by another process.
const OPEN_TRIP_POLL: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbosity());

    let config = Config::load_from(cli.config.clone())?;
    let user = cli.user_id(&config).to_string();

    match cli.command {
        Command::Config(cmd) => handle_config(&config, cmd),
        Command::Depart(cmd) => handle_depart(&capturing_tracker(&config)?, &user, &cmd).await,
        Command::Arrive(cmd) => handle_arrive(&open_tracker(&config)?, &user, &cmd),
        Command::Cancel(cmd) => handle_cancel(&open_tracker(&config)?, &user, &cmd),
        Command::Capture(cmd) => handle_capture(&capturing_tracker(&config)?, &user, &cmd).await,
        Command::Track(cmd) => handle_track(&capturing_tracker(&config)?, &user, &cmd).await,
        Command::History(cmd) => handle_history(&open_tracker(&config)?, &user, &cmd),
        Command::Sync(cmd) => handle_sync(&open_tracker(&config)?, &config, &cmd).await,
        Command::Status(cmd) => handle_status(&open_tracker(&config)?, &user, &cmd),
    }
}

/// A tracker for commands that record positions. Fails unless a location
/// source is configured.
fn capturing_tracker(config: &Config) -> anyhow::Result<Tracker> {
    let path = config.replay_route()?;
    let provider = ReplayProvider::from_file(path, config.capture.replay_loop)
        .with_context(|| format!("loading replay route {}", path.display()))?
        .with_channel_capacity(config.capture.channel_capacity);
    build_tracker(config, Arc::new(provider))
}

/// A tracker for commands that never capture.
fn open_tracker(config: &Config) -> anyhow::Result<Tracker> {
    match config.capture.replay_path {
        Some(_) => capturing_tracker(config),
        // Denied, so any attempt to arm fails loudly instead of idling.
        None => build_tracker(config, Arc::new(ChannelProvider::denied())),
    }
}

fn build_tracker(config: &Config, provider: Arc<dyn LocationProvider>) -> anyhow::Result<Tracker> {
    let storage = Arc::new(Storage::open(config.database_path())?);
    Ok(Tracker::new(
        storage,
        LocationSampler::new(provider, config.cadence()),
    ))
}

fn resolve_trip(tracker: &Tracker, user: &str, id: Option<Uuid>) -> anyhow::Result<Uuid> {
    if let Some(id) = id {
        return Ok(id);
    }
    match tracker.open_trip(user)? {
        Some(trip) => Ok(trip.id),
        None => bail!("user {user} has no open trip"),
    }
}

async fn handle_depart(tracker: &Tracker, user: &str, cmd: &DepartCommand) -> anyhow::Result<()> {
    let trip = tracker.depart(user, &cmd.plate, &cmd.description).await?;
    println!("Trip {} opened for {}", trip.id, trip.license_plate);
    println!("Run `fleetlog capture` to record the route.");
    Ok(())
}

fn handle_arrive(tracker: &Tracker, user: &str, cmd: &TripRefCommand) -> anyhow::Result<()> {
    let id = resolve_trip(tracker, user, cmd.id)?;
    let trip = tracker.arrive(id)?;
    println!(
        "Trip {} closed with {} coordinates",
        trip.id,
        trip.coords.len()
    );
    Ok(())
}

fn handle_cancel(tracker: &Tracker, user: &str, cmd: &TripRefCommand) -> anyhow::Result<()> {
    let id = resolve_trip(tracker, user, cmd.id)?;
    tracker.cancel(id)?;
    println!("Trip {id} cancelled");
    Ok(())
}

async fn handle_capture(tracker: &Tracker, user: &str, cmd: &CaptureCommand) -> anyhow::Result<()> {
    let Some(trip) = tracker.resume(user).await? else {
        bail!("user {user} has no open trip; run `fleetlog depart` first");
    };
    println!(
        "Capturing for trip {} ({}). Press Ctrl-C to stop.",
        trip.id, trip.license_plate
    );

    run_capture(tracker, trip.id, cmd.seconds).await?;
    tracker.capture().stop()?;

    let status = tracker.capture().status()?;
    println!(
        "Capture stopped: {} new samples, {} buffered",
        status.samples_appended, status.buffered
    );
    Ok(())
}

async fn handle_track(tracker: &Tracker, user: &str, cmd: &TrackCommand) -> anyhow::Result<()> {
    let trip = tracker.depart(user, &cmd.plate, &cmd.description).await?;
    println!(
        "Trip {} opened for {}. Press Ctrl-C to arrive.",
        trip.id, trip.license_plate
    );

    run_capture(tracker, trip.id, cmd.seconds).await?;

    if tracker.open_trip(user)?.is_some_and(|open| open.id == trip.id) {
        let closed = tracker.arrive(trip.id)?;
        println!(
            "Trip {} closed with {} coordinates",
            closed.id,
            closed.coords.len()
        );
    } else {
        tracker.capture().stop()?;
        println!("Trip {} was closed elsewhere", trip.id);
    }
    Ok(())
}

/// Keep the process alive as the capture context until Ctrl-C, the
/// deadline, or the trip being closed by another process.
async fn run_capture(tracker: &Tracker, trip_id: Uuid, seconds: Option<u64>) -> anyhow::Result<()> {
    let mut samples = tracker.capture().subscribe();
    let deadline = async {
        match seconds {
            Some(s) => tokio::time::sleep(Duration::from_secs(s)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let mut poll = tokio::time::interval(OPEN_TRIP_POLL);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                return Ok(());
            }
            () = &mut deadline => return Ok(()),
            _ = poll.tick() => {
                if let Some(fault) = tracker.capture().fault()? {
                    bail!("capture stopped: {fault}; buffered samples are kept");
                }
                let still_open = tracker
                    .trips()
                    .get(trip_id)?
                    .is_some_and(|trip| trip.is_open());
                if !still_open {
                    return Ok(());
                }
            }
            sample = samples.recv() => match sample {
                Ok(sample) => println!(
                    "{}  {:.6}, {:.6}",
                    sample.captured_at.format("%H:%M:%S"),
                    sample.latitude,
                    sample.longitude
                ),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

fn handle_history(tracker: &Tracker, user: &str, cmd: &HistoryCommand) -> anyhow::Result<()> {
    let entries = tracker.history(user, cmd.limit)?;
    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("No trips yet.");
        return Ok(());
    }
    for entry in entries {
        println!(
            "{}  {}  {}  {}",
            entry.id,
            entry.license_plate,
            entry.created,
            if entry.synced { "synced" } else { "pending" }
        );
    }
    Ok(())
}

async fn handle_sync(tracker: &Tracker, config: &Config, cmd: &SyncCommand) -> anyhow::Result<()> {
    let remote = DirectoryRemote::new(config.remote_dir())?;
    let reconciler = tracker.reconciler();
    let mut status = reconciler.subscribe();
    let pump = reconciler.spawn(remote.subscribe_progress());

    let pushed = reconciler.push_pending(&remote)?;
    println!("Uploading {pushed} trip(s) to {}", remote.dir().display());

    if pushed == 0 {
        reconciler.handle(UploadProgress::new(0, 0))?;
    } else {
        let wait = async {
            loop {
                if status.changed().await.is_err() {
                    return;
                }
                let current = status.borrow_and_update().clone();
                match current {
                    SyncStatus::Uploading { .. } => {
                        if let Some(label) = reconciler.current_percentage() {
                            println!("{label}");
                        }
                    }
                    SyncStatus::Complete { .. } => return,
                    SyncStatus::Idle => {}
                }
            }
        };
        if tokio::time::timeout(Duration::from_secs(cmd.timeout), wait)
            .await
            .is_err()
        {
            pump.abort();
            bail!(
                "upload not confirmed within {}s; trips remain pending",
                cmd.timeout
            );
        }
    }
    pump.abort();

    if let SyncStatus::Complete { synced_at, summary } = reconciler.status() {
        println!(
            "100% synced at {} ({} synced, {} pending)",
            synced_at.format("%d/%m/%Y %H:%M:%S"),
            summary.synced,
            summary.pending
        );
    }
    Ok(())
}

fn handle_status(tracker: &Tracker, user: &str, cmd: &StatusCommand) -> anyhow::Result<()> {
    let status = tracker.status(user)?;
    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("fleetlog status");
    println!("---------------");
    println!("User:          {}", status.user_id);
    match &status.open_trip {
        Some(trip) => println!(
            "Vehicle:       in use ({}, {}, trip {})",
            trip.license_plate, trip.description, trip.id
        ),
        None => println!("Vehicle:       free"),
    }
    println!(
        "Capture:       {} ({})",
        status.capture.state, status.capture.source
    );
    if let Some(error) = &status.capture.last_error {
        println!("Capture error: {error}");
    }
    println!("Buffered:      {} samples", status.capture.buffered);
    match status.last_sync {
        Some(at) => println!("Last sync:     {}", at.format("%d/%m/%Y %H:%M:%S")),
        None => println!("Last sync:     never"),
    }
    println!(
        "Trips:         {} synced, {} pending",
        status.sync.synced, status.sync.pending
    );
    println!("Database:      {}", tracker.storage().path().display());
    Ok(())
}

fn handle_config(config: &Config, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Storage]");
                println!("  Database path:      {}", config.database_path().display());
                println!();
                println!("[Capture]");
                println!("  Cadence (ms):       {}", config.capture.cadence_ms);
                println!("  Channel capacity:   {}", config.capture.channel_capacity);
                match &config.capture.replay_path {
                    Some(path) => println!("  Replay route:       {}", path.display()),
                    None => println!("  Replay route:       (none)"),
                }
                println!("  Replay loop:        {}", config.capture.replay_loop);
                println!();
                println!("[Sync]");
                println!("  Remote dir:         {}", config.remote_dir().display());
                println!();
                println!("[Identity]");
                println!("  User:               {}", config.user_id());
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            match Config::check_file(&path) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => bail!("configuration error: {e}"),
            }
        }
    }
    Ok(())
}
