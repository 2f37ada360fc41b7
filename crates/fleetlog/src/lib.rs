//! `fleetlog` - offline-first vehicle trip recorder
//!
//! This library provides the trip core: a durable location buffer filled by a
//! background capture task, the trip lifecycle (departure, arrival,
//! cancellation), and sync-state reconciliation against a remote store's
//! upload-progress stream.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod buffer;
pub mod capture;
pub mod cli;
pub mod config;
pub mod error;
pub mod location;
pub mod logging;
pub mod sample;
pub mod storage;
pub mod sync;
pub mod tracker;
pub mod trip;

pub use buffer::LocationBuffer;
pub use capture::{CaptureState, CaptureStatus, CaptureTask};
pub use config::Config;
pub use error::{Error, Result};
pub use location::{ChannelProvider, Fix, LocationProvider, LocationSampler, ReplayProvider};
pub use logging::init_logging;
pub use sample::LocationSample;
pub use storage::{Storage, StorageStats};
pub use sync::{
    is_pending, DirectoryRemote, InMemoryRemote, RemoteStore, SyncClock, SyncReconciler,
    SyncStatus, SyncSummary, UploadProgress,
};
pub use tracker::Tracker;
pub use trip::{HistoryEntry, LicensePlate, TripRecord, TripStatus, TripStore};
