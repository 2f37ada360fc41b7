//! Sync-state reconciliation.
//!
//! A closed trip is *pending* until a full upload has been confirmed after
//! its last mutation:
//!
//! ```text
//! is_pending(trip) = trip.status == Closed && trip.updated_at > last_sync
//! ```
//!
//! The [`SyncReconciler`] consumes a remote store's progress events. Partial
//! progress is advisory ("50% synced"); a complete batch advances the
//! [`SyncClock`] to now, re-classifies every trip and publishes the result.

pub(crate) mod clock;
mod remote;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::Result;
use crate::sample::now_millis;
use crate::trip::{TripMarker, TripRecord, TripStatus, TripStore};

pub use clock::SyncClock;
pub use remote::{
    DirectoryRemote, InMemoryRemote, ProgressSubscription, RemoteStore, UploadProgress,
};

/// Anything carrying the fields the pending check needs.
pub trait Syncable {
    /// Lifecycle state.
    fn status(&self) -> TripStatus;

    /// Last local mutation.
    fn updated_at(&self) -> DateTime<Utc>;
}

impl Syncable for TripRecord {
    fn status(&self) -> TripStatus {
        self.status
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

impl Syncable for TripMarker {
    fn status(&self) -> TripStatus {
        self.status
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

/// Whether `item` has local changes not yet confirmed uploaded.
///
/// Compared at millisecond precision. A clock that was never set makes
/// every closed trip pending.
#[must_use]
pub fn is_pending(item: &impl Syncable, last_sync: Option<DateTime<Utc>>) -> bool {
    if item.status() != TripStatus::Closed {
        return false;
    }
    match last_sync {
        Some(last) => item.updated_at().timestamp_millis() > last.timestamp_millis(),
        None => true,
    }
}

/// Count of closed trips by sync state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    /// Closed trips confirmed uploaded.
    pub synced: usize,
    /// Closed trips awaiting upload.
    pub pending: usize,
}

/// Sync state published to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncStatus {
    /// Nothing in flight.
    Idle,
    /// A batch is uploading.
    Uploading {
        /// Completed share of the batch.
        percentage: u8,
    },
    /// The last batch completed.
    Complete {
        /// The new sync clock value.
        synced_at: DateTime<Utc>,
        /// Classification after the clock advanced.
        summary: SyncSummary,
    },
}

/// Tracks upload progress and maintains the sync clock.
#[derive(Debug, Clone)]
pub struct SyncReconciler {
    clock: SyncClock,
    trips: TripStore,
    status: Arc<watch::Sender<SyncStatus>>,
}

impl SyncReconciler {
    /// Create a reconciler in the `Idle` state.
    #[must_use]
    pub fn new(clock: SyncClock, trips: TripStore) -> Self {
        let (status, _) = watch::channel(SyncStatus::Idle);
        Self {
            clock,
            trips,
            status: Arc::new(status),
        }
    }

    /// Apply one progress event and return the published status.
    ///
    /// # Errors
    ///
    /// Returns a storage fault if the clock cannot be advanced or the trips
    /// cannot be classified; the previous status stays published.
    pub fn handle(&self, progress: UploadProgress) -> Result<SyncStatus> {
        let percentage = progress.percentage();
        let status = if percentage < 100 {
            debug!(
                transferred = progress.transferred,
                transferable = progress.transferable,
                percentage,
                "Upload in progress"
            );
            SyncStatus::Uploading { percentage }
        } else {
            let synced_at = self.clock.advance(now_millis())?;
            let summary = self.classify()?;
            info!(
                synced = summary.synced,
                pending = summary.pending,
                "Upload confirmed complete"
            );
            SyncStatus::Complete { synced_at, summary }
        };

        self.status.send_replace(status.clone());
        Ok(status)
    }

    /// Consume a progress stream until it ends.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first error from [`SyncReconciler::handle`].
    pub async fn run(&self, mut progress: ProgressSubscription) -> Result<()> {
        while let Some(event) = progress.next().await {
            self.handle(event)?;
        }
        debug!("Progress stream ended");
        Ok(())
    }

    /// Run on a separate task.
    #[must_use]
    pub fn spawn(&self, progress: ProgressSubscription) -> JoinHandle<Result<()>> {
        let reconciler = self.clone();
        tokio::spawn(async move { reconciler.run(progress).await })
    }

    /// Observe status changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// The latest published status.
    #[must_use]
    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// `"X% synced"` while a batch is uploading, otherwise `None`.
    #[must_use]
    pub fn current_percentage(&self) -> Option<String> {
        match *self.status.borrow() {
            SyncStatus::Uploading { percentage } => Some(format!("{percentage}% synced")),
            _ => None,
        }
    }

    /// When the last full upload was confirmed.
    ///
    /// # Errors
    ///
    /// Returns a storage fault if the clock cannot be read.
    pub fn last_sync(&self) -> Result<Option<DateTime<Utc>>> {
        self.clock.last_sync()
    }

    /// Whether `trip` is pending against the current clock.
    ///
    /// # Errors
    ///
    /// Returns a storage fault if the clock cannot be read.
    pub fn is_pending(&self, trip: &impl Syncable) -> Result<bool> {
        Ok(is_pending(trip, self.clock.last_sync()?))
    }

    /// Classify every closed trip.
    ///
    /// # Errors
    ///
    /// Returns a storage fault if the trips or clock cannot be read.
    pub fn classify(&self) -> Result<SyncSummary> {
        let last_sync = self.clock.last_sync()?;
        let summary = self
            .trips
            .markers()?
            .iter()
            .filter(|m| m.status == TripStatus::Closed)
            .fold(SyncSummary::default(), |mut acc, marker| {
                if is_pending(marker, last_sync) {
                    acc.pending += 1;
                } else {
                    acc.synced += 1;
                }
                acc
            });
        Ok(summary)
    }

    /// Push every pending trip to `remote`, returning how many were pushed.
    ///
    /// # Errors
    ///
    /// Returns a storage fault, or the remote store's error for a trip it
    /// refused to queue.
    pub fn push_pending(&self, remote: &dyn RemoteStore) -> Result<usize> {
        let last_sync = self.clock.last_sync()?;
        let mut pending = Vec::new();
        for marker in self.trips.markers()? {
            if !is_pending(&marker, last_sync) {
                continue;
            }
            if let Some(trip) = self.trips.get(marker.id)? {
                pending.push(trip);
            }
        }
        remote.push_batch(&pending)?;
        info!(pushed = pending.len(), remote = remote.name(), "Pushed pending trips");
        Ok(pending.len())
    }
}
