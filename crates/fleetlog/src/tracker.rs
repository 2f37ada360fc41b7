//! Foreground entry point wiring the trip core together.
//!
//! A [`Tracker`] owns one handle to each shared resource (buffer, trip
//! store, capture task, sync reconciler) over a single [`Storage`]. The
//! capture task's pump runs on its own tokio task; everything else is
//! called from the foreground.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::buffer::LocationBuffer;
use crate::capture::{CaptureStatus, CaptureTask};
use crate::error::Result;
use crate::location::LocationSampler;
use crate::storage::{Storage, StorageStats};
use crate::sync::{SyncClock, SyncReconciler, SyncSummary};
use crate::trip::{validate_description, HistoryEntry, LicensePlate, TripRecord, TripStore};

/// Everything `status` reports about the device.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerStatus {
    /// User the report is for.
    pub user_id: String,
    /// The user's open trip, if any.
    pub open_trip: Option<OpenTripSummary>,
    /// Capture task snapshot.
    pub capture: CaptureStatus,
    /// Last confirmed full upload.
    pub last_sync: Option<DateTime<Utc>>,
    /// Closed trips by sync state.
    pub sync: SyncSummary,
    /// Database counters.
    pub storage: StorageStats,
}

/// The "vehicle in use" view of an open trip.
#[derive(Debug, Clone, Serialize)]
pub struct OpenTripSummary {
    /// Trip identifier.
    pub id: Uuid,
    /// Vehicle plate.
    pub license_plate: LicensePlate,
    /// Purpose of the trip.
    pub description: String,
    /// When the trip was opened.
    pub created_at: DateTime<Utc>,
}

impl From<&TripRecord> for OpenTripSummary {
    fn from(trip: &TripRecord) -> Self {
        Self {
            id: trip.id,
            license_plate: trip.license_plate.clone(),
            description: trip.description.clone(),
            created_at: trip.created_at,
        }
    }
}

/// Trip lifecycle and sync operations for the foreground context.
#[derive(Debug, Clone)]
pub struct Tracker {
    storage: Arc<Storage>,
    trips: TripStore,
    capture: Arc<CaptureTask>,
    reconciler: SyncReconciler,
}

impl Tracker {
    /// Wire a tracker over `storage`, sampling through `sampler`.
    #[must_use]
    pub fn new(storage: Arc<Storage>, sampler: LocationSampler) -> Self {
        let buffer = LocationBuffer::new(Arc::clone(&storage));
        let capture = Arc::new(CaptureTask::new(sampler, buffer));
        let trips = TripStore::new(Arc::clone(&storage)).with_capture(Arc::clone(&capture));
        let reconciler = SyncReconciler::new(SyncClock::new(Arc::clone(&storage)), trips.clone());
        Self {
            storage,
            trips,
            capture,
            reconciler,
        }
    }

    /// The shared storage.
    #[must_use]
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// The trip store.
    #[must_use]
    pub fn trips(&self) -> &TripStore {
        &self.trips
    }

    /// The capture task.
    #[must_use]
    pub fn capture(&self) -> &Arc<CaptureTask> {
        &self.capture
    }

    /// The location buffer.
    #[must_use]
    pub fn buffer(&self) -> &LocationBuffer {
        self.capture.buffer()
    }

    /// The sync reconciler.
    #[must_use]
    pub fn reconciler(&self) -> &SyncReconciler {
        &self.reconciler
    }

    /// Register a departure: open a trip and start capturing.
    ///
    /// Input is validated and permission checked before anything is
    /// written. The departure position is recorded as the first sample when
    /// available. If capture cannot start the new trip is cancelled.
    ///
    /// # Errors
    ///
    /// - `Validation` for a malformed plate or description.
    /// - `PermissionMissing` if location access is denied.
    /// - `Conflict` if the user already has an open trip.
    /// - A storage fault if the trip cannot be written.
    pub async fn depart(
        &self,
        user_id: &str,
        license_plate: &str,
        description: &str,
    ) -> Result<TripRecord> {
        LicensePlate::parse(license_plate)?;
        validate_description(description)?;
        self.capture.ensure_permission().await?;

        let trip = self.trips.open_trip(user_id, license_plate, description)?;

        if let Err(e) = self.capture.record_current_position().await {
            warn!(trip_id = %trip.id, error = %e, "Departure position unavailable");
        }

        if let Err(e) = self.capture.start().await {
            warn!(trip_id = %trip.id, error = %e, "Capture failed to start, cancelling trip");
            self.trips.cancel_trip(trip.id)?;
            return Err(e);
        }

        Ok(trip)
    }

    /// Register an arrival: close the trip and stop capturing.
    ///
    /// # Errors
    ///
    /// See [`TripStore::close_trip`].
    pub fn arrive(&self, trip_id: Uuid) -> Result<TripRecord> {
        self.trips.close_trip(trip_id)
    }

    /// Cancel an open trip and discard what was captured.
    ///
    /// # Errors
    ///
    /// See [`TripStore::cancel_trip`].
    pub fn cancel(&self, trip_id: Uuid) -> Result<()> {
        self.trips.cancel_trip(trip_id)
    }

    /// The user's open trip, if a vehicle is in use.
    ///
    /// # Errors
    ///
    /// Returns a storage fault if the read fails.
    pub fn open_trip(&self, user_id: &str) -> Result<Option<TripRecord>> {
        self.trips.find_open(user_id)
    }

    /// Re-arm capture for the user's open trip after a restart.
    ///
    /// Returns the open trip, or `None` (and leaves capture idle) if there
    /// is none.
    ///
    /// # Errors
    ///
    /// Returns `PermissionMissing` or a storage fault.
    pub async fn resume(&self, user_id: &str) -> Result<Option<TripRecord>> {
        let Some(trip) = self.trips.find_open(user_id)? else {
            return Ok(None);
        };
        self.capture.start().await?;
        info!(
            trip_id = %trip.id,
            buffered = self.buffer().len()?,
            "Resumed capture for open trip"
        );
        Ok(Some(trip))
    }

    /// The user's closed trips, newest first, with their sync flag.
    ///
    /// # Errors
    ///
    /// Returns a storage fault if the history cannot be read.
    pub fn history(&self, user_id: &str, limit: Option<usize>) -> Result<Vec<HistoryEntry>> {
        let last_sync = self.reconciler.last_sync()?;
        self.trips
            .list_history(user_id)
            .take(limit.unwrap_or(usize::MAX))
            .map(|trip| {
                let trip = trip?;
                let synced = !crate::sync::is_pending(&trip, last_sync);
                Ok(HistoryEntry::new(&trip, synced))
            })
            .collect()
    }

    /// Snapshot of trip, capture, sync and storage state.
    ///
    /// # Errors
    ///
    /// Returns a storage fault if any part cannot be read.
    pub fn status(&self, user_id: &str) -> Result<TrackerStatus> {
        Ok(TrackerStatus {
            user_id: user_id.to_string(),
            open_trip: self
                .trips
                .find_open(user_id)?
                .as_ref()
                .map(OpenTripSummary::from),
            capture: self.capture.status()?,
            last_sync: self.reconciler.last_sync()?,
            sync: self.reconciler.classify()?,
            storage: self.storage.stats()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::location::{ChannelProvider, Fix, LocationProvider};
    use crate::sync::UploadProgress;
    use crate::trip::TripStatus;

    fn tracker(provider: &Arc<ChannelProvider>) -> Tracker {
        let storage = Arc::new(Storage::open_in_memory().expect("failed to create test storage"));
        let sampler = LocationSampler::new(
            Arc::clone(provider) as Arc<dyn LocationProvider>,
            Duration::from_millis(10),
        );
        Tracker::new(storage, sampler)
    }

    async fn wait_for_len(tracker: &Tracker, len: usize) {
        for _ in 0..200 {
            if tracker.buffer().len().unwrap() >= len {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("buffer never reached {len} samples");
    }

    #[tokio::test]
    async fn test_depart_and_arrive() {
        let provider = Arc::new(ChannelProvider::new());
        provider.set_position(Fix::now(-23.0, -46.0));
        let tracker = tracker(&provider);

        let trip = tracker.depart("u1", "ABC1234", "delivery").await.unwrap();
        assert_eq!(
            tracker.capture().state().unwrap(),
            crate::capture::CaptureState::Armed
        );

        provider.push(Fix::now(-23.1, -46.1)).await;
        wait_for_len(&tracker, 2).await;

        let closed = tracker.arrive(trip.id).unwrap();
        assert_eq!(closed.status, TripStatus::Closed);
        assert_eq!(closed.coords.len(), 2);
        assert!((closed.coords[0].latitude + 23.0).abs() < f64::EPSILON);
        assert_eq!(
            tracker.capture().state().unwrap(),
            crate::capture::CaptureState::Idle
        );
        assert!(tracker.buffer().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_depart_denied_creates_nothing() {
        let provider = Arc::new(ChannelProvider::denied());
        let tracker = tracker(&provider);

        let err = tracker.depart("u1", "ABC1234", "delivery").await.unwrap_err();
        assert!(err.is_permission_error());
        assert!(tracker.open_trip("u1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_depart_validates_before_permission() {
        let provider = Arc::new(ChannelProvider::denied());
        let tracker = tracker(&provider);

        let err = tracker.depart("u1", "123", "delivery").await.unwrap_err();
        assert!(err.is_validation_error());
    }

    #[tokio::test]
    async fn test_depart_without_position_still_opens() {
        let provider = Arc::new(ChannelProvider::new());
        let tracker = tracker(&provider);

        let trip = tracker.depart("u1", "ABC1234", "delivery").await.unwrap();
        assert!(tracker.buffer().is_empty().unwrap());
        assert_eq!(tracker.open_trip("u1").unwrap().map(|t| t.id), Some(trip.id));
    }

    #[tokio::test]
    async fn test_cancel_stops_capture_and_clears_buffer() {
        let provider = Arc::new(ChannelProvider::new());
        provider.set_position(Fix::now(1.0, 1.0));
        let tracker = tracker(&provider);
        let trip = tracker.depart("u1", "ABC1234", "delivery").await.unwrap();

        tracker.cancel(trip.id).unwrap();

        assert!(tracker.open_trip("u1").unwrap().is_none());
        assert!(tracker.buffer().is_empty().unwrap());
        assert_eq!(
            tracker.capture().state().unwrap(),
            crate::capture::CaptureState::Idle
        );
    }

    #[tokio::test]
    async fn test_resume_without_open_trip() {
        let provider = Arc::new(ChannelProvider::new());
        let tracker = tracker(&provider);
        assert!(tracker.resume("u1").await.unwrap().is_none());
        assert_eq!(provider.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_resume_rearms_capture() {
        let provider = Arc::new(ChannelProvider::new());
        let tracker = tracker(&provider);
        let trip = tracker.trips().open_trip("u1", "ABC1234", "x").unwrap();

        let resumed = tracker.resume("u1").await.unwrap().unwrap();
        assert_eq!(resumed.id, trip.id);

        provider.push(Fix::now(2.0, 2.0)).await;
        wait_for_len(&tracker, 1).await;
    }

    #[tokio::test]
    async fn test_history_marks_synced_trips() {
        let provider = Arc::new(ChannelProvider::new());
        let tracker = tracker(&provider);

        let first = tracker.depart("u1", "ABC1234", "a").await.unwrap();
        tracker.arrive(first.id).unwrap();
        tracker.reconciler().handle(UploadProgress::new(1, 1)).unwrap();
        let second = tracker.depart("u1", "XYZ9876", "b").await.unwrap();
        tracker.arrive(second.id).unwrap();

        let history = tracker.history("u1", None).unwrap();
        assert_eq!(history.len(), 2);
        let synced: Vec<_> = history.iter().map(|e| (e.id, e.synced)).collect();
        assert!(synced.contains(&(first.id, true)));
        assert!(synced.contains(&(second.id, false)));
        assert!(history[0].created.starts_with("Departed "));

        assert_eq!(tracker.history("u1", Some(1)).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_status() {
        let provider = Arc::new(ChannelProvider::new());
        let tracker = tracker(&provider);
        let trip = tracker.depart("u1", "ABC1234", "delivery").await.unwrap();

        let status = tracker.status("u1").unwrap();
        assert_eq!(status.open_trip.map(|t| t.id), Some(trip.id));
        assert_eq!(status.storage.open_trips, 1);
        assert_eq!(status.last_sync, None);

        let json = serde_json::to_string(&tracker.status("u2").unwrap()).unwrap();
        assert!(json.contains("\"open_trip\":null"));
    }
}
