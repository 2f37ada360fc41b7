//! Remote stores and their upload-progress streams.
//!
//! The remote store is opaque: trips are pushed fire-and-forget and the
//! store reports `(transferred, transferable)` progress for the current
//! outgoing batch on a broadcast stream. Subscribers receive events through
//! a [`ProgressSubscription`]; dropping it unsubscribes.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::trip::TripRecord;

const PROGRESS_CAPACITY: usize = 64;

/// Write attempts per record before the directory store gives up on it.
const WRITE_ATTEMPTS: u32 = 3;

/// One upload-progress event for the current batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadProgress {
    /// Units uploaded so far.
    pub transferred: u64,
    /// Units in the batch.
    pub transferable: u64,
}

impl UploadProgress {
    /// Create a progress event.
    #[must_use]
    pub const fn new(transferred: u64, transferable: u64) -> Self {
        Self {
            transferred,
            transferable,
        }
    }

    /// Completed share of the batch, floored and capped at 100.
    ///
    /// An empty batch counts as complete.
    #[must_use]
    pub fn percentage(&self) -> u8 {
        if self.transferable == 0 {
            return 100;
        }
        let pct = u128::from(self.transferred) * 100 / u128::from(self.transferable);
        u8::try_from(pct.min(100)).unwrap_or(100)
    }

    /// Whether the batch is fully uploaded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.percentage() == 100
    }
}

/// A live subscription to a remote store's progress events.
#[derive(Debug)]
pub struct ProgressSubscription {
    rx: broadcast::Receiver<UploadProgress>,
}

impl ProgressSubscription {
    fn new(rx: broadcast::Receiver<UploadProgress>) -> Self {
        Self { rx }
    }

    /// Wait for the next event; `None` once the remote store is gone.
    ///
    /// Events missed by a lagging subscriber are skipped.
    pub async fn next(&mut self) -> Option<UploadProgress> {
        loop {
            match self.rx.recv().await {
                Ok(progress) => return Some(progress),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Progress subscriber lagged, skipping events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// An opaque, eventually consistent store of trip records.
pub trait RemoteStore: Send + Sync + std::fmt::Debug {
    /// The name of this store (for logging/debugging).
    fn name(&self) -> &'static str;

    /// Queue a trip for upload. Returns before the upload happens.
    ///
    /// # Errors
    ///
    /// Returns an error if the trip cannot be queued at all.
    fn push(&self, trip: &TripRecord) -> Result<()>;

    /// Queue several trips as one batch.
    ///
    /// # Errors
    ///
    /// Returns an error if any trip cannot be queued.
    fn push_batch(&self, trips: &[TripRecord]) -> Result<()> {
        trips.iter().try_for_each(|trip| self.push(trip))
    }

    /// Subscribe to upload progress.
    fn subscribe_progress(&self) -> ProgressSubscription;
}

/// Remote store held in memory, with progress driven by the caller.
#[derive(Debug)]
pub struct InMemoryRemote {
    records: Mutex<Vec<TripRecord>>,
    progress: broadcast::Sender<UploadProgress>,
}

impl InMemoryRemote {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (progress, _) = broadcast::channel(PROGRESS_CAPACITY);
        Self {
            records: Mutex::new(Vec::new()),
            progress,
        }
    }

    /// Publish a progress event, returning how many subscribers received it.
    pub fn emit(&self, progress: UploadProgress) -> usize {
        self.progress.send(progress).unwrap_or(0)
    }

    /// Every record pushed so far.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the lock is poisoned.
    pub fn records(&self) -> Result<Vec<TripRecord>> {
        Ok(self.records.lock()?.clone())
    }
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteStore for InMemoryRemote {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn push(&self, trip: &TripRecord) -> Result<()> {
        self.records.lock()?.push(trip.clone());
        debug!(trip_id = %trip.id, "Queued trip in memory");
        Ok(())
    }

    fn subscribe_progress(&self) -> ProgressSubscription {
        ProgressSubscription::new(self.progress.subscribe())
    }
}

#[derive(Debug, Default)]
struct Batch {
    queued: u64,
    written: u64,
    abandoned: u64,
}

impl Batch {
    /// Every queued record was written or given up on.
    fn is_settled(&self) -> bool {
        self.written + self.abandoned >= self.queued
    }
}

/// Remote store that writes each trip as `<id>.json` into a directory.
///
/// Writes happen on background tasks; each finished write emits
/// `(written, queued)` for the current batch, and the batch resets once it
/// is settled. A record that still fails after retries is never counted as
/// written, so a batch containing it never reports completion, and the next
/// batch starts from zero.
#[derive(Debug, Clone)]
pub struct DirectoryRemote {
    dir: PathBuf,
    batch: Arc<Mutex<Batch>>,
    progress: broadcast::Sender<UploadProgress>,
}

impl DirectoryRemote {
    /// Create a store rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|source| Error::DirectoryCreate {
            path: dir.clone(),
            source,
        })?;
        let (progress, _) = broadcast::channel(PROGRESS_CAPACITY);
        Ok(Self {
            dir,
            batch: Arc::new(Mutex::new(Batch::default())),
            progress,
        })
    }

    /// Directory records are written to.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file holding trip `id`.
    #[must_use]
    pub fn record_path(&self, id: &uuid::Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn write_record(&self, trip_id: uuid::Uuid, path: PathBuf, body: Vec<u8>) {
        for attempt in 1..=WRITE_ATTEMPTS {
            match tokio::fs::write(&path, &body).await {
                Ok(()) => {
                    debug!(trip_id = %trip_id, path = %path.display(), "Wrote trip record");
                    self.record_written();
                    return;
                }
                Err(e) => {
                    warn!(trip_id = %trip_id, attempt, error = %e, "Failed to write trip record");
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                }
            }
        }
        warn!(trip_id = %trip_id, "Giving up on trip record; it stays pending");
        self.record_abandoned();
    }

    fn record_abandoned(&self) {
        let Ok(mut batch) = self.batch.lock() else {
            warn!("Batch lock poisoned, dropping abandoned record");
            return;
        };
        batch.abandoned += 1;
        if batch.is_settled() {
            debug!(
                written = batch.written,
                abandoned = batch.abandoned,
                "Batch settled incomplete"
            );
            *batch = Batch::default();
        }
    }

    fn record_written(&self) {
        let Ok(mut batch) = self.batch.lock() else {
            warn!("Batch lock poisoned, dropping progress event");
            return;
        };
        batch.written += 1;
        let event = UploadProgress::new(batch.written, batch.queued);
        if batch.is_settled() {
            *batch = Batch::default();
        }
        // No subscribers is fine.
        let _ = self.progress.send(event);
        debug!(
            transferred = event.transferred,
            transferable = event.transferable,
            "Upload progress"
        );
    }
}

impl RemoteStore for DirectoryRemote {
    fn name(&self) -> &'static str {
        "directory"
    }

    fn push(&self, trip: &TripRecord) -> Result<()> {
        self.push_batch(std::slice::from_ref(trip))
    }

    /// Every trip is counted into the batch before any write starts, so
    /// the batch cannot report completion while part of it is unqueued.
    fn push_batch(&self, trips: &[TripRecord]) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::remote(format!("no async runtime for upload: {e}")))?;
        let writes = trips
            .iter()
            .map(|trip| -> Result<(uuid::Uuid, PathBuf, Vec<u8>)> {
                Ok((trip.id, self.record_path(&trip.id), serde_json::to_vec_pretty(trip)?))
            })
            .collect::<Result<Vec<_>>>()?;

        self.batch.lock()?.queued += writes.len() as u64;

        for (trip_id, path, body) in writes {
            let store = self.clone();
            runtime.spawn(async move { store.write_record(trip_id, path, body).await });
            info!(trip_id = %trip_id, dir = %self.dir.display(), "Queued trip for upload");
        }
        Ok(())
    }

    fn subscribe_progress(&self) -> ProgressSubscription {
        ProgressSubscription::new(self.progress.subscribe())
    }
}
