//! Background capture of location samples into the buffer.
//!
//! [`CaptureTask`] couples a [`LocationSampler`] to the [`LocationBuffer`].
//! While armed, a tokio task pulls samples from the sampler and appends each
//! one durably before notifying any observers.
//!
//! ```text
//!   Idle ──start──► Armed ──stop──► Idle
//!                     │  ▲
//!          feed ends  ▼  │ start (resume)
//!                   Stalled
//!
//!   Armed ──append fails──► Faulted ──start──► Armed
//! ```
//!
//! A failed append stops the pump. The error is kept and reported by
//! [`CaptureTask::status`] until capture is restarted or stopped.
//!
//! Every append happens while holding the registration lock and after
//! checking that the arming it belongs to is still current. [`CaptureTask::stop`]
//! takes the same lock to retire the arming, so once it returns no further
//! write can reach the buffer.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::buffer::LocationBuffer;
use crate::error::Result;
use crate::location::{LocationSampler, SampleStream};
use crate::sample::LocationSample;

/// Capacity of the sample notification channel.
const NOTIFY_CAPACITY: usize = 64;

/// Lifecycle state of the capture task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    /// Not capturing.
    Idle,
    /// Subscribed and appending samples.
    Armed,
    /// Armed, but the location feed ended (e.g. the process was suspended).
    /// Calling `start` again re-attaches to the same buffer.
    Stalled,
    /// A sample could not be buffered and the pump stopped.
    Faulted,
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Armed => write!(f, "armed"),
            Self::Stalled => write!(f, "stalled"),
            Self::Faulted => write!(f, "faulted"),
        }
    }
}

/// Snapshot of the capture task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureStatus {
    /// Current state.
    pub state: CaptureState,
    /// Name of the location provider.
    pub source: &'static str,
    /// Samples appended since the task was last armed from Idle.
    pub samples_appended: u64,
    /// Samples currently in the buffer.
    pub buffered: usize,
    /// The storage error that stopped the pump, while faulted.
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct Registration {
    /// Bumped on every arming and every stop; a pump only writes while its
    /// generation is current.
    generation: u64,
    task: Option<JoinHandle<()>>,
    fault: Option<String>,
}

/// The background capture task.
pub struct CaptureTask {
    sampler: LocationSampler,
    buffer: LocationBuffer,
    registration: Arc<Mutex<Registration>>,
    notifier: broadcast::Sender<LocationSample>,
    appended: Arc<AtomicU64>,
}

impl CaptureTask {
    /// Create an idle capture task.
    #[must_use]
    pub fn new(sampler: LocationSampler, buffer: LocationBuffer) -> Self {
        let (notifier, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            sampler,
            buffer,
            registration: Arc::new(Mutex::new(Registration::default())),
            notifier,
            appended: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The buffer samples are appended to.
    #[must_use]
    pub fn buffer(&self) -> &LocationBuffer {
        &self.buffer
    }

    /// Request location permission without arming.
    ///
    /// # Errors
    ///
    /// Returns `PermissionMissing` if access is denied.
    pub async fn ensure_permission(&self) -> Result<()> {
        self.sampler.ensure_permission().await
    }

    /// Read the current position once and append it to the buffer.
    ///
    /// # Errors
    ///
    /// Returns the provider's error or a storage fault.
    pub async fn record_current_position(&self) -> Result<LocationSample> {
        let sample = self.sampler.current_position().await?;
        self.buffer.append(&sample)?;
        debug!(
            latitude = sample.latitude,
            longitude = sample.longitude,
            "Recorded current position"
        );
        Ok(sample)
    }

    /// Arm capture.
    ///
    /// A no-op while already armed. If the previous feed has ended, a new
    /// one is subscribed and appends continue into the same buffer.
    ///
    /// # Errors
    ///
    /// Returns `PermissionMissing` if location access is denied (the task
    /// stays as it was), or the provider's error if the feed cannot start.
    pub async fn start(&self) -> Result<()> {
        if self.is_running()? {
            debug!("Capture already armed");
            return Ok(());
        }

        self.sampler.ensure_permission().await?;
        let stream = self.sampler.arm().await?;

        let mut registration = self.registration.lock()?;
        let resuming = match &registration.task {
            Some(task) if !task.is_finished() && registration.fault.is_none() => {
                debug!("Capture armed concurrently, dropping extra feed");
                return Ok(());
            }
            Some(_) => true,
            None => false,
        };

        registration.generation += 1;
        if let Some(fault) = registration.fault.take() {
            info!(error = %fault, "Clearing capture fault");
        }
        if !resuming {
            self.appended.store(0, Ordering::SeqCst);
        }
        registration.task = Some(tokio::spawn(pump(
            registration.generation,
            stream,
            self.buffer.clone(),
            Arc::clone(&self.registration),
            self.notifier.clone(),
            Arc::clone(&self.appended),
        )));

        if resuming {
            info!(source = self.sampler.source(), "Capture resumed");
        } else {
            info!(
                source = self.sampler.source(),
                cadence_ms = self.sampler.cadence().as_millis(),
                "Capture started"
            );
        }
        Ok(())
    }

    /// Disarm capture. Idempotent.
    ///
    /// Returns once no further sample can be appended.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the registration lock is poisoned.
    pub fn stop(&self) -> Result<()> {
        let mut registration = self.registration.lock()?;
        registration.generation += 1;
        registration.fault = None;
        if let Some(task) = registration.task.take() {
            task.abort();
            info!(
                samples = self.appended.load(Ordering::SeqCst),
                "Capture stopped"
            );
        }
        Ok(())
    }

    /// Subscribe to appended samples.
    ///
    /// Delivery is best effort: a slow receiver may miss samples, which
    /// remain in the buffer regardless.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LocationSample> {
        self.notifier.subscribe()
    }

    /// Current state.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the registration lock is poisoned.
    pub fn state(&self) -> Result<CaptureState> {
        let registration = self.registration.lock()?;
        Ok(match &registration.task {
            None => CaptureState::Idle,
            Some(_) if registration.fault.is_some() => CaptureState::Faulted,
            Some(task) if task.is_finished() => CaptureState::Stalled,
            Some(_) => CaptureState::Armed,
        })
    }

    /// The storage error that stopped the pump, if capture is faulted.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the registration lock is poisoned.
    pub fn fault(&self) -> Result<Option<String>> {
        Ok(self.registration.lock()?.fault.clone())
    }

    /// Snapshot of state, source and counters.
    ///
    /// # Errors
    ///
    /// Returns a storage fault if the buffer cannot be read.
    pub fn status(&self) -> Result<CaptureStatus> {
        let last_error = self.fault()?;
        Ok(CaptureStatus {
            state: self.state()?,
            source: self.sampler.source(),
            samples_appended: self.appended.load(Ordering::SeqCst),
            buffered: self.buffer.len()?,
            last_error,
        })
    }

    fn is_running(&self) -> Result<bool> {
        Ok(self.state()? == CaptureState::Armed)
    }
}

impl fmt::Debug for CaptureTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureTask")
            .field("sampler", &self.sampler)
            .field("appended", &self.appended.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Drop for CaptureTask {
    fn drop(&mut self) {
        if let Ok(mut registration) = self.registration.lock() {
            if let Some(task) = registration.task.take() {
                task.abort();
            }
        }
    }
}

async fn pump(
    generation: u64,
    mut stream: SampleStream,
    buffer: LocationBuffer,
    registration: Arc<Mutex<Registration>>,
    notifier: broadcast::Sender<LocationSample>,
    appended: Arc<AtomicU64>,
) {
    while let Some(sample) = stream.next().await {
        let inserted = {
            let Ok(mut registration) = registration.lock() else {
                error!("Capture registration lock poisoned, stopping");
                return;
            };
            if registration.generation != generation {
                debug!("Capture retired, dropping sample");
                return;
            }
            match buffer.append(&sample) {
                Ok(inserted) => inserted,
                Err(e) => {
                    error!(
                        error = %e,
                        latitude = sample.latitude,
                        longitude = sample.longitude,
                        "Failed to buffer location sample, capture faulted"
                    );
                    registration.fault = Some(e.to_string());
                    return;
                }
            }
        };

        if inserted {
            appended.fetch_add(1, Ordering::SeqCst);
            // No receivers is fine.
            let _ = notifier.send(sample);
        }
    }
    debug!(generation, "Capture feed ended");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::location::{ChannelProvider, Fix, LocationProvider};
    use crate::storage::Storage;

    struct Fixture {
        provider: Arc<ChannelProvider>,
        task: CaptureTask,
        buffer: LocationBuffer,
        storage: Arc<Storage>,
    }

    fn fixture(provider: ChannelProvider) -> Fixture {
        let provider = Arc::new(provider);
        let storage = Arc::new(Storage::open_in_memory().expect("failed to create test storage"));
        let buffer = LocationBuffer::new(Arc::clone(&storage));
        let sampler = LocationSampler::new(
            Arc::clone(&provider) as Arc<dyn LocationProvider>,
            Duration::from_millis(10),
        );
        Fixture {
            provider,
            task: CaptureTask::new(sampler, buffer.clone()),
            buffer,
            storage,
        }
    }

    async fn wait_for_len(buffer: &LocationBuffer, len: usize) {
        for _ in 0..200 {
            if buffer.len().unwrap() >= len {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("buffer never reached {len} samples");
    }

    #[tokio::test]
    async fn test_start_appends_samples_in_order() {
        let f = fixture(ChannelProvider::new());
        f.task.start().await.unwrap();
        assert_eq!(f.task.state().unwrap(), CaptureState::Armed);

        f.provider.push(Fix::now(10.0, 20.0)).await;
        f.provider.push(Fix::now(11.0, 21.0)).await;
        wait_for_len(&f.buffer, 2).await;

        let samples = f.buffer.read_all().unwrap();
        assert!((samples[0].latitude - 10.0).abs() < f64::EPSILON);
        assert!((samples[1].latitude - 11.0).abs() < f64::EPSILON);
        assert_eq!(f.task.status().unwrap().samples_appended, 2);
    }

    #[tokio::test]
    async fn test_permission_denied_stays_idle() {
        let f = fixture(ChannelProvider::denied());
        let err = f.task.start().await.unwrap_err();

        assert!(err.is_permission_error());
        assert_eq!(f.task.state().unwrap(), CaptureState::Idle);
        assert_eq!(f.provider.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_no_appends_after_stop() {
        let f = fixture(ChannelProvider::new());
        f.task.start().await.unwrap();
        f.provider.push(Fix::now(1.0, 1.0)).await;
        wait_for_len(&f.buffer, 1).await;

        f.task.stop().unwrap();
        assert_eq!(f.task.state().unwrap(), CaptureState::Idle);

        f.provider.push(Fix::now(2.0, 2.0)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(f.buffer.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let f = fixture(ChannelProvider::new());
        assert!(f.task.stop().is_ok());
        f.task.start().await.unwrap();
        assert!(f.task.stop().is_ok());
        assert!(f.task.stop().is_ok());
    }

    #[tokio::test]
    async fn test_start_twice_is_noop() {
        let f = fixture(ChannelProvider::new());
        f.task.start().await.unwrap();
        f.task.start().await.unwrap();

        assert_eq!(f.provider.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_resume_after_suspend_keeps_buffer() {
        let f = fixture(ChannelProvider::new());
        f.task.start().await.unwrap();
        f.provider.push(Fix::now(1.0, 1.0)).await;
        wait_for_len(&f.buffer, 1).await;

        f.provider.suspend();
        for _ in 0..200 {
            if f.task.state().unwrap() == CaptureState::Stalled {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(f.task.state().unwrap(), CaptureState::Stalled);

        f.task.start().await.unwrap();
        assert_eq!(f.task.state().unwrap(), CaptureState::Armed);
        f.provider.push(Fix::now(2.0, 2.0)).await;
        wait_for_len(&f.buffer, 2).await;

        assert_eq!(f.task.status().unwrap().samples_appended, 2);
    }

    async fn wait_for_state(task: &CaptureTask, state: CaptureState) {
        for _ in 0..200 {
            if task.state().unwrap() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("capture never reached {state}");
    }

    #[tokio::test]
    async fn test_append_failure_faults_capture() {
        let f = fixture(ChannelProvider::new());
        f.task.start().await.unwrap();
        f.provider.push(Fix::now(1.0, 1.0)).await;
        wait_for_len(&f.buffer, 1).await;

        f.storage
            .with_conn(|conn| Ok(conn.execute_batch("DROP TABLE location_buffer")?))
            .unwrap();
        f.provider.push(Fix::now(2.0, 2.0)).await;
        wait_for_state(&f.task, CaptureState::Faulted).await;

        let fault = f.task.fault().unwrap().unwrap();
        assert!(fault.contains("database query failed"), "unexpected fault: {fault}");
        // The pump is gone: nothing is listening for further fixes.
        f.provider.push(Fix::now(3.0, 3.0)).await;
        assert_eq!(f.task.state().unwrap(), CaptureState::Faulted);

        f.task.stop().unwrap();
        assert_eq!(f.task.state().unwrap(), CaptureState::Idle);
        assert!(f.task.fault().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_subscribers_are_notified_after_append() {
        let f = fixture(ChannelProvider::new());
        let mut rx = f.task.subscribe();
        f.task.start().await.unwrap();

        f.provider.push(Fix::now(5.0, 6.0)).await;
        let sample = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert!((sample.latitude - 5.0).abs() < f64::EPSILON);
        assert_eq!(f.buffer.read_all().unwrap(), vec![sample]);
    }

    #[tokio::test]
    async fn test_record_current_position() {
        let f = fixture(ChannelProvider::new());
        f.provider.set_position(Fix::now(-23.5, -46.6));

        let sample = f.task.record_current_position().await.unwrap();
        assert_eq!(f.buffer.read_all().unwrap(), vec![sample]);
    }

    #[tokio::test]
    async fn test_status_reports_source_and_buffer() {
        let f = fixture(ChannelProvider::new());
        let status = f.task.status().unwrap();
        assert_eq!(status.state, CaptureState::Idle);
        assert_eq!(status.source, "channel");
        assert_eq!(status.buffered, 0);
    }

    #[test]
    fn test_capture_state_display() {
        assert_eq!(CaptureState::Idle.to_string(), "idle");
        assert_eq!(CaptureState::Armed.to_string(), "armed");
        assert_eq!(CaptureState::Stalled.to_string(), "stalled");
        assert_eq!(CaptureState::Faulted.to_string(), "faulted");
    }
}
