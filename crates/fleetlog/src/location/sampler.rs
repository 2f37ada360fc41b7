//! Turns a provider's raw fixes into validated samples.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::sample::LocationSample;

use super::{permission_instructions, Fix, LocationProvider};

/// Arms a [`LocationProvider`] at a fixed cadence.
#[derive(Debug, Clone)]
pub struct LocationSampler {
    provider: Arc<dyn LocationProvider>,
    cadence: Duration,
}

impl LocationSampler {
    /// Create a sampler over `provider` producing one sample per `cadence`.
    #[must_use]
    pub fn new(provider: Arc<dyn LocationProvider>, cadence: Duration) -> Self {
        Self { provider, cadence }
    }

    /// Name of the underlying provider.
    #[must_use]
    pub fn source(&self) -> &'static str {
        self.provider.name()
    }

    /// Sampling cadence.
    #[must_use]
    pub fn cadence(&self) -> Duration {
        self.cadence
    }

    /// Request always-on location access.
    ///
    /// # Errors
    ///
    /// Returns `PermissionMissing` with remediation instructions if access
    /// is denied.
    pub async fn ensure_permission(&self) -> Result<()> {
        let status = self.provider.request_permission().await;
        if status.is_granted {
            debug!(source = self.source(), "Location permission granted");
            Ok(())
        } else {
            warn!(source = self.source(), "Location permission denied");
            Err(Error::permission_missing(
                "background location",
                permission_instructions(),
            ))
        }
    }

    /// Read the current position as a validated sample.
    ///
    /// # Errors
    ///
    /// Returns the provider's error, or a validation error for an
    /// out-of-range fix.
    pub async fn current_position(&self) -> Result<LocationSample> {
        let fix = self.provider.current_position().await?;
        to_sample(fix)
    }

    /// Start a new stream of samples.
    ///
    /// Each call subscribes afresh; a stream that has ended cannot be
    /// restarted.
    ///
    /// # Errors
    ///
    /// Returns the provider's error if the feed cannot be started.
    pub async fn arm(&self) -> Result<SampleStream> {
        let rx = self.provider.subscribe(self.cadence).await?;
        debug!(
            source = self.source(),
            cadence_ms = self.cadence.as_millis(),
            "Location sampler armed"
        );
        Ok(SampleStream {
            rx,
            source: self.source(),
        })
    }
}

/// A consumed-once stream of validated samples.
///
/// Dropping the stream cancels the provider's feed.
#[derive(Debug)]
pub struct SampleStream {
    rx: mpsc::Receiver<Fix>,
    source: &'static str,
}

impl SampleStream {
    /// Wait for the next valid sample; `None` once the feed has ended.
    ///
    /// Fixes with out-of-range or non-finite coordinates are skipped.
    pub async fn next(&mut self) -> Option<LocationSample> {
        while let Some(fix) = self.rx.recv().await {
            match to_sample(fix) {
                Ok(sample) => return Some(sample),
                Err(e) => {
                    warn!(source = self.source, error = %e, "Discarding invalid fix");
                }
            }
        }
        debug!(source = self.source, "Location feed ended");
        None
    }
}

fn to_sample(fix: Fix) -> Result<LocationSample> {
    LocationSample::new(fix.latitude, fix.longitude, fix.timestamp)
}
