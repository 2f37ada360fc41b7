//! Location sources.
//!
//! A [`LocationProvider`] is the platform's location capability: it can be
//! asked for permission, for a one-off position, and for a continuous feed
//! of [`Fix`]es at a cadence. The [`LocationSampler`] arms a provider and
//! turns its raw fixes into validated [`LocationSample`](crate::LocationSample)s.

mod channel;
mod replay;
mod sampler;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

pub use channel::ChannelProvider;
pub use replay::{ReplayProvider, Waypoint};
pub use sampler::{LocationSampler, SampleStream};

/// A raw position reported by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
    /// When the provider took the fix.
    pub timestamp: DateTime<Utc>,
}

impl Fix {
    /// A fix taken now.
    #[must_use]
    pub fn now(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            timestamp: Utc::now(),
        }
    }
}

/// Outcome of a permission request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionStatus {
    /// Whether always-on location access is granted.
    pub is_granted: bool,

    /// Human-readable description of the status.
    pub description: String,
}

impl PermissionStatus {
    /// Create a new granted status.
    #[must_use]
    pub fn granted() -> Self {
        Self {
            is_granted: true,
            description: "Background location permission is granted".to_string(),
        }
    }

    /// Create a new not-granted status.
    #[must_use]
    pub fn not_granted() -> Self {
        Self {
            is_granted: false,
            description: "Background location permission is not granted".to_string(),
        }
    }
}

/// Instructions shown when location permission is missing.
#[must_use]
pub fn permission_instructions() -> &'static str {
    r"To record trips the device must share its location at all times:

1. Open the system location settings
2. Find 'fleetlog' in the list of applications
3. Set location access to 'Always'

Then start the trip again."
}

/// A platform location capability.
#[async_trait::async_trait]
pub trait LocationProvider: Send + Sync + std::fmt::Debug {
    /// The name of this provider (for logging/debugging).
    fn name(&self) -> &'static str;

    /// Ask for always-on location access.
    async fn request_permission(&self) -> PermissionStatus;

    /// Read the current position once.
    ///
    /// # Errors
    ///
    /// Returns an error if no position is available.
    async fn current_position(&self) -> Result<Fix>;

    /// Start a feed of fixes at `cadence`.
    ///
    /// The feed stops when the receiver is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the feed cannot be started.
    async fn subscribe(&self, cadence: Duration) -> Result<mpsc::Receiver<Fix>>;
}
