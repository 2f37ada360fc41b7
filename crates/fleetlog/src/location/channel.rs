//! Provider fed programmatically.
//!
//! Used for tests and for embedding the core behind a host that receives
//! fixes from elsewhere (a phone bridge, a GPS daemon).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{Error, Result};

use super::{Fix, LocationProvider, PermissionStatus};

const SUBSCRIBER_CAPACITY: usize = 64;

/// A [`LocationProvider`] whose fixes are pushed by the caller.
#[derive(Debug)]
pub struct ChannelProvider {
    granted: AtomicBool,
    position: Mutex<Option<Fix>>,
    subscribers: Mutex<Vec<mpsc::Sender<Fix>>>,
}

impl ChannelProvider {
    /// A provider with permission granted.
    #[must_use]
    pub fn new() -> Self {
        Self {
            granted: AtomicBool::new(true),
            position: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// A provider whose permission request is denied.
    #[must_use]
    pub fn denied() -> Self {
        let provider = Self::new();
        provider.set_granted(false);
        provider
    }

    /// Change the answer to future permission requests.
    pub fn set_granted(&self, granted: bool) {
        self.granted.store(granted, Ordering::SeqCst);
    }

    /// Set the position reported by `current_position`.
    pub fn set_position(&self, fix: Fix) {
        if let Ok(mut position) = self.position.lock() {
            *position = Some(fix);
        }
    }

    /// Deliver a fix to every live subscriber, returning how many received it.
    ///
    /// The fix also becomes the current position.
    pub async fn push(&self, fix: Fix) -> usize {
        self.set_position(fix);
        let senders = self
            .subscribers
            .lock()
            .map(|subs| subs.clone())
            .unwrap_or_default();

        let mut delivered = 0;
        for tx in &senders {
            if tx.send(fix).await.is_ok() {
                delivered += 1;
            }
        }
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|tx| !tx.is_closed());
        }
        trace!(delivered, "Pushed fix");
        delivered
    }

    /// End every feed, as an OS does when it suspends the host process.
    pub fn suspend(&self) {
        if let Ok(mut subs) = self.subscribers.lock() {
            debug!(feeds = subs.len(), "Suspending location feeds");
            subs.clear();
        }
    }

    /// Number of feeds still attached.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

impl Default for ChannelProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl LocationProvider for ChannelProvider {
    fn name(&self) -> &'static str {
        "channel"
    }

    async fn request_permission(&self) -> PermissionStatus {
        if self.granted.load(Ordering::SeqCst) {
            PermissionStatus::granted()
        } else {
            PermissionStatus::not_granted()
        }
    }

    async fn current_position(&self) -> Result<Fix> {
        let position = *self.position.lock()?;
        position.ok_or_else(|| Error::location_unavailable("no fix has been pushed yet"))
    }

    async fn subscribe(&self, _cadence: Duration) -> Result<mpsc::Receiver<Fix>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.subscribers.lock()?.push(tx);
        Ok(rx)
    }
}
