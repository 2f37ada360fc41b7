//! Provider that replays a recorded route.
//!
//! The route is a JSON array of waypoints:
//!
//! ```json
//! [{"latitude": -23.55, "longitude": -46.63}, {"latitude": -23.56, "longitude": -46.64}]
//! ```
//!
//! One waypoint is emitted per cadence tick, stamped with the emission time.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info};

use crate::error::{Error, Result};

use super::{Fix, LocationProvider, PermissionStatus};

/// A point on a replayed route.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
}

/// Replays a fixed route at the sampling cadence.
#[derive(Debug, Clone)]
pub struct ReplayProvider {
    route: Arc<Vec<Waypoint>>,
    looping: bool,
    channel_capacity: usize,
    cursor: Arc<AtomicUsize>,
}

impl ReplayProvider {
    /// Create a provider over `route`.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the route is empty.
    pub fn new(route: Vec<Waypoint>, looping: bool) -> Result<Self> {
        if route.is_empty() {
            return Err(Error::validation("route", "a replay route needs at least one waypoint"));
        }
        Ok(Self {
            route: Arc::new(route),
            looping,
            channel_capacity: 64,
            cursor: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Load a route from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or is empty.
    pub fn from_file(path: impl AsRef<Path>, looping: bool) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let route: Vec<Waypoint> = serde_json::from_str(&contents)?;
        info!(path = %path.display(), waypoints = route.len(), "Loaded replay route");
        Self::new(route, looping)
    }

    /// Set the capacity of each feed's channel.
    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Number of waypoints in the route.
    #[must_use]
    pub fn len(&self) -> usize {
        self.route.len()
    }

    /// Whether the route has no waypoints (never true for a constructed provider).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.route.is_empty()
    }

    fn waypoint(&self, index: usize) -> Waypoint {
        self.route[index % self.route.len()]
    }
}

#[async_trait::async_trait]
impl LocationProvider for ReplayProvider {
    fn name(&self) -> &'static str {
        "replay"
    }

    async fn request_permission(&self) -> PermissionStatus {
        PermissionStatus::granted()
    }

    async fn current_position(&self) -> Result<Fix> {
        let point = self.waypoint(self.cursor.load(Ordering::SeqCst));
        Ok(Fix::now(point.latitude, point.longitude))
    }

    async fn subscribe(&self, cadence: Duration) -> Result<mpsc::Receiver<Fix>> {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let route = Arc::clone(&self.route);
        let cursor = Arc::clone(&self.cursor);
        let looping = self.looping;

        tokio::spawn(async move {
            let mut ticker = interval(cadence);
            loop {
                ticker.tick().await;
                let index = cursor.load(Ordering::SeqCst);
                if index >= route.len() && !looping {
                    debug!("Replay route finished");
                    break;
                }
                let point = route[index % route.len()];
                if tx.send(Fix::now(point.latitude, point.longitude)).await.is_err() {
                    debug!("Capture channel closed, stopping replay");
                    break;
                }
                cursor.store(index + 1, Ordering::SeqCst);
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route() -> Vec<Waypoint> {
        vec![
            Waypoint {
                latitude: 1.0,
                longitude: 1.0,
            },
            Waypoint {
                latitude: 2.0,
                longitude: 2.0,
            },
        ]
    }

    #[test]
    fn test_empty_route_rejected() {
        assert!(ReplayProvider::new(Vec::new(), true)
            .unwrap_err()
            .is_validation_error());
    }

    #[tokio::test]
    async fn test_replays_route_once() {
        let provider = ReplayProvider::new(route(), false).unwrap();
        let mut rx = provider.subscribe(Duration::from_millis(1)).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!((first.latitude - 1.0).abs() < f64::EPSILON);
        assert!((second.latitude - 2.0).abs() < f64::EPSILON);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_looping_route_wraps() {
        let provider = ReplayProvider::new(route(), true).unwrap();
        let mut rx = provider.subscribe(Duration::from_millis(1)).await.unwrap();

        let mut lats = Vec::new();
        for _ in 0..3 {
            lats.push(rx.recv().await.unwrap().latitude);
        }
        assert_eq!(lats, vec![1.0, 2.0, 1.0]);
    }

    #[tokio::test]
    async fn test_resubscribe_continues_from_cursor() {
        let provider = ReplayProvider::new(route(), false).unwrap();
        // The first tick fires immediately; the second would take an hour.
        let mut rx = provider.subscribe(Duration::from_secs(3600)).await.unwrap();
        assert!(rx.recv().await.is_some());
        drop(rx);

        let mut rx = provider.subscribe(Duration::from_secs(3600)).await.unwrap();
        let next = rx.recv().await.unwrap();
        assert!((next.latitude - 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_current_position_is_first_waypoint_before_replay() {
        let provider = ReplayProvider::new(route(), true).unwrap();
        let fix = provider.current_position().await.unwrap();
        assert!((fix.latitude - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("route.json");
        std::fs::write(&path, serde_json::to_string(&route()).unwrap()).unwrap();

        let provider = ReplayProvider::from_file(&path, false).unwrap();
        assert_eq!(provider.len(), 2);
    }

    #[test]
    fn test_from_file_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("route.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(
            ReplayProvider::from_file(&path, false),
            Err(Error::Json(_))
        ));
    }
}
