//! Location samples.
//!
//! A [`LocationSample`] is a single position fix captured while a trip is
//! open. Samples are immutable once created; they live in the
//! [`LocationBuffer`](crate::buffer::LocationBuffer) until the trip closes and
//! are then moved into the trip's coordinate history.

use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A single captured position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
    /// When the position was captured.
    pub captured_at: DateTime<Utc>,
}

impl LocationSample {
    /// Create a new sample.
    ///
    /// `captured_at` is truncated to whole milliseconds, the precision the
    /// buffer persists, so a sample reads back equal to what was appended.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the coordinates are not finite or fall
    /// outside the valid latitude/longitude ranges.
    pub fn new(latitude: f64, longitude: f64, captured_at: DateTime<Utc>) -> Result<Self> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(Error::validation(
                "latitude",
                format!("{latitude} is outside [-90, 90]"),
            ));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(Error::validation(
                "longitude",
                format!("{longitude} is outside [-180, 180]"),
            ));
        }
        Ok(Self {
            latitude,
            longitude,
            captured_at: to_millis(captured_at),
        })
    }

    /// Create a sample stamped with the current time.
    ///
    /// # Errors
    ///
    /// See [`LocationSample::new`].
    pub fn now(latitude: f64, longitude: f64) -> Result<Self> {
        Self::new(latitude, longitude, Utc::now())
    }

    /// Capture time as unix milliseconds (the persisted representation).
    #[must_use]
    pub fn captured_at_millis(&self) -> i64 {
        self.captured_at.timestamp_millis()
    }

    /// Stable deduplication key for this sample.
    ///
    /// Two samples with bit-identical coordinates and the same capture
    /// millisecond share a key, which lets the buffer ignore a fix that is
    /// redelivered after a restart.
    #[must_use]
    pub fn key(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.latitude.to_bits().to_le_bytes());
        hasher.update(&self.longitude.to_bits().to_le_bytes());
        hasher.update(&self.captured_at_millis().to_le_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

/// Truncate a timestamp to whole milliseconds.
#[must_use]
pub fn to_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(3)
}

/// The current time at millisecond precision.
#[must_use]
pub fn now_millis() -> DateTime<Utc> {
    to_millis(Utc::now())
}

/// Convert persisted unix milliseconds back into a UTC timestamp.
///
/// # Errors
///
/// Returns a corrupt record error naming `table` if the value is out of range.
pub(crate) fn millis_to_datetime(table: &'static str, millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| Error::corrupt(table, format!("timestamp {millis} out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    #[test]
    fn test_new_valid_sample() {
        let sample = LocationSample::new(-23.55, -46.63, at(1_000)).unwrap();
        assert!((sample.latitude - -23.55).abs() < f64::EPSILON);
        assert_eq!(sample.captured_at_millis(), 1_000);
    }

    #[test]
    fn test_new_rejects_out_of_range_latitude() {
        let err = LocationSample::new(91.0, 0.0, at(0)).unwrap_err();
        assert!(err.is_validation_error());
        assert!(err.to_string().contains("latitude"));
    }

    #[test]
    fn test_new_rejects_out_of_range_longitude() {
        let err = LocationSample::new(0.0, -180.5, at(0)).unwrap_err();
        assert!(err.to_string().contains("longitude"));
    }

    #[test]
    fn test_new_rejects_nan() {
        assert!(LocationSample::new(f64::NAN, 0.0, at(0)).is_err());
        assert!(LocationSample::new(0.0, f64::INFINITY, at(0)).is_err());
    }

    #[test]
    fn test_key_is_stable() {
        let a = LocationSample::new(10.0, 20.0, at(5)).unwrap();
        let b = LocationSample::new(10.0, 20.0, at(5)).unwrap();
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_key_differs_by_time_and_position() {
        let base = LocationSample::new(10.0, 20.0, at(5)).unwrap();
        let later = LocationSample::new(10.0, 20.0, at(6)).unwrap();
        let moved = LocationSample::new(10.000_001, 20.0, at(5)).unwrap();
        assert_ne!(base.key(), later.key());
        assert_ne!(base.key(), moved.key());
    }

    #[test]
    fn test_new_truncates_to_millis() {
        let precise = at(1_700_000_000_141) + chrono::Duration::nanoseconds(242_449);
        let sample = LocationSample::new(10.0, 20.0, precise).unwrap();
        assert_eq!(sample.captured_at, at(1_700_000_000_141));

        let current = LocationSample::now(10.0, 20.0).unwrap();
        assert_eq!(current.captured_at.timestamp_subsec_nanos() % 1_000_000, 0);
    }

    #[test]
    fn test_millis_to_datetime() {
        assert_eq!(millis_to_datetime("t", 42).unwrap().timestamp_millis(), 42);
        assert!(millis_to_datetime("t", i64::MAX).is_err());
    }

    #[test]
    fn test_sample_serialization() {
        let sample = LocationSample::new(1.5, 2.5, at(1_700_000_000_000)).unwrap();
        let json = serde_json::to_string(&sample).unwrap();
        assert!(json.contains("captured_at"));
        let back: LocationSample = serde_json::from_str(&json).unwrap();
        assert_eq!(sample, back);
    }
}
