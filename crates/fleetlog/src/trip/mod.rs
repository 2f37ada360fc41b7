//! Trip records and their lifecycle.
//!
//! A trip is one vehicle-usage session: opened on departure, closed on
//! arrival (when the buffered samples become its coordinate history) or
//! deleted if cancelled while still open.

mod plate;
pub mod store;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::sample::LocationSample;

pub use plate::{validate_description, LicensePlate};
pub use store::{History, TripStore};

/// Lifecycle state of a trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripStatus {
    /// In progress; location is being captured.
    Open,
    /// Finalized and kept as history.
    Closed,
}

impl TripStatus {
    /// The persisted representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for TripStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TripStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            other => Err(Error::corrupt("trips", format!("unknown status '{other}'"))),
        }
    }
}

/// The permanent record of a trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// Owner of the trip.
    pub user_id: String,
    /// Vehicle plate, normalized.
    pub license_plate: LicensePlate,
    /// Purpose of the trip (never blank).
    pub description: String,
    /// Lifecycle state.
    pub status: TripStatus,
    /// Coordinate history in capture order; empty while the trip is open.
    pub coords: Vec<LocationSample>,
    /// When the trip was opened.
    pub created_at: DateTime<Utc>,
    /// Last mutation of the record.
    pub updated_at: DateTime<Utc>,
}

impl TripRecord {
    /// Whether the trip is still in progress.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status == TripStatus::Open
    }

    /// Lightweight view used for sync classification.
    #[must_use]
    pub fn marker(&self) -> TripMarker {
        TripMarker {
            id: self.id,
            status: self.status,
            updated_at: self.updated_at,
        }
    }
}

/// One line of the trip history shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    /// Trip identifier.
    pub id: Uuid,
    /// Vehicle plate.
    pub license_plate: LicensePlate,
    /// Human-formatted departure time, e.g. `Departed 05/03/2024 at 14:07`.
    pub created: String,
    /// Whether the trip has been confirmed uploaded.
    pub synced: bool,
}

impl HistoryEntry {
    /// Build the entry for `trip`.
    #[must_use]
    pub fn new(trip: &TripRecord, synced: bool) -> Self {
        Self {
            id: trip.id,
            license_plate: trip.license_plate.clone(),
            created: format_departure(trip.created_at),
            synced,
        }
    }
}

/// Format a departure time as `Departed DD/MM/YYYY at HH:MM` (UTC).
#[must_use]
pub fn format_departure(at: DateTime<Utc>) -> String {
    at.format("Departed %d/%m/%Y at %H:%M").to_string()
}

/// Identity, status and last mutation time of a trip, without its coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TripMarker {
    /// Trip identifier.
    pub id: Uuid,
    /// Lifecycle state.
    pub status: TripStatus,
    /// Last mutation of the record.
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_through_str() {
        for status in [TripStatus::Open, TripStatus::Closed] {
            assert_eq!(status.as_str().parse::<TripStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_status_rejects_free_text() {
        let err = "departure".parse::<TripStatus>().unwrap_err();
        assert!(err.to_string().contains("departure"));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(TripStatus::Open.to_string(), "open");
        assert_eq!(TripStatus::Closed.to_string(), "closed");
    }

    #[test]
    fn test_marker_copies_sync_fields() {
        let now = Utc::now();
        let trip = TripRecord {
            id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            license_plate: LicensePlate::parse("ABC1234").unwrap(),
            description: "delivery".to_string(),
            status: TripStatus::Closed,
            coords: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        let marker = trip.marker();
        assert_eq!(marker.id, trip.id);
        assert_eq!(marker.status, TripStatus::Closed);
        assert_eq!(marker.updated_at, now);
        assert!(!trip.is_open());
    }

    #[test]
    fn test_format_departure() {
        use chrono::TimeZone;
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 59).unwrap();
        assert_eq!(format_departure(at), "Departed 05/03/2024 at 14:07");
    }

    #[test]
    fn test_history_entry() {
        use chrono::TimeZone;
        let at = Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 0).unwrap();
        let trip = TripRecord {
            id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            license_plate: LicensePlate::parse("BRA2E19").unwrap(),
            description: "delivery".to_string(),
            status: TripStatus::Closed,
            coords: Vec::new(),
            created_at: at,
            updated_at: at,
        };
        let entry = HistoryEntry::new(&trip, true);
        assert_eq!(entry.id, trip.id);
        assert_eq!(entry.license_plate.as_str(), "BRA2E19");
        assert_eq!(entry.created, "Departed 31/12/2023 at 23:59");
        assert!(entry.synced);
    }

    #[test]
    fn test_trip_serialization() {
        let now = Utc::now();
        let trip = TripRecord {
            id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            license_plate: LicensePlate::parse("ABC1234").unwrap(),
            description: "delivery".to_string(),
            status: TripStatus::Open,
            coords: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        let json = serde_json::to_string(&trip).unwrap();
        assert!(json.contains("\"status\":\"open\""));
        assert!(json.contains("\"license_plate\":\"ABC1234\""));
    }
}
