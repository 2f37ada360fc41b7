//! `SQLite` schema definitions for fleetlog.
//!
//! Timestamps are stored as unix milliseconds so that ordering and the
//! pending-sync comparison happen on integers.

/// Samples captured for the currently open trip, in capture order.
pub const CREATE_LOCATION_BUFFER_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS location_buffer (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    sample_key TEXT NOT NULL UNIQUE,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    captured_at INTEGER NOT NULL
)
";

/// Permanent trip records.
pub const CREATE_TRIPS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS trips (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    license_plate TEXT NOT NULL,
    description TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('open', 'closed')),
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
)
";

/// Coordinate history of closed trips.
pub const CREATE_TRIP_COORDS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS trip_coords (
    trip_id TEXT NOT NULL REFERENCES trips(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    captured_at INTEGER NOT NULL,
    PRIMARY KEY (trip_id, position)
)
";

/// Index backing history listings (per user, newest first).
pub const CREATE_TRIPS_USER_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_trips_user_created ON trips(user_id, created_at DESC)
";

/// Partial unique index: at most one open trip per user.
pub const CREATE_ONE_OPEN_TRIP_INDEX: &str = r"
CREATE UNIQUE INDEX IF NOT EXISTS idx_trips_one_open_per_user ON trips(user_id)
WHERE status = 'open'
";

/// SQL statement to create the metadata table for storing key-value pairs.
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// Base schema statements (version 1), in order.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    CREATE_LOCATION_BUFFER_TABLE,
    CREATE_TRIPS_TABLE,
    CREATE_TRIP_COORDS_TABLE,
    CREATE_TRIPS_USER_INDEX,
    CREATE_METADATA_TABLE,
];
