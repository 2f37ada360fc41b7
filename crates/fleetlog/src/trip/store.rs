//! Durable store of trip records and owner of the trip lifecycle.
//!
//! ```text
//!   open_trip ──► Open ──close_trip──► Closed (kept as history)
//!                  │
//!                  └──cancel_trip──► (deleted)
//! ```
//!
//! Closing is a single `SQLite` transaction: read the buffer, append it to the
//! trip's coordinates, flip the status, clear the buffer. The storage lock is
//! held throughout, so a sample arriving from the capture context mid-close
//! waits and then lands in the emptied buffer for the next trip.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use crate::buffer;
use crate::capture::CaptureTask;
use crate::error::{Error, Result};
use crate::sample::{millis_to_datetime, now_millis, to_millis, LocationSample};
use crate::storage::Storage;
use crate::sync::clock;

use super::{validate_description, LicensePlate, TripMarker, TripRecord, TripStatus};

/// Rows fetched per page while walking history.
const HISTORY_PAGE_SIZE: usize = 50;

const TRIP_COLUMNS: &str =
    "id, user_id, license_plate, description, status, created_at, updated_at";

/// Store of [`TripRecord`]s.
#[derive(Debug, Clone)]
pub struct TripStore {
    storage: Arc<Storage>,
    capture: Option<Arc<CaptureTask>>,
}

impl TripStore {
    /// Create a store over the shared storage.
    #[must_use]
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            capture: None,
        }
    }

    /// Attach the capture task that closing and cancelling should stop.
    #[must_use]
    pub fn with_capture(mut self, capture: Arc<CaptureTask>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Open a new trip for `user_id`.
    ///
    /// The caller is expected to start capture afterwards.
    ///
    /// # Errors
    ///
    /// - `Validation` if the plate, description or user id is malformed.
    /// - `Conflict` if the user already has an open trip.
    /// - A storage fault if the record cannot be written.
    pub fn open_trip(
        &self,
        user_id: &str,
        license_plate: &str,
        description: &str,
    ) -> Result<TripRecord> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(Error::validation("user_id", "a user is required"));
        }
        let license_plate = LicensePlate::parse(license_plate)?;
        let description = validate_description(description)?;

        let now = now_millis();
        let trip = TripRecord {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            license_plate,
            description,
            status: TripStatus::Open,
            coords: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        self.storage.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if let Some(existing) = find_open_id(&tx, &trip.user_id)? {
                return Err(Error::conflict(format!(
                    "user {} already has open trip {existing}",
                    trip.user_id
                )));
            }
            tx.execute(
                r"
                INSERT INTO trips (id, user_id, license_plate, description, status, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ",
                params![
                    trip.id.to_string(),
                    trip.user_id,
                    trip.license_plate.as_str(),
                    trip.description,
                    trip.status.as_str(),
                    trip.created_at.timestamp_millis(),
                    trip.updated_at.timestamp_millis(),
                ],
            )
            .map_err(|e| open_conflict_or(e, &trip.user_id))?;
            tx.commit()?;
            Ok(())
        })?;

        info!(
            trip_id = %trip.id,
            user_id = %trip.user_id,
            plate = %trip.license_plate,
            "Trip opened"
        );
        Ok(trip)
    }

    /// Close an open trip, moving the buffered samples into its coordinates.
    ///
    /// Capture is stopped only after the close has committed.
    ///
    /// # Errors
    ///
    /// - `NotFound` if no trip has this id.
    /// - `InvalidState` if the trip is already closed.
    /// - A storage fault if the transaction fails (nothing is changed).
    pub fn close_trip(&self, id: Uuid) -> Result<TripRecord> {
        let trip = self.storage.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut trip = load_trip(&tx, id)?.ok_or_else(|| Error::not_found(id))?;
            if trip.status != TripStatus::Open {
                return Err(Error::invalid_state(id, trip.status, "close"));
            }

            let samples = buffer::read_all_in(&tx)?;
            let updated_at = next_update_time(now_millis(), clock::read_in(&tx)?);

            insert_coords(&tx, id, trip.coords.len(), &samples)?;
            tx.execute(
                "UPDATE trips SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![
                    id.to_string(),
                    TripStatus::Closed.as_str(),
                    updated_at.timestamp_millis(),
                ],
            )?;
            buffer::clear_in(&tx)?;
            tx.commit()?;

            trip.coords.extend(samples);
            trip.status = TripStatus::Closed;
            trip.updated_at = updated_at;
            Ok(trip)
        })?;

        info!(trip_id = %id, coords = trip.coords.len(), "Trip closed");
        self.stop_capture()?;
        Ok(trip)
    }

    /// Cancel an open trip: delete it and discard the buffer.
    ///
    /// # Errors
    ///
    /// - `NotFound` if no trip has this id.
    /// - `InvalidState` if the trip is closed.
    /// - A storage fault if the transaction fails.
    pub fn cancel_trip(&self, id: Uuid) -> Result<()> {
        let discarded = self.storage.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let status = load_status(&tx, id)?.ok_or_else(|| Error::not_found(id))?;
            if status != TripStatus::Open {
                return Err(Error::invalid_state(id, status, "cancel"));
            }
            tx.execute("DELETE FROM trips WHERE id = ?1", [id.to_string()])?;
            let discarded = buffer::clear_in(&tx)?;
            tx.commit()?;
            Ok(discarded)
        })?;

        info!(trip_id = %id, discarded, "Trip cancelled");
        self.stop_capture()
    }

    /// Fetch a trip by id, including its coordinates.
    ///
    /// # Errors
    ///
    /// Returns a storage fault if the read fails.
    pub fn get(&self, id: Uuid) -> Result<Option<TripRecord>> {
        self.storage.with_conn(|conn| load_trip(conn, id))
    }

    /// The user's open trip, if any.
    ///
    /// # Errors
    ///
    /// Returns a storage fault if the read fails.
    pub fn find_open(&self, user_id: &str) -> Result<Option<TripRecord>> {
        self.storage.with_conn(|conn| match find_open_id(conn, user_id)? {
            Some(id) => load_trip(conn, id),
            None => Ok(None),
        })
    }

    /// Closed trips of `user_id`, newest first, fetched lazily page by page.
    #[must_use]
    pub fn list_history(&self, user_id: &str) -> History<'_> {
        History::new(self, user_id, HISTORY_PAGE_SIZE)
    }

    /// Sync markers of every trip.
    ///
    /// # Errors
    ///
    /// Returns a storage fault if the read fails.
    pub fn markers(&self) -> Result<Vec<TripMarker>> {
        self.storage.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, status, updated_at FROM trips")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(id, status, updated_at)| {
                    Ok(TripMarker {
                        id: parse_id(&id)?,
                        status: status.parse()?,
                        updated_at: millis_to_datetime("trips", updated_at)?,
                    })
                })
                .collect()
        })
    }

    fn stop_capture(&self) -> Result<()> {
        match &self.capture {
            Some(capture) => capture.stop(),
            None => Ok(()),
        }
    }

    fn history_page(
        &self,
        user_id: &str,
        after: Option<&(i64, String)>,
        limit: usize,
    ) -> Result<Vec<TripRecord>> {
        self.storage.with_conn(|conn| {
            let (cursor_created, cursor_id) = match after {
                Some((created, id)) => (Some(*created), Some(id.as_str())),
                None => (None, None),
            };
            let mut stmt = conn.prepare(&format!(
                r"
                SELECT {TRIP_COLUMNS} FROM trips
                WHERE user_id = ?1 AND status = 'closed'
                  AND (?2 IS NULL OR created_at < ?2 OR (created_at = ?2 AND id < ?3))
                ORDER BY created_at DESC, id DESC
                LIMIT ?4
                "
            ))?;
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let rows = stmt
                .query_map(
                    params![user_id, cursor_created, cursor_id, limit],
                    TripRow::from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|row| {
                    let coords = load_coords(conn, &row.id)?;
                    row.into_record(coords)
                })
                .collect()
        })
    }
}

/// Lazy, newest-first iterator over a user's closed trips.
///
/// Each page is read under a short storage lock; the lock is not held
/// between pages.
#[derive(Debug)]
pub struct History<'a> {
    store: &'a TripStore,
    user_id: String,
    page_size: usize,
    page: VecDeque<TripRecord>,
    cursor: Option<(i64, String)>,
    exhausted: bool,
}

impl<'a> History<'a> {
    fn new(store: &'a TripStore, user_id: &str, page_size: usize) -> Self {
        Self {
            store,
            user_id: user_id.to_string(),
            page_size: page_size.max(1),
            page: VecDeque::new(),
            cursor: None,
            exhausted: false,
        }
    }
}

impl Iterator for History<'_> {
    type Item = Result<TripRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.exhausted {
            match self
                .store
                .history_page(&self.user_id, self.cursor.as_ref(), self.page_size)
            {
                Ok(page) => {
                    self.exhausted = page.len() < self.page_size;
                    if let Some(last) = page.last() {
                        self.cursor = Some((last.created_at.timestamp_millis(), last.id.to_string()));
                    }
                    debug!(user_id = %self.user_id, rows = page.len(), "Fetched history page");
                    self.page.extend(page);
                }
                Err(err) => {
                    self.exhausted = true;
                    return Some(Err(err));
                }
            }
        }
        self.page.pop_front().map(Ok)
    }
}

/// Primitive columns of a `trips` row.
struct TripRow {
    id: String,
    user_id: String,
    license_plate: String,
    description: String,
    status: String,
    created_at: i64,
    updated_at: i64,
}

impl TripRow {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            license_plate: row.get(2)?,
            description: row.get(3)?,
            status: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_record(self, coords: Vec<LocationSample>) -> Result<TripRecord> {
        Ok(TripRecord {
            id: parse_id(&self.id)?,
            user_id: self.user_id,
            license_plate: LicensePlate::parse(&self.license_plate)
                .map_err(|e| Error::corrupt("trips", e.to_string()))?,
            description: self.description,
            status: self.status.parse()?,
            coords,
            created_at: millis_to_datetime("trips", self.created_at)?,
            updated_at: millis_to_datetime("trips", self.updated_at)?,
        })
    }
}

fn parse_id(id: &str) -> Result<Uuid> {
    Uuid::parse_str(id).map_err(|e| Error::corrupt("trips", format!("bad id '{id}': {e}")))
}

/// The update time for a closing trip: now, but at least one millisecond
/// after the last confirmed sync so the trip reads as pending until the next
/// upload. Both sides compare at the persisted millisecond precision.
fn next_update_time(now: DateTime<Utc>, last_sync: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = to_millis(now);
    match last_sync.map(to_millis) {
        Some(last) if now <= last => last + Duration::milliseconds(1),
        _ => now,
    }
}

/// Map a violation of the one-open-trip index to a conflict.
fn open_conflict_or(err: rusqlite::Error, user_id: &str) -> Error {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
            Error::conflict(format!("user {user_id} already has an open trip"))
        }
        _ => err.into(),
    }
}

fn find_open_id(conn: &Connection, user_id: &str) -> Result<Option<Uuid>> {
    let id: Option<String> = conn
        .query_row(
            "SELECT id FROM trips WHERE user_id = ?1 AND status = 'open'",
            [user_id],
            |row| row.get(0),
        )
        .optional()?;
    id.as_deref().map(parse_id).transpose()
}

fn load_status(conn: &Connection, id: Uuid) -> Result<Option<TripStatus>> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM trips WHERE id = ?1",
            [id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    status.as_deref().map(str::parse).transpose()
}

fn load_trip(conn: &Connection, id: Uuid) -> Result<Option<TripRecord>> {
    let row = conn
        .query_row(
            &format!("SELECT {TRIP_COLUMNS} FROM trips WHERE id = ?1"),
            [id.to_string()],
            TripRow::from_row,
        )
        .optional()?;

    match row {
        Some(row) => {
            let coords = load_coords(conn, &row.id)?;
            row.into_record(coords).map(Some)
        }
        None => Ok(None),
    }
}

fn load_coords(conn: &Connection, trip_id: &str) -> Result<Vec<LocationSample>> {
    let mut stmt = conn.prepare(
        r"
        SELECT latitude, longitude, captured_at FROM trip_coords
        WHERE trip_id = ?1 ORDER BY position ASC
        ",
    )?;
    let rows = stmt
        .query_map([trip_id], |row| {
            Ok((
                row.get::<_, f64>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(latitude, longitude, millis)| {
            Ok(LocationSample {
                latitude,
                longitude,
                captured_at: millis_to_datetime("trip_coords", millis)?,
            })
        })
        .collect()
}

fn insert_coords(
    conn: &Connection,
    trip_id: Uuid,
    start: usize,
    samples: &[LocationSample],
) -> Result<()> {
    let mut stmt = conn.prepare(
        r"
        INSERT INTO trip_coords (trip_id, position, latitude, longitude, captured_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ",
    )?;
    let trip_id = trip_id.to_string();
    for (offset, sample) in samples.iter().enumerate() {
        let position = i64::try_from(start + offset)
            .map_err(|_| Error::internal("coordinate position overflow"))?;
        stmt.execute(params![
            trip_id,
            position,
            sample.latitude,
            sample.longitude,
            sample.captured_at_millis(),
        ])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::buffer::LocationBuffer;
    use crate::sync::SyncClock;

    struct Fixture {
        store: TripStore,
        buffer: LocationBuffer,
        clock: SyncClock,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(Storage::open_in_memory().expect("failed to create test storage"));
        Fixture {
            store: TripStore::new(Arc::clone(&storage)),
            buffer: LocationBuffer::new(Arc::clone(&storage)),
            clock: SyncClock::new(storage),
        }
    }

    fn sample(lat: f64, lon: f64, millis: i64) -> LocationSample {
        LocationSample::new(lat, lon, Utc.timestamp_millis_opt(millis).unwrap()).unwrap()
    }

    #[test]
    fn test_open_trip_creates_open_record() {
        let f = fixture();
        let trip = f.store.open_trip("u1", "abc1234", " delivery ").unwrap();

        assert_eq!(trip.status, TripStatus::Open);
        assert!(trip.coords.is_empty());
        assert_eq!(trip.license_plate.as_str(), "ABC1234");
        assert_eq!(trip.description, "delivery");
        assert_eq!(f.store.get(trip.id).unwrap(), Some(trip));
    }

    #[test]
    fn test_open_trip_rejects_invalid_plate() {
        let f = fixture();
        let err = f.store.open_trip("u1", "123", "delivery").unwrap_err();
        assert!(err.is_validation_error());
        assert!(f.store.find_open("u1").unwrap().is_none());
    }

    #[test]
    fn test_open_trip_rejects_blank_description() {
        let f = fixture();
        let err = f.store.open_trip("u1", "ABC1234", "   ").unwrap_err();
        assert!(err.is_validation_error());
    }

    #[test]
    fn test_open_trip_rejects_blank_user() {
        let f = fixture();
        assert!(f.store.open_trip(" ", "ABC1234", "x").unwrap_err().is_validation_error());
    }

    #[test]
    fn test_second_open_trip_conflicts() {
        let f = fixture();
        f.store.open_trip("u1", "ABC1234", "delivery").unwrap();

        let err = f.store.open_trip("u1", "XYZ9876", "pickup").unwrap_err();
        assert!(err.is_conflict());

        // Other users are unaffected.
        assert!(f.store.open_trip("u2", "XYZ9876", "pickup").is_ok());
    }

    #[test]
    fn test_close_trip_moves_buffer_into_coords() {
        let f = fixture();
        let trip = f.store.open_trip("u1", "ABC1234", "delivery").unwrap();
        f.buffer.append(&sample(10.0, 20.0, 1)).unwrap();
        f.buffer.append(&sample(11.0, 21.0, 2)).unwrap();

        let closed = f.store.close_trip(trip.id).unwrap();

        assert_eq!(closed.status, TripStatus::Closed);
        assert_eq!(
            closed.coords,
            vec![sample(10.0, 20.0, 1), sample(11.0, 21.0, 2)]
        );
        assert!(closed.updated_at >= trip.updated_at);
        assert!(f.buffer.is_empty().unwrap());
        assert_eq!(f.store.get(trip.id).unwrap(), Some(closed));
    }

    #[test]
    fn test_close_trip_twice_is_invalid_state() {
        let f = fixture();
        let trip = f.store.open_trip("u1", "ABC1234", "delivery").unwrap();
        f.store.close_trip(trip.id).unwrap();

        let err = f.store.close_trip(trip.id).unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[test]
    fn test_close_unknown_trip_is_not_found() {
        let f = fixture();
        assert!(f.store.close_trip(Uuid::new_v4()).unwrap_err().is_not_found());
    }

    #[test]
    fn test_close_allows_reopening() {
        let f = fixture();
        let trip = f.store.open_trip("u1", "ABC1234", "delivery").unwrap();
        f.store.close_trip(trip.id).unwrap();
        assert!(f.store.open_trip("u1", "ABC1234", "return").is_ok());
    }

    #[test]
    fn test_close_updates_after_sync_clock() {
        let f = fixture();
        let trip = f.store.open_trip("u1", "ABC1234", "delivery").unwrap();
        let future = f.clock.advance(now_millis() + Duration::hours(1)).unwrap();

        let closed = f.store.close_trip(trip.id).unwrap();
        assert_eq!(closed.updated_at, future + Duration::milliseconds(1));
        assert_eq!(f.store.get(trip.id).unwrap(), Some(closed));
    }

    #[test]
    fn test_cancel_restores_pre_open_state() {
        let f = fixture();
        let before = f.store.markers().unwrap();
        let trip = f.store.open_trip("u1", "ABC1234", "delivery").unwrap();
        f.buffer.append(&sample(1.0, 2.0, 3)).unwrap();

        f.store.cancel_trip(trip.id).unwrap();

        assert_eq!(f.store.markers().unwrap(), before);
        assert!(f.store.get(trip.id).unwrap().is_none());
        assert!(f.buffer.is_empty().unwrap());
    }

    #[test]
    fn test_cancel_closed_trip_is_invalid_state() {
        let f = fixture();
        let trip = f.store.open_trip("u1", "ABC1234", "delivery").unwrap();
        f.store.close_trip(trip.id).unwrap();

        assert!(f.store.cancel_trip(trip.id).unwrap_err().is_invalid_state());
        assert!(f.store.get(trip.id).unwrap().is_some());
    }

    #[test]
    fn test_cancel_unknown_trip_is_not_found() {
        let f = fixture();
        assert!(f.store.cancel_trip(Uuid::new_v4()).unwrap_err().is_not_found());
    }

    #[test]
    fn test_find_open() {
        let f = fixture();
        assert!(f.store.find_open("u1").unwrap().is_none());
        let trip = f.store.open_trip("u1", "ABC1234", "delivery").unwrap();
        assert_eq!(f.store.find_open("u1").unwrap().map(|t| t.id), Some(trip.id));
    }

    #[test]
    fn test_history_lists_closed_trips_newest_first() {
        let f = fixture();
        let mut closed_ids = Vec::new();
        for i in 0..3 {
            let trip = f
                .store
                .open_trip("u1", "ABC1234", &format!("trip {i}"))
                .unwrap();
            f.store.close_trip(trip.id).unwrap();
            closed_ids.push(trip.id);
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        f.store.open_trip("u1", "ABC1234", "still open").unwrap();
        let other = f.store.open_trip("u2", "ABC1234", "other user").unwrap();
        f.store.close_trip(other.id).unwrap();

        let history: Vec<Uuid> = f
            .store
            .list_history("u1")
            .map(|t| t.unwrap().id)
            .collect();
        closed_ids.reverse();
        assert_eq!(history, closed_ids);
    }

    #[test]
    fn test_history_pages_through_all_rows() {
        let f = fixture();
        for i in 0..7 {
            let trip = f.store.open_trip("u1", "ABC1234", &format!("t{i}")).unwrap();
            f.store.close_trip(trip.id).unwrap();
        }

        let history: Vec<TripRecord> = History::new(&f.store, "u1", 3)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(history.len(), 7);
        for pair in history.windows(2) {
            assert!(pair[0].created_at >= pair[1].created_at);
        }
        let mut ids: Vec<_> = history.iter().map(|t| t.id).collect();
        ids.dedup();
        assert_eq!(ids.len(), 7);
    }

    #[test]
    fn test_history_empty() {
        let f = fixture();
        assert_eq!(f.store.list_history("nobody").count(), 0);
    }

    #[test]
    fn test_markers() {
        let f = fixture();
        let open = f.store.open_trip("u1", "ABC1234", "a").unwrap();
        let closed = f.store.open_trip("u2", "ABC1234", "b").unwrap();
        f.store.close_trip(closed.id).unwrap();

        let markers = f.store.markers().unwrap();
        assert_eq!(markers.len(), 2);
        assert!(markers
            .iter()
            .any(|m| m.id == open.id && m.status == TripStatus::Open));
        assert!(markers
            .iter()
            .any(|m| m.id == closed.id && m.status == TripStatus::Closed));
    }

    #[test]
    fn test_next_update_time() {
        let now = Utc.timestamp_millis_opt(1_000).unwrap();
        assert_eq!(next_update_time(now, None), now);
        let earlier = Utc.timestamp_millis_opt(500).unwrap();
        assert_eq!(next_update_time(now, Some(earlier)), now);
        assert_eq!(next_update_time(now, Some(now)).timestamp_millis(), 1_001);
    }

    #[test]
    fn test_next_update_time_within_sync_millisecond() {
        let synced = Utc.timestamp_millis_opt(1_000).unwrap();
        let same_millis = synced + Duration::microseconds(500);

        let updated = next_update_time(same_millis, Some(synced));
        assert_eq!(updated.timestamp_millis(), 1_001);
        assert!(updated.timestamp_millis() > synced.timestamp_millis());
    }
}
