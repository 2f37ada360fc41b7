//! Durable, append-only buffer of samples for the open trip.
//!
//! The buffer is persisted independently of the trip record so capture can
//! begin the moment a trip opens and so a process restart never loses
//! in-flight samples. There is exactly one active buffer; it is drained into
//! the trip when the trip closes and cleared when the trip is cancelled.

use std::sync::Arc;

use rusqlite::{params, Connection};
use tracing::{debug, trace};

use crate::error::Result;
use crate::sample::{millis_to_datetime, LocationSample};
use crate::storage::Storage;

const TABLE: &str = "location_buffer";

/// Handle to the location buffer.
#[derive(Debug, Clone)]
pub struct LocationBuffer {
    storage: Arc<Storage>,
}

impl LocationBuffer {
    /// Create a buffer handle over the shared storage.
    #[must_use]
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Durably append a sample.
    ///
    /// Returns `false` when an identical sample (same position and capture
    /// millisecond) is already buffered, so redelivery after a crash does not
    /// duplicate it.
    ///
    /// # Errors
    ///
    /// Returns a storage fault if the write is rejected.
    pub fn append(&self, sample: &LocationSample) -> Result<bool> {
        let inserted = self.storage.with_conn(|conn| append_in(conn, sample))?;
        if inserted {
            trace!(
                latitude = sample.latitude,
                longitude = sample.longitude,
                "Buffered location sample"
            );
        } else {
            debug!("Skipping duplicate location sample");
        }
        Ok(inserted)
    }

    /// Read every buffered sample in capture order.
    ///
    /// # Errors
    ///
    /// Returns a storage fault if the medium cannot be read.
    pub fn read_all(&self) -> Result<Vec<LocationSample>> {
        self.storage.with_conn(|conn| read_all_in(conn))
    }

    /// Remove all buffered samples, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns a storage fault if the medium is unavailable.
    pub fn clear(&self) -> Result<usize> {
        let removed = self.storage.with_conn(|conn| clear_in(conn))?;
        debug!(removed, "Cleared location buffer");
        Ok(removed)
    }

    /// Number of buffered samples.
    ///
    /// # Errors
    ///
    /// Returns a storage fault if the medium cannot be read.
    pub fn len(&self) -> Result<usize> {
        self.storage.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM location_buffer", [], |row| row.get(0))?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
    }

    /// Whether the buffer holds no samples.
    ///
    /// # Errors
    ///
    /// Returns a storage fault if the medium cannot be read.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

pub(crate) fn append_in(conn: &Connection, sample: &LocationSample) -> Result<bool> {
    let affected = conn.execute(
        r"
        INSERT OR IGNORE INTO location_buffer (sample_key, latitude, longitude, captured_at)
        VALUES (?1, ?2, ?3, ?4)
        ",
        params![
            sample.key(),
            sample.latitude,
            sample.longitude,
            sample.captured_at_millis(),
        ],
    )?;
    Ok(affected > 0)
}

pub(crate) fn read_all_in(conn: &Connection) -> Result<Vec<LocationSample>> {
    let mut stmt = conn.prepare(
        "SELECT latitude, longitude, captured_at FROM location_buffer ORDER BY seq ASC",
    )?;
    let rows = stmt
        .query_map([], |row| {
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
                captured_at: millis_to_datetime(TABLE, millis)?,
            })
        })
        .collect()
}

pub(crate) fn clear_in(conn: &Connection) -> Result<usize> {
    Ok(conn.execute("DELETE FROM location_buffer", [])?)
}
