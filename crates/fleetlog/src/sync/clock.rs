//! The persisted watermark of the last fully confirmed upload.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::error::{Error, Result};
use crate::sample::{millis_to_datetime, to_millis};
use crate::storage::Storage;

const LAST_SYNC_KEY: &str = "last_sync_at";

/// Handle to the sync clock.
///
/// Starts out unset ("never synced") and only ever moves forward.
#[derive(Debug, Clone)]
pub struct SyncClock {
    storage: Arc<Storage>,
}

impl SyncClock {
    /// Create a clock handle over the shared storage.
    #[must_use]
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// When the last full upload was confirmed, if ever.
    ///
    /// # Errors
    ///
    /// Returns a storage fault if the value cannot be read.
    pub fn last_sync(&self) -> Result<Option<DateTime<Utc>>> {
        self.storage.with_conn(|conn| read_in(conn))
    }

    /// Move the clock forward to `to`.
    ///
    /// `to` is truncated to whole milliseconds. The stored value becomes the
    /// later of its current value and `to`, in a single statement; the
    /// resulting value is returned.
    ///
    /// # Errors
    ///
    /// Returns a storage fault if the write fails.
    pub fn advance(&self, to: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let to = to_millis(to);
        let now = self.storage.with_conn(|conn| {
            conn.execute(
                r"
                INSERT INTO metadata (key, value) VALUES (?1, ?2)
                ON CONFLICT(key) DO UPDATE SET
                    value = CAST(MAX(CAST(value AS INTEGER), CAST(excluded.value AS INTEGER)) AS TEXT)
                ",
                params![LAST_SYNC_KEY, to.timestamp_millis().to_string()],
            )?;
            read_in(conn)?.ok_or_else(|| Error::internal("sync clock missing after advance"))
        })?;
        info!(last_sync = %now, "Sync clock advanced");
        Ok(now)
    }
}

/// Read the clock on an already-locked connection.
pub(crate) fn read_in(conn: &Connection) -> Result<Option<DateTime<Utc>>> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            [LAST_SYNC_KEY],
            |row| row.get(0),
        )
        .optional()?;

    value
        .map(|v| {
            let millis = v
                .parse::<i64>()
                .map_err(|e| Error::corrupt("metadata", format!("bad {LAST_SYNC_KEY} '{v}': {e}")))?;
            millis_to_datetime("metadata", millis)
        })
        .transpose()
}
