//! Durable substrate for fleetlog.
//!
//! A single `SQLite` database holds the location buffer, the trip records and
//! the sync clock. [`Storage`] owns the connection behind a mutex; the
//! resource handles ([`LocationBuffer`](crate::buffer::LocationBuffer),
//! [`TripStore`](crate::trip::TripStore), [`SyncClock`](crate::sync::SyncClock))
//! share it through an `Arc` and every mutation runs while holding that lock.

pub mod migrations;
pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, error, info};

use crate::error::{Error, Result};

/// How long a connection waits on a lock held by another process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared `SQLite` connection and schema owner.
#[derive(Debug)]
pub struct Storage {
    /// Path to the database file.
    path: PathBuf,
    /// Database connection; the single-writer lock for every resource.
    conn: Mutex<Connection>,
}

impl Storage {
    /// Open or create a storage database at the given path.
    ///
    /// Creates the parent directories and database file if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema initialization fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening database at {}", path.display());
        let conn = Connection::open(&path).map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;

        // WAL lets the capture process and the CLI share the file.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::configure(&conn)?;
        migrations::initialize_schema(&conn)?;

        info!("Database opened successfully at {}", path.display());
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory storage instance for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: PathBuf::from(":memory:"),
            source,
        })?;

        Self::configure(&conn)?;
        migrations::initialize_schema(&conn)?;

        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn: Mutex::new(conn),
        })
    }

    fn configure(conn: &Connection) -> Result<()> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(())
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` with exclusive access to the connection.
    ///
    /// Storage faults returned by `f` are logged here before being handed
    /// back to the caller.
    ///
    /// # Errors
    ///
    /// Returns whatever `f` returns, or an internal error if the lock is poisoned.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock()?;
        let result = f(&mut *conn);
        if let Err(err) = &result {
            if err.is_storage_fault() {
                error!(error = %err, path = %self.path.display(), "Storage fault");
            }
        }
        result
    }

    /// Get database statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn stats(&self) -> Result<StorageStats> {
        let (buffered_samples, open_trips, closed_trips, stored_coords) =
            self.with_conn(|conn| {
                let counts = conn.query_row(
                    r"
                    SELECT
                        (SELECT COUNT(*) FROM location_buffer),
                        (SELECT COUNT(*) FROM trips WHERE status = 'open'),
                        (SELECT COUNT(*) FROM trips WHERE status = 'closed'),
                        (SELECT COUNT(*) FROM trip_coords)
                    ",
                    [],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    },
                )?;
                Ok(counts)
            })?;

        let db_size_bytes = if self.path.to_string_lossy() == ":memory:" {
            0
        } else {
            std::fs::metadata(&self.path).map_or(0, |m| m.len())
        };

        Ok(StorageStats {
            buffered_samples,
            open_trips,
            closed_trips,
            stored_coords,
            db_size_bytes,
        })
    }
}

/// Statistics about the storage.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StorageStats {
    /// Samples waiting in the location buffer.
    pub buffered_samples: i64,
    /// Trips currently open (across all users).
    pub open_trips: i64,
    /// Trips closed and retained as history.
    pub closed_trips: i64,
    /// Coordinates committed into closed trips.
    pub stored_coords: i64,
    /// Size of the database file in bytes.
    pub db_size_bytes: u64,
}
