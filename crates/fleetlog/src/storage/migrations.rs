//! Schema versioning for the fleetlog database.
//!
//! Base tables are created idempotently on every open. The version lives in
//! the `metadata` table; numbered steps bring an older file up to
//! [`CURRENT_VERSION`] inside one transaction, so a failed upgrade leaves the
//! file as it was.

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::error::{Error, Result};

use super::schema::{CREATE_ONE_OPEN_TRIP_INDEX, SCHEMA_STATEMENTS};

/// The current schema version.
pub const CURRENT_VERSION: i32 = 2;

const VERSION_KEY: &str = "schema_version";

/// Create the base tables and apply pending migrations.
///
/// # Errors
///
/// Returns an error if the file was written by a newer fleetlog, or if
/// schema creation or a migration step fails.
pub fn initialize_schema(conn: &Connection) -> Result<()> {
    for statement in SCHEMA_STATEMENTS {
        conn.execute(statement, [])?;
    }

    match get_schema_version(conn)? {
        v if v > CURRENT_VERSION => Err(Error::DatabaseMigration {
            message: format!(
                "database schema version {v} is newer than supported version {CURRENT_VERSION}"
            ),
        }),
        v if v < CURRENT_VERSION => upgrade(conn, v),
        _ => Ok(()),
    }
}

/// Stored schema version; 0 for a fresh file.
fn get_schema_version(conn: &Connection) -> Result<i32> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            [VERSION_KEY],
            |row| row.get(0),
        )
        .optional()?;

    stored.map_or(Ok(0), |value| {
        value.parse().map_err(|_| Error::DatabaseMigration {
            message: format!("invalid schema version: {value}"),
        })
    })
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT INTO metadata (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (VERSION_KEY, version.to_string()),
    )?;
    Ok(())
}

fn upgrade(conn: &Connection, from: i32) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    for version in (from + 1)..=CURRENT_VERSION {
        apply(&tx, version)?;
        info!(version, "Applied schema migration");
    }
    set_schema_version(&tx, CURRENT_VERSION)?;
    tx.commit()?;
    Ok(())
}

fn apply(conn: &Connection, version: i32) -> Result<()> {
    match version {
        // The base tables are the version 1 schema.
        1 => Ok(()),
        2 => enforce_one_open_trip(conn),
        _ => Err(Error::DatabaseMigration {
            message: format!("unknown migration version: {version}"),
        }),
    }
}

/// Version 2: the single-open-trip rule becomes a partial unique index.
///
/// Fails if the file already holds two open trips for one user.
fn enforce_one_open_trip(conn: &Connection) -> Result<()> {
    conn.execute(CREATE_ONE_OPEN_TRIP_INDEX, [])
        .map_err(|e| Error::DatabaseMigration {
            message: format!("cannot enforce one open trip per user: {e}"),
        })?;
    Ok(())
}
