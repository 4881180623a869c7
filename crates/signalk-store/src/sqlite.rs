//! SQLite backend.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE raw_data (
//!     time_ns   INTEGER NOT NULL,
//!     uuid      BLOB    NOT NULL,
//!     connector TEXT    NOT NULL,
//!     protocol  TEXT    NOT NULL,
//!     payload   BLOB    NOT NULL,
//!     PRIMARY KEY (time_ns, uuid)
//! );
//! CREATE TABLE mapped_data (
//!     time_ns INTEGER NOT NULL,
//!     context TEXT    NOT NULL,
//!     path    TEXT    NOT NULL,
//!     value   TEXT    NOT NULL,  -- JSON
//!     source  TEXT    NOT NULL,  -- JSON
//!     PRIMARY KEY (time_ns, context, path)
//! );
//! ```
//!
//! The connection is not `Sync`, so it sits behind a mutex; callers on the
//! async runtime go through `spawn_blocking`.

use bytes::Bytes;
use chrono::DateTime;
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use tracing::info;
use uuid::Uuid;

use signalk_core::{SingleValueMapped, SnapshotError, SnapshotSource};
use signalk_protocol::RawMessage;

use crate::{nanos, StoreError, TimeRange, TimeSeriesStore};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS raw_data (
    time_ns   INTEGER NOT NULL,
    uuid      BLOB    NOT NULL,
    connector TEXT    NOT NULL,
    protocol  TEXT    NOT NULL,
    payload   BLOB    NOT NULL,
    PRIMARY KEY (time_ns, uuid)
);
CREATE TABLE IF NOT EXISTS mapped_data (
    time_ns INTEGER NOT NULL,
    context TEXT    NOT NULL,
    path    TEXT    NOT NULL,
    value   TEXT    NOT NULL,
    source  TEXT    NOT NULL,
    PRIMARY KEY (time_ns, context, path)
);
CREATE INDEX IF NOT EXISTS idx_mapped_key ON mapped_data(context, path, time_ns);
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database file at `path`.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        let store = Self::with_connection(conn)?;
        info!(path = %path, journal = %mode, "opened sqlite store");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_raw(row: &Row) -> rusqlite::Result<(i64, Vec<u8>, String, String, Vec<u8>)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
    }

    fn row_to_mapped(row: &Row) -> rusqlite::Result<(i64, String, String, String, String)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
    }

    fn raw_from_row(
        (time_ns, uuid, connector, protocol, payload): (i64, Vec<u8>, String, String, Vec<u8>),
    ) -> Result<RawMessage, StoreError> {
        let uuid = Uuid::from_slice(&uuid).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(RawMessage {
            timestamp: DateTime::from_timestamp_nanos(time_ns),
            uuid,
            connector,
            protocol,
            payload: Bytes::from(payload),
        })
    }

    fn mapped_from_row(
        (time_ns, context, path, value, source): (i64, String, String, String, String),
    ) -> Result<SingleValueMapped, StoreError> {
        Ok(SingleValueMapped {
            context,
            path,
            value: serde_json::from_str(&value)?,
            timestamp: DateTime::from_timestamp_nanos(time_ns),
            source: serde_json::from_str(&source)?,
        })
    }
}

impl TimeSeriesStore for SqliteStore {
    fn write_raw(&self, batch: &[RawMessage]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO raw_data (time_ns, uuid, connector, protocol, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for msg in batch {
                stmt.execute(params![
                    nanos(msg.timestamp)?,
                    msg.uuid.as_bytes().as_slice(),
                    msg.connector,
                    msg.protocol,
                    msg.payload.as_ref(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn write_mapped(&self, batch: &[SingleValueMapped]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO mapped_data (time_ns, context, path, value, source)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for value in batch {
                stmt.execute(params![
                    nanos(value.timestamp)?,
                    value.context,
                    value.path,
                    serde_json::to_string(&value.value)?,
                    serde_json::to_string(&value.source)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn read_raw(&self, range: TimeRange) -> Result<Vec<RawMessage>, StoreError> {
        let (from, to) = range.as_nanos();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT time_ns, uuid, connector, protocol, payload
             FROM raw_data
             WHERE time_ns >= ?1 AND time_ns < ?2
             ORDER BY time_ns ASC",
        )?;
        let rows = stmt
            .query_map(params![from, to], Self::row_to_raw)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(Self::raw_from_row).collect()
    }

    fn read_mapped(&self, range: TimeRange) -> Result<Vec<SingleValueMapped>, StoreError> {
        let (from, to) = range.as_nanos();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT time_ns, context, path, value, source
             FROM mapped_data
             WHERE time_ns >= ?1 AND time_ns < ?2
             ORDER BY time_ns ASC, context ASC, path ASC",
        )?;
        let rows = stmt
            .query_map(params![from, to], Self::row_to_mapped)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(Self::mapped_from_row).collect()
    }

    fn latest_mapped(&self) -> Result<Vec<SingleValueMapped>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT m.time_ns, m.context, m.path, m.value, m.source
             FROM mapped_data m
             JOIN (SELECT context, path, MAX(time_ns) AS time_ns
                   FROM mapped_data
                   GROUP BY context, path) latest
               ON m.context = latest.context
              AND m.path = latest.path
              AND m.time_ns = latest.time_ns
             ORDER BY m.context ASC, m.path ASC",
        )?;
        let rows = stmt
            .query_map([], Self::row_to_mapped)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(Self::mapped_from_row).collect()
    }

    fn delete(&self, range: TimeRange) -> Result<usize, StoreError> {
        let (from, to) = range.as_nanos();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let raw = tx.execute(
            "DELETE FROM raw_data WHERE time_ns >= ?1 AND time_ns < ?2",
            params![from, to],
        )?;
        let mapped = tx.execute(
            "DELETE FROM mapped_data WHERE time_ns >= ?1 AND time_ns < ?2",
            params![from, to],
        )?;
        tx.commit()?;
        Ok(raw + mapped)
    }
}

impl SnapshotSource for SqliteStore {
    fn latest(&self) -> Result<Vec<SingleValueMapped>, SnapshotError> {
        self.latest_mapped()
            .map_err(|e| SnapshotError(e.to_string()))
    }
}
