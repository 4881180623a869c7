//! # signalk-store
//!
//! Persistence for the Raw and Mapped streams.
//!
//! - [`TimeSeriesStore`]: the read/write/delete contract, with SQLite and
//!   in-memory backends
//! - [`writer`]: batched multi-worker writer fed from the bus
//! - [`replay`] and [`mqtt`]: the transfer role, re-publishing stored
//!   data onto the bus or to an MQTT broker

pub mod buffer;
pub mod config;
pub mod memory;
pub mod mqtt;
pub mod replay;
pub mod sqlite;
pub mod writer;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use signalk_core::{SingleValueMapped, SnapshotError, SnapshotSource};
use signalk_protocol::RawMessage;

pub use buffer::BatchBuffer;
pub use config::{DatabaseConfig, MqttConfig, StoreConfig, TransferConfig};
pub use memory::MemoryStore;
pub use mqtt::{BridgeError, BridgeStats, MqttBridge};
pub use replay::{group_deltas, replay, ReplayStats};
pub use sqlite::SqliteStore;
pub use writer::{run_retention, run_store_writer, Record, StoreWriter, WriterStats};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("stored value: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("timestamp outside the storable range")]
    Timestamp,

    #[error("store task failed: {0}")]
    Task(String),
}

/// Half-open time window `[from, to)`. A missing bound is unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    /// Everything strictly older than `to`.
    pub fn before(to: DateTime<Utc>) -> Self {
        Self { from: None, to: Some(to) }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| at >= from) && self.to.map_or(true, |to| at < to)
    }

    /// Bounds as nanoseconds since the epoch, saturated to the `i64` range.
    pub fn as_nanos(&self) -> (i64, i64) {
        let from = self
            .from
            .and_then(|t| t.timestamp_nanos_opt())
            .unwrap_or(i64::MIN);
        let to = self
            .to
            .and_then(|t| t.timestamp_nanos_opt())
            .unwrap_or(i64::MAX);
        (from, to)
    }
}

/// The operations the pipeline needs from a time-series backend.
///
/// Writes are idempotent on the table keys, so a retried batch never
/// duplicates rows. Reads return rows in time order.
pub trait TimeSeriesStore: Send + Sync {
    fn write_raw(&self, batch: &[RawMessage]) -> Result<(), StoreError>;

    fn write_mapped(&self, batch: &[SingleValueMapped]) -> Result<(), StoreError>;

    fn read_raw(&self, range: TimeRange) -> Result<Vec<RawMessage>, StoreError>;

    fn read_mapped(&self, range: TimeRange) -> Result<Vec<SingleValueMapped>, StoreError>;

    /// Most recent row per (context, path).
    fn latest_mapped(&self) -> Result<Vec<SingleValueMapped>, StoreError>;

    /// Delete rows of both tables inside `range`. Returns the row count.
    fn delete(&self, range: TimeRange) -> Result<usize, StoreError>;
}

/// Serves snapshots from a store.
#[derive(Clone)]
pub struct StoreSnapshot(pub Arc<dyn TimeSeriesStore>);

impl SnapshotSource for StoreSnapshot {
    fn latest(&self) -> Result<Vec<SingleValueMapped>, SnapshotError> {
        self.0
            .latest_mapped()
            .map_err(|e| SnapshotError(e.to_string()))
    }
}

/// Open the backend named by `config`: SQLite when a path is set,
/// otherwise an in-memory store.
pub fn open(config: &DatabaseConfig) -> Result<Arc<dyn TimeSeriesStore>, StoreError> {
    match &config.path {
        Some(path) => Ok(Arc::new(SqliteStore::open(path)?)),
        None => Ok(Arc::new(MemoryStore::new())),
    }
}

pub(crate) fn nanos(at: DateTime<Utc>) -> Result<i64, StoreError> {
    at.timestamp_nanos_opt().ok_or(StoreError::Timestamp)
}
