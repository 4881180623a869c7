//! Readers and replay: stored rows back onto the bus.

use std::sync::Arc;

use tracing::{info, warn};

use signalk_bus::Publisher;
use signalk_core::{Delta, PathValue, SingleValueMapped, Update};
use signalk_protocol::codec::encode_delta;
use signalk_protocol::RawMessage;

use crate::{StoreError, TimeRange, TimeSeriesStore};

/// Messages published between yields to the runtime.
const YIELD_EVERY: usize = 100;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    pub raw: u64,
    pub mapped: u64,
}

pub async fn load_raw(
    store: Arc<dyn TimeSeriesStore>,
    range: TimeRange,
) -> Result<Vec<RawMessage>, StoreError> {
    tokio::task::spawn_blocking(move || store.read_raw(range))
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}

pub async fn load_mapped(
    store: Arc<dyn TimeSeriesStore>,
    range: TimeRange,
) -> Result<Vec<SingleValueMapped>, StoreError> {
    tokio::task::spawn_blocking(move || store.read_mapped(range))
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}

/// Rebuild deltas from time-ordered rows. Consecutive rows sharing context,
/// timestamp and source become one update.
pub fn group_deltas(rows: Vec<SingleValueMapped>) -> Vec<Delta> {
    let mut deltas: Vec<Delta> = Vec::new();
    for row in rows {
        let pv = PathValue {
            path: row.path,
            value: row.value,
        };
        if let Some(last) = deltas.last_mut() {
            if let Some(update) = last.updates.last_mut() {
                if last.context == row.context
                    && update.timestamp == row.timestamp
                    && update.source == row.source
                {
                    update.values.push(pv);
                    continue;
                }
            }
        }
        deltas.push(Delta::single(
            row.context,
            Update {
                source: row.source,
                timestamp: row.timestamp,
                values: vec![pv],
            },
        ));
    }
    deltas
}

/// Publish the stored Raw and Mapped rows inside `range`. Either output
/// may be absent; its table is then not read.
pub async fn replay(
    store: Arc<dyn TimeSeriesStore>,
    range: TimeRange,
    raw_out: Option<&Publisher>,
    mapped_out: Option<&Publisher>,
) -> Result<ReplayStats, StoreError> {
    let mut stats = ReplayStats::default();

    if let Some(out) = raw_out {
        for (i, msg) in load_raw(store.clone(), range).await?.into_iter().enumerate() {
            match msg.encode() {
                Ok(bytes) => {
                    if out.publish(bytes).is_err() {
                        break;
                    }
                    stats.raw += 1;
                }
                Err(e) => warn!(uuid = %msg.uuid, error = %e, "skipping stored raw frame"),
            }
            if i % YIELD_EVERY == YIELD_EVERY - 1 {
                tokio::task::yield_now().await;
            }
        }
    }

    if let Some(out) = mapped_out {
        let deltas = group_deltas(load_mapped(store, range).await?);
        for (i, delta) in deltas.iter().enumerate() {
            match encode_delta(delta) {
                Ok(bytes) => {
                    if out.publish(bytes.into()).is_err() {
                        break;
                    }
                    stats.mapped += 1;
                }
                Err(e) => warn!(context = %delta.context, error = %e, "skipping stored delta"),
            }
            if i % YIELD_EVERY == YIELD_EVERY - 1 {
                tokio::task::yield_now().await;
            }
        }
    }

    info!(raw = stats.raw, mapped = stats.mapped, "replay finished");
    Ok(stats)
}
