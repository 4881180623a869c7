//! In-memory backend, used when no database file is configured and in
//! tests.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use uuid::Uuid;

use signalk_core::{SingleValueMapped, SnapshotError, SnapshotSource};
use signalk_protocol::RawMessage;

use crate::{nanos, StoreError, TimeRange, TimeSeriesStore};

type MappedKey = (i64, String, String);

#[derive(Default)]
pub struct MemoryStore {
    raw: RwLock<BTreeMap<(i64, Uuid), RawMessage>>,
    mapped: RwLock<BTreeMap<MappedKey, SingleValueMapped>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raw_len(&self) -> usize {
        self.raw.read().len()
    }

    pub fn mapped_len(&self) -> usize {
        self.mapped.read().len()
    }
}

impl TimeSeriesStore for MemoryStore {
    fn write_raw(&self, batch: &[RawMessage]) -> Result<(), StoreError> {
        let mut raw = self.raw.write();
        for msg in batch {
            raw.insert((nanos(msg.timestamp)?, msg.uuid), msg.clone());
        }
        Ok(())
    }

    fn write_mapped(&self, batch: &[SingleValueMapped]) -> Result<(), StoreError> {
        let mut mapped = self.mapped.write();
        for value in batch {
            let key = (nanos(value.timestamp)?, value.context.clone(), value.path.clone());
            mapped.insert(key, value.clone());
        }
        Ok(())
    }

    fn read_raw(&self, range: TimeRange) -> Result<Vec<RawMessage>, StoreError> {
        Ok(self
            .raw
            .read()
            .values()
            .filter(|m| range.contains(m.timestamp))
            .cloned()
            .collect())
    }

    fn read_mapped(&self, range: TimeRange) -> Result<Vec<SingleValueMapped>, StoreError> {
        Ok(self
            .mapped
            .read()
            .values()
            .filter(|v| range.contains(v.timestamp))
            .cloned()
            .collect())
    }

    fn latest_mapped(&self) -> Result<Vec<SingleValueMapped>, StoreError> {
        let mapped = self.mapped.read();
        let mut latest: HashMap<(&str, &str), &SingleValueMapped> = HashMap::new();
        // keys are time ordered, so later rows overwrite earlier ones
        for value in mapped.values() {
            latest.insert((value.context.as_str(), value.path.as_str()), value);
        }
        let mut rows: Vec<SingleValueMapped> = latest.into_values().cloned().collect();
        rows.sort_by(|a, b| (&a.context, &a.path).cmp(&(&b.context, &b.path)));
        Ok(rows)
    }

    fn delete(&self, range: TimeRange) -> Result<usize, StoreError> {
        let mut raw = self.raw.write();
        let mut mapped = self.mapped.write();
        let before = raw.len() + mapped.len();
        raw.retain(|_, m| !range.contains(m.timestamp));
        mapped.retain(|_, v| !range.contains(v.timestamp));
        Ok(before - raw.len() - mapped.len())
    }
}

impl SnapshotSource for MemoryStore {
    fn latest(&self) -> Result<Vec<SingleValueMapped>, SnapshotError> {
        self.latest_mapped()
            .map_err(|e| SnapshotError(e.to_string()))
    }
}
