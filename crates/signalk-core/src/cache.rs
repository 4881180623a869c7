//! Latest-value cache.
//!
//! Holds the most recent reading for every (context, path) pair seen on the
//! Mapped stream. Writes resolve by timestamp, so replays and out-of-order
//! deltas never move a value backwards.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::model::{Delta, PathValue, SingleValueMapped, Update};

/// Failure to produce a latest-value snapshot.
#[derive(Debug, Clone, thiserror::Error)]
#[error("snapshot unavailable: {0}")]
pub struct SnapshotError(pub String);

/// Anything that can list the latest reading per (context, path).
///
/// Implemented by the in-memory cache and by the time-series store backends.
pub trait SnapshotSource: Send + Sync {
    fn latest(&self) -> Result<Vec<SingleValueMapped>, SnapshotError>;
}

/// In-memory map of (context, path) to the newest reading.
#[derive(Debug, Clone, Default)]
pub struct LatestValueCache {
    entries: HashMap<(String, String), SingleValueMapped>,
    ttl: Option<Duration>,
}

impl LatestValueCache {
    /// Create an empty cache that never evicts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty cache whose entries expire after `ttl`.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl: Some(ttl),
        }
    }

    /// Insert one reading. Returns true if it became the latest value.
    pub fn insert(&mut self, value: SingleValueMapped) -> bool {
        let key = (value.context.clone(), value.path.clone());
        match self.entries.get(&key) {
            Some(existing) if existing.timestamp > value.timestamp => false,
            _ => {
                self.entries.insert(key, value);
                true
            }
        }
    }

    /// Apply every value of a delta. Returns how many entries changed.
    pub fn apply_delta(&mut self, delta: &Delta) -> usize {
        delta
            .single_values()
            .into_iter()
            .filter(|v| self.insert(v.clone()))
            .count()
    }

    /// Look up the latest reading for a (context, path).
    pub fn get(&self, context: &str, path: &str) -> Option<&SingleValueMapped> {
        self.entries.get(&(context.to_string(), path.to_string()))
    }

    /// Drop entries older than the configured TTL, relative to `now`.
    pub fn evict_expired(&mut self, now: DateTime<Utc>) -> usize {
        let Some(ttl) = self.ttl else {
            return 0;
        };
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return 0;
        };
        let before = self.entries.len();
        self.entries.retain(|_, v| now - v.timestamp <= ttl);
        before - self.entries.len()
    }

    /// All latest readings, ordered by context then path.
    pub fn snapshot(&self) -> Vec<SingleValueMapped> {
        let mut values: Vec<SingleValueMapped> = self.entries.values().cloned().collect();
        values.sort_by(|a, b| (&a.context, &a.path).cmp(&(&b.context, &b.path)));
        values
    }

    /// Rebuild deltas for the readings accepted by `filter`, one delta per
    /// context and one update per (source, timestamp).
    pub fn deltas_matching<F>(&self, mut filter: F) -> Vec<Delta>
    where
        F: FnMut(&str, &str) -> bool,
    {
        let mut by_context: BTreeMap<String, Vec<SingleValueMapped>> = BTreeMap::new();
        for value in self.snapshot() {
            if filter(&value.context, &value.path) {
                by_context
                    .entry(value.context.clone())
                    .or_default()
                    .push(value);
            }
        }

        by_context
            .into_iter()
            .map(|(context, values)| {
                let mut updates: Vec<Update> = Vec::new();
                for v in values {
                    let pv = PathValue {
                        path: v.path,
                        value: v.value,
                    };
                    match updates
                        .iter_mut()
                        .find(|u| u.source == v.source && u.timestamp == v.timestamp)
                    {
                        Some(update) => update.values.push(pv),
                        None => updates.push(Update {
                            source: v.source,
                            timestamp: v.timestamp,
                            values: vec![pv],
                        }),
                    }
                }
                Delta { context, updates }
            })
            .collect()
    }

    /// Number of cached (context, path) pairs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl SnapshotSource for parking_lot::RwLock<LatestValueCache> {
    fn latest(&self) -> Result<Vec<SingleValueMapped>, SnapshotError> {
        Ok(self.read().snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Source;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn reading(context: &str, path: &str, value: f64, secs: i64) -> SingleValueMapped {
        SingleValueMapped {
            context: context.to_string(),
            path: path.to_string(),
            value: serde_json::json!(value),
            timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            source: Source::new("test", "nmea0183"),
        }
    }

    #[test]
    fn test_last_write_wins_by_timestamp() {
        let mut cache = LatestValueCache::new();
        assert!(cache.insert(reading("vessels.a", "navigation.speedOverGround", 1.0, 10)));
        assert!(cache.insert(reading("vessels.a", "navigation.speedOverGround", 2.0, 20)));
        // older reading arrives late
        assert!(!cache.insert(reading("vessels.a", "navigation.speedOverGround", 3.0, 15)));

        let v = cache.get("vessels.a", "navigation.speedOverGround").unwrap();
        assert_eq!(v.value, serde_json::json!(2.0));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_snapshot_equals_max_by_timestamp_fold() {
        let inserts = vec![
            reading("vessels.a", "x", 1.0, 5),
            reading("vessels.b", "x", 2.0, 1),
            reading("vessels.a", "x", 3.0, 2),
            reading("vessels.a", "y", 4.0, 7),
            reading("vessels.b", "x", 5.0, 9),
        ];
        let mut cache = LatestValueCache::new();
        for r in &inserts {
            cache.insert(r.clone());
        }

        let mut expected: HashMap<(String, String), SingleValueMapped> = HashMap::new();
        for r in inserts {
            let key = (r.context.clone(), r.path.clone());
            let keep = match expected.get(&key) {
                Some(e) => e.timestamp <= r.timestamp,
                None => true,
            };
            if keep {
                expected.insert(key, r);
            }
        }
        let mut expected: Vec<_> = expected.into_values().collect();
        expected.sort_by(|a, b| (&a.context, &a.path).cmp(&(&b.context, &b.path)));

        assert_eq!(cache.snapshot(), expected);
    }

    #[test]
    fn test_ttl_eviction() {
        let mut cache = LatestValueCache::with_ttl(Duration::from_secs(30));
        cache.insert(reading("vessels.a", "old", 1.0, 0));
        cache.insert(reading("vessels.a", "new", 1.0, 50));

        let now = Utc.timestamp_opt(1_700_000_000 + 60, 0).unwrap();
        assert_eq!(cache.evict_expired(now), 1);
        assert!(cache.get("vessels.a", "old").is_none());
        assert!(cache.get("vessels.a", "new").is_some());
    }

    #[test]
    fn test_no_ttl_never_evicts() {
        let mut cache = LatestValueCache::new();
        cache.insert(reading("vessels.a", "old", 1.0, 0));
        let now = Utc.timestamp_opt(1_800_000_000, 0).unwrap();
        assert_eq!(cache.evict_expired(now), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_deltas_matching_groups_by_context() {
        let mut cache = LatestValueCache::new();
        cache.insert(reading("vessels.a", "navigation.speedOverGround", 1.0, 1));
        cache.insert(reading("vessels.a", "navigation.headingTrue", 2.0, 1));
        cache.insert(reading("vessels.b", "navigation.speedOverGround", 3.0, 1));
        cache.insert(reading("vessels.a", "environment.depth.belowKeel", 4.0, 1));

        let deltas = cache.deltas_matching(|ctx, path| {
            ctx == "vessels.a" && path.starts_with("navigation.")
        });
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].context, "vessels.a");
        assert_eq!(deltas[0].updates.len(), 1);
        assert_eq!(deltas[0].value_count(), 2);
    }
}
