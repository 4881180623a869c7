//! Per-(context, path) minimum-interval filter.
//!
//! A delta is forwarded when any of its readings is new or has waited at
//! least its interval since the last forwarded reading for that pair. On
//! forward every pair in the delta restarts its interval together, so
//! correlated values (position, SOG, COG from one fix) stay coherent.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::Delta;

fn default_interval_ms() -> u64 {
    1000
}

/// Intervals applied by [`RateLimitFilter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    /// Interval for paths without an override, in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub default_interval: u64,

    /// Path to interval overrides, in milliseconds.
    #[serde(default)]
    pub rate_limits: HashMap<String, u64>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_interval: default_interval_ms(),
            rate_limits: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    /// Minimum spacing for readings on `path`.
    pub fn interval_for(&self, path: &str) -> Duration {
        let ms = self
            .rate_limits
            .get(path)
            .copied()
            .unwrap_or(self.default_interval);
        Duration::from_millis(ms)
    }
}

/// Stateful filter; one per filter stage.
#[derive(Debug, Clone)]
pub struct RateLimitFilter {
    config: RateLimitConfig,
    last_forwarded: HashMap<(String, String), DateTime<Utc>>,
}

impl RateLimitFilter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            last_forwarded: HashMap::new(),
        }
    }

    /// Decide whether `delta` passes. Records the forward when it does.
    pub fn check(&mut self, delta: &Delta) -> bool {
        let readings = delta.single_values();
        if readings.is_empty() {
            return false;
        }

        let expired = readings.iter().any(|r| {
            match self
                .last_forwarded
                .get(&(r.context.clone(), r.path.clone()))
            {
                None => true,
                Some(last) => {
                    let interval = self.config.interval_for(&r.path);
                    match chrono::Duration::from_std(interval) {
                        Ok(interval) => r.timestamp - *last >= interval,
                        Err(_) => false,
                    }
                }
            }
        });

        if expired {
            for r in readings {
                self.last_forwarded.insert((r.context, r.path), r.timestamp);
            }
        }
        expired
    }

    /// Number of (context, path) pairs tracked.
    pub fn tracked(&self) -> usize {
        self.last_forwarded.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PathValue, Source, Update};
    use chrono::TimeZone;

    fn delta_at(millis: i64, paths: &[&str]) -> Delta {
        Delta::single(
            "vessels/x",
            Update {
                source: Source::new("test", "nmea0183"),
                timestamp: Utc.timestamp_millis_opt(1_700_000_000_000 + millis).unwrap(),
                values: paths
                    .iter()
                    .map(|p| PathValue {
                        path: p.to_string(),
                        value: serde_json::json!(1.0),
                    })
                    .collect(),
            },
        )
    }

    #[test]
    fn test_default_interval_scenario() {
        let mut filter = RateLimitFilter::new(RateLimitConfig::default());
        let paths = ["navigation.speedOverGround", "navigation.headingTrue"];

        assert!(filter.check(&delta_at(0, &paths)));
        assert!(!filter.check(&delta_at(500, &paths)));
        assert!(filter.check(&delta_at(1100, &paths)));
        assert_eq!(filter.tracked(), 2);
    }

    #[test]
    fn test_new_path_forces_forward_and_refreshes_all() {
        let mut filter = RateLimitFilter::new(RateLimitConfig::default());
        assert!(filter.check(&delta_at(0, &["a"])));
        // "b" is new, so the delta passes and "a" restarts at 600
        assert!(filter.check(&delta_at(600, &["a", "b"])));
        assert!(!filter.check(&delta_at(1200, &["a"])));
        assert!(filter.check(&delta_at(1600, &["a"])));
    }

    #[test]
    fn test_path_override() {
        let mut config = RateLimitConfig::default();
        config.rate_limits.insert("fast".to_string(), 100);
        let mut filter = RateLimitFilter::new(config);

        assert!(filter.check(&delta_at(0, &["fast"])));
        assert!(filter.check(&delta_at(150, &["fast"])));
        assert!(!filter.check(&delta_at(200, &["fast"])));
    }

    #[test]
    fn test_forwarded_pairs_respect_interval() {
        let mut filter = RateLimitFilter::new(RateLimitConfig::default());
        let mut forwarded = Vec::new();
        for ms in (0..5000).step_by(130) {
            if filter.check(&delta_at(ms, &["x"])) {
                forwarded.push(ms);
            }
        }
        for pair in forwarded.windows(2) {
            assert!(pair[1] - pair[0] >= 1000);
        }
    }

    #[test]
    fn test_config_deserialize() {
        let config: RateLimitConfig = serde_json::from_str(
            r#"{"defaultInterval": 500, "rateLimits": {"navigation.position": 2000}}"#,
        )
        .unwrap();
        assert_eq!(config.interval_for("navigation.position"), Duration::from_secs(2));
        assert_eq!(config.interval_for("other"), Duration::from_millis(500));
    }
}
