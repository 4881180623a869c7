//! Configuration for the `store` and `transfer` roles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use signalk_bus::BusConfig;
use signalk_core::{ConfigError, Validate};

use crate::TimeRange;

fn default_workers() -> usize {
    10
}

fn default_channel_size() -> usize {
    100
}

fn default_flush_length() -> usize {
    100
}

fn default_flush_interval() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

/// The `database` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// SQLite file. Without one the store lives in memory.
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Records queued per worker before the dispatcher waits.
    #[serde(default = "default_channel_size")]
    pub channel_size: usize,

    #[serde(default = "default_flush_length")]
    pub batch_flush_length: usize,

    /// Seconds between time-based flushes.
    #[serde(default = "default_flush_interval")]
    pub batch_flush_interval: u64,

    /// Failed insert attempts before a batch is dropped.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Rows older than this are pruned hourly. Kept forever when absent.
    #[serde(default)]
    pub retention_hours: Option<u64>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            workers: default_workers(),
            channel_size: default_channel_size(),
            batch_flush_length: default_flush_length(),
            batch_flush_interval: default_flush_interval(),
            max_retries: default_max_retries(),
            retention_hours: None,
        }
    }
}

impl Validate for DatabaseConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::invalid("database.workers must be positive"));
        }
        if self.channel_size == 0 || self.batch_flush_length == 0 {
            return Err(ConfigError::invalid(
                "database.channelSize and batchFlushLength must be positive",
            ));
        }
        if self.batch_flush_interval == 0 {
            return Err(ConfigError::invalid("database.batchFlushInterval must be positive"));
        }
        if self.retention_hours == Some(0) {
            return Err(ConfigError::invalid("database.retentionHours must be positive"));
        }
        Ok(())
    }
}

/// Configuration for the `store` role: which buses to persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Raw publishers to persist.
    #[serde(default)]
    pub raw: Option<BusConfig>,

    /// Mapped publishers to persist.
    #[serde(default)]
    pub mapped: Option<BusConfig>,
}

impl Validate for StoreConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.database.validate()?;
        let mut inputs = 0;
        for bus in [&self.raw, &self.mapped].into_iter().flatten() {
            bus.validate()?;
            inputs += bus.subscribe.len();
        }
        if inputs == 0 {
            return Err(ConfigError::invalid("store needs raw.subscribe or mapped.subscribe"));
        }
        Ok(())
    }
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "signalk-transfer".to_string()
}

fn default_topic_prefix() -> String {
    "signalk".to_string()
}

fn default_qos() -> u8 {
    1
}

fn default_keep_alive() -> u64 {
    15
}

/// The `mqtt` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttConfig {
    pub host: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    #[serde(default = "default_qos")]
    pub qos: u8,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

impl Validate for MqttConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::invalid("mqtt.host is empty"));
        }
        if self.qos > 2 {
            return Err(ConfigError::invalid(format!("mqtt.qos {} is not 0, 1 or 2", self.qos)));
        }
        if self.topic_prefix.is_empty() {
            return Err(ConfigError::invalid("mqtt.topicPrefix is empty"));
        }
        Ok(())
    }
}

/// Configuration for the `transfer` role.
///
/// A replay reads `[from, to)` from the database and re-publishes it on
/// `raw`/`mapped` and to `mqtt`. With `live` set, Mapped traffic from the
/// bus is forwarded to `mqtt` as it arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub from: Option<DateTime<Utc>>,

    #[serde(default)]
    pub to: Option<DateTime<Utc>>,

    /// Publisher for replayed Raw frames.
    #[serde(default)]
    pub raw: Option<BusConfig>,

    /// Publisher for replayed Mapped deltas.
    #[serde(default)]
    pub mapped: Option<BusConfig>,

    #[serde(default)]
    pub mqtt: Option<MqttConfig>,

    /// Mapped publishers to bridge live to MQTT.
    #[serde(default)]
    pub live: Option<BusConfig>,
}

impl TransferConfig {
    pub fn range(&self) -> TimeRange {
        TimeRange {
            from: self.from,
            to: self.to,
        }
    }

    /// True when a replay was asked for.
    pub fn replays(&self) -> bool {
        self.raw.is_some() || self.mapped.is_some() || (self.mqtt.is_some() && self.live.is_none())
    }
}

impl Validate for TransferConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.database.validate()?;
        for bus in [&self.raw, &self.mapped, &self.live].into_iter().flatten() {
            bus.validate()?;
        }
        if let Some(mqtt) = &self.mqtt {
            mqtt.validate()?;
        }
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from >= to {
                return Err(ConfigError::invalid("transfer range is empty: from >= to"));
            }
        }
        if self.live.is_some() && self.mqtt.is_none() {
            return Err(ConfigError::invalid("live bridging needs an mqtt block"));
        }
        if self.live.as_ref().is_some_and(|b| b.subscribe.is_empty()) {
            return Err(ConfigError::invalid("live needs subscribe URLs"));
        }
        if !self.replays() && self.live.is_none() {
            return Err(ConfigError::invalid("transfer has nothing to do"));
        }
        Ok(())
    }
}
