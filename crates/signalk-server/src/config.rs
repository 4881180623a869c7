//! Configuration for the `server` role.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use signalk_bus::BusConfig;
use signalk_core::{CacheConfig, ConfigError, Validate};
use signalk_store::DatabaseConfig;

fn default_listen() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_name() -> String {
    "signalk-pipeline".to_string()
}

fn default_version() -> String {
    "1.7.0".to_string()
}

fn default_self() -> String {
    "vessels.self".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// HTTP/WebSocket listen address.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Server name sent in hello and discovery.
    #[serde(default = "default_name")]
    pub name: String,

    /// SignalK version advertised to clients.
    #[serde(default = "default_version")]
    pub version: String,

    /// Context of the own vessel, e.g. `vessels.urn:mrn:imo:mmsi:230099999`.
    #[serde(rename = "self", default = "default_self")]
    pub self_context: String,

    /// Mapped publishers to consume.
    pub bus: BusConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    /// Store to serve snapshots from. Without it the cache serves them.
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            name: default_name(),
            version: default_version(),
            self_context: default_self(),
            bus: BusConfig::default(),
            cache: CacheConfig::default(),
            database: None,
        }
    }
}

impl Validate for ServerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.listen.parse::<SocketAddr>().map_err(|e| {
            ConfigError::invalid(format!("listen {:?}: {e}", self.listen))
        })?;
        if self.self_context.is_empty() || !self.self_context.contains('.') {
            return Err(ConfigError::invalid(
                "self must be a context like vessels.<id>",
            ));
        }
        self.bus.validate()?;
        if self.bus.subscribe.is_empty() {
            return Err(ConfigError::invalid("server needs bus.subscribe"));
        }
        self.cache.validate()?;
        if let Some(database) = &self.database {
            if database.path.is_none() {
                return Err(ConfigError::invalid("server database needs a path"));
            }
            database.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signalk_core::config::from_yaml;

    #[test]
    fn test_yaml_defaults() {
        let config: ServerConfig = from_yaml(
            "self: vessels.urn:mrn:imo:mmsi:230099999\nbus:\n  subscribe: [\"tcp://127.0.0.1:5601\"]\ncache:\n  ttlSeconds: 600\n",
        )
        .unwrap();
        assert_eq!(config.listen, "0.0.0.0:3000");
        assert_eq!(config.self_context, "vessels.urn:mrn:imo:mmsi:230099999");
        assert_eq!(config.cache.ttl_seconds, Some(600));
        assert!(config.database.is_none());
    }

    #[test]
    fn test_rejects_bad_values() {
        let base = ServerConfig {
            bus: BusConfig {
                subscribe: vec!["tcp://127.0.0.1:5601".to_string()],
                ..BusConfig::default()
            },
            ..ServerConfig::default()
        };
        assert!(base.validate().is_ok());

        let no_input = ServerConfig {
            bus: BusConfig::default(),
            ..base.clone()
        };
        assert!(no_input.validate().is_err());

        let bad_listen = ServerConfig {
            listen: "nowhere".to_string(),
            ..base.clone()
        };
        assert!(bad_listen.validate().is_err());

        let memory_db = ServerConfig {
            database: Some(DatabaseConfig::default()),
            ..base
        };
        assert!(memory_db.validate().is_err());
    }
}
