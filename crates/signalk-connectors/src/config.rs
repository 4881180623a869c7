//! Connector role configuration.

use serde::{Deserialize, Serialize};
use url::Url;

use signalk_bus::BusConfig;
use signalk_core::{ConfigError, Validate};
use signalk_protocol::modbus::{FunctionCode, ModbusHeader};

fn default_baud() -> u32 {
    4800
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_reconnect_ms() -> u64 {
    5000
}

/// Serial parity letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Parity {
    #[default]
    #[serde(rename = "N")]
    None,
    #[serde(rename = "O")]
    Odd,
    #[serde(rename = "E")]
    Even,
}

/// One Modbus register group, read atomically on its own schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterGroup {
    #[serde(default = "default_slave")]
    pub slave: u8,
    pub function_code: FunctionCode,
    pub address: u16,
    pub count: u16,
    pub interval_ms: u64,
}

fn default_slave() -> u8 {
    1
}

impl RegisterGroup {
    pub fn header(&self) -> Result<ModbusHeader, ConfigError> {
        ModbusHeader::new(self.slave, self.function_code, self.address, self.count)
            .map_err(|e| ConfigError::invalid(format!("register group: {e}")))
    }
}

/// URLs polled on a shared interval; each URL gets its own ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlGroup {
    pub urls: Vec<String>,
    pub interval_ms: u64,
}

/// Configuration for the `connector` role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorConfig {
    /// Label stamped on every Raw as the connector name.
    pub name: String,

    /// Protocol tag stamped on every Raw.
    pub protocol: String,

    /// Source URL; the scheme selects the transport.
    pub url: String,

    /// Bind and accept instead of dialing (tcp/udp).
    #[serde(default)]
    pub listen: bool,

    #[serde(default = "default_baud")]
    pub baud_rate: u32,

    #[serde(default = "default_data_bits")]
    pub data_bits: u8,

    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,

    #[serde(default)]
    pub parity: Parity,

    #[serde(default)]
    pub register_groups: Vec<RegisterGroup>,

    #[serde(default)]
    pub url_groups: Vec<UrlGroup>,

    /// Modbus request timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_reconnect_ms")]
    pub reconnect_ms: u64,

    #[serde(default)]
    pub bus: BusConfig,

    /// Publisher URLs carrying write-back Raw messages.
    #[serde(default)]
    pub write_back: Vec<String>,
}

impl ConnectorConfig {
    pub fn scheme(&self) -> Result<String, ConfigError> {
        let url = Url::parse(&self.url)
            .map_err(|e| ConfigError::invalid(format!("url {}: {e}", self.url)))?;
        Ok(url.scheme().to_string())
    }

    /// Minimal config for a source, used by tests and embedding code.
    pub fn new(name: &str, protocol: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            protocol: protocol.to_string(),
            url: url.to_string(),
            listen: false,
            baud_rate: default_baud(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: Parity::None,
            register_groups: Vec::new(),
            url_groups: Vec::new(),
            timeout_ms: default_timeout_ms(),
            reconnect_ms: default_reconnect_ms(),
            bus: BusConfig::default(),
            write_back: Vec::new(),
        }
    }
}

impl Validate for ConnectorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::invalid("connector name is empty"));
        }
        if self.protocol.is_empty() {
            return Err(ConfigError::invalid("protocol tag is empty"));
        }
        self.bus.validate()?;

        if !(5..=8).contains(&self.data_bits) {
            return Err(ConfigError::invalid(format!(
                "dataBits {} outside 5..=8",
                self.data_bits
            )));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(ConfigError::invalid(format!(
                "stopBits {} must be 1 or 2",
                self.stop_bits
            )));
        }
        if self.timeout_ms == 0 || self.reconnect_ms == 0 {
            return Err(ConfigError::invalid("timeouts must be positive"));
        }

        match self.scheme()?.as_str() {
            "tcp" | "udp" | "file" | "canbus" | "manner_ethernet" => {}
            "http" | "https" => {
                if self.url_groups.is_empty() {
                    return Err(ConfigError::invalid("http connector needs urlGroups"));
                }
                for group in &self.url_groups {
                    if group.interval_ms == 0 || group.urls.is_empty() {
                        return Err(ConfigError::invalid(
                            "urlGroups need urls and a positive intervalMs",
                        ));
                    }
                }
            }
            "modbus" => {
                if self.register_groups.is_empty() {
                    return Err(ConfigError::invalid("modbus connector needs registerGroups"));
                }
                for group in &self.register_groups {
                    let header = group.header()?;
                    if header.function.is_write() {
                        return Err(ConfigError::invalid(format!(
                            "register group uses write function code {}",
                            header.function
                        )));
                    }
                    if group.interval_ms == 0 {
                        return Err(ConfigError::invalid("registerGroups need intervalMs > 0"));
                    }
                }
            }
            other => {
                return Err(ConfigError::invalid(format!("unknown scheme {other}")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signalk_core::config::from_yaml;

    #[test]
    fn test_modbus_config() {
        let yaml = r#"
name: engine
protocol: modbus
url: modbus://127.0.0.1:502
registerGroups:
  - slave: 1
    functionCode: 3
    address: 100
    count: 4
    intervalMs: 1000
"#;
        let config: ConnectorConfig = from_yaml(yaml).unwrap();
        assert_eq!(config.register_groups[0].function_code, FunctionCode::ReadHoldingRegisters);
        assert_eq!(config.timeout_ms, 1000);
        assert_eq!(config.parity, Parity::None);
    }

    #[test]
    fn test_register_count_over_limit_is_fatal() {
        let yaml = r#"
name: engine
protocol: modbus
url: modbus://127.0.0.1:502
registerGroups:
  - functionCode: 4
    address: 0
    count: 126
    intervalMs: 1000
"#;
        let err = from_yaml::<ConnectorConfig>(yaml).unwrap_err();
        assert!(err.to_string().contains("126"));
    }

    #[test]
    fn test_serial_fields_and_bad_scheme() {
        let yaml = r#"
name: gps
protocol: nmea0183
url: file:///dev/ttyUSB0
baudRate: 38400
parity: E
"#;
        let config: ConnectorConfig = from_yaml(yaml).unwrap();
        assert_eq!(config.baud_rate, 38400);
        assert_eq!(config.parity, Parity::Even);

        let bad = "name: x\nprotocol: y\nurl: gopher://host:70\n";
        assert!(from_yaml::<ConnectorConfig>(bad).is_err());

        let bad_parity = "name: x\nprotocol: y\nurl: tcp://h:1\nparity: Q\n";
        assert!(from_yaml::<ConnectorConfig>(bad_parity).is_err());
    }
}
