//! Configuration for the `mapper` role.

use serde::{Deserialize, Serialize};

use signalk_bus::BusConfig;
use signalk_core::{ConfigError, Validate};
use signalk_protocol::modbus::FunctionCode;

/// Protocol tags a mapper can be built for.
pub const PROTOCOLS: &[&str] = &["nmea0183", "modbus", "manner", "csv", "json", "canbus"];

fn default_size() -> u16 {
    1
}

/// One row of the mapping table. Which fields apply depends on the protocol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    /// SignalK path the result is published on.
    pub path: String,

    /// Rhai expression; each mapper has its own default.
    #[serde(default)]
    pub expression: Option<String>,

    /// Register (or Manner value index) of the first item.
    #[serde(default)]
    pub address: Option<u16>,

    #[serde(default)]
    pub function_code: Option<FunctionCode>,

    #[serde(default)]
    pub slave: Option<u8>,

    /// Number of consecutive items handed to the expression as `registers`.
    #[serde(default = "default_size")]
    pub size: u16,

    #[serde(default)]
    pub begins_with: Option<String>,

    #[serde(default)]
    pub regex: Option<String>,

    /// CSV column separator, `,` when absent.
    #[serde(default)]
    pub separator: Option<String>,

    /// DBC signal name.
    #[serde(default)]
    pub signal: Option<String>,
}

impl Mapping {
    pub fn new(path: &str, expression: &str) -> Self {
        Self {
            path: path.to_string(),
            expression: Some(expression.to_string()),
            size: 1,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolOptions {
    /// Sentence types to decode; empty means every supported one.
    #[serde(default)]
    pub nmeaparse: Vec<String>,

    /// Accept NMEA sentences with a missing or wrong checksum.
    #[serde(default)]
    pub skipfaultdetection: bool,

    /// DBC file for `canbus`.
    #[serde(default)]
    pub dbc: Option<String>,
}

fn default_retention_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

/// A post-processing rule computing one path from the latest values of others.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpressionRule {
    pub path: String,

    /// Input paths; the expression sees them as `values[i]` in this order.
    pub sources: Vec<String>,

    pub expression: String,

    /// Inputs older than this relative to the newest one are stale.
    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,

    /// Emit on every input even when no input value changed.
    #[serde(default = "default_true")]
    pub overwrite: bool,

    /// Context to watch and publish on; the mapper context when absent.
    #[serde(default)]
    pub context: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapperConfig {
    /// Label used in logs; the protocol tag when absent.
    #[serde(default)]
    pub name: Option<String>,

    pub protocol: String,

    /// Context of every delta that does not carry its own (AIS).
    pub context: String,

    #[serde(default)]
    pub protocol_options: ProtocolOptions,

    #[serde(default)]
    pub mappings: Vec<Mapping>,

    #[serde(default)]
    pub expressions: Vec<ExpressionRule>,

    #[serde(default)]
    pub bus: BusConfig,
}

impl MapperConfig {
    pub fn new(protocol: &str, context: &str) -> Self {
        Self {
            name: None,
            protocol: protocol.to_string(),
            context: context.to_string(),
            protocol_options: ProtocolOptions::default(),
            mappings: Vec::new(),
            expressions: Vec::new(),
            bus: BusConfig::default(),
        }
    }

    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.protocol)
    }
}

impl Validate for MapperConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.bus.validate()?;
        if self.context.trim().is_empty() {
            return Err(ConfigError::invalid("mapper context is empty"));
        }
        if !PROTOCOLS.contains(&self.protocol.as_str()) {
            return Err(ConfigError::invalid(format!(
                "unknown protocol {}; expected one of {}",
                self.protocol,
                PROTOCOLS.join(", ")
            )));
        }
        for (i, m) in self.mappings.iter().enumerate() {
            if m.path.is_empty() {
                return Err(ConfigError::invalid(format!("mappings[{i}]: empty path")));
            }
            if m.size == 0 {
                return Err(ConfigError::invalid(format!("mappings[{i}]: size must be positive")));
            }
            match self.protocol.as_str() {
                "modbus" | "manner" if m.address.is_none() => {
                    return Err(ConfigError::invalid(format!("mappings[{i}]: address required")));
                }
                "canbus" if m.signal.is_none() => {
                    return Err(ConfigError::invalid(format!("mappings[{i}]: signal required")));
                }
                "json" if m.expression.is_none() => {
                    return Err(ConfigError::invalid(format!("mappings[{i}]: expression required")));
                }
                _ => {}
            }
        }
        if self.protocol == "canbus" && self.protocol_options.dbc.is_none() {
            return Err(ConfigError::invalid("canbus mapper needs protocolOptions.dbc"));
        }
        for rule in &self.expressions {
            if rule.sources.is_empty() {
                return Err(ConfigError::invalid(format!("expression {}: no sources", rule.path)));
            }
            if rule.retention_ms == 0 {
                return Err(ConfigError::invalid(format!(
                    "expression {}: retentionMs must be positive",
                    rule.path
                )));
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
    fn test_modbus_mapping_yaml() {
        let yaml = r#"
protocol: modbus
context: vessels.urn:mrn:signalk:uuid:self
mappings:
  - path: tanks.fuel.0.currentLevel
    address: 100
    functionCode: 3
    expression: "registers[0] / 1000.0"
expressions:
  - path: tanks.fuel.0.currentVolume
    sources: [tanks.fuel.0.currentLevel]
    expression: "values[0] * 0.5"
"#;
        let config: MapperConfig = from_yaml(yaml).unwrap();
        assert_eq!(config.mappings[0].function_code, Some(FunctionCode::ReadHoldingRegisters));
        assert_eq!(config.mappings[0].size, 1);
        assert_eq!(config.expressions[0].retention_ms, 10_000);
        assert!(config.expressions[0].overwrite);
        assert_eq!(config.label(), "modbus");
    }

    #[test]
    fn test_rejects_bad_config() {
        assert!(from_yaml::<MapperConfig>("protocol: nmea0183\ncontext: \"\"\n").is_err());
        assert!(from_yaml::<MapperConfig>("protocol: morse\ncontext: vessels.x\n").is_err());
        assert!(from_yaml::<MapperConfig>(
            "protocol: modbus\ncontext: vessels.x\nmappings:\n  - path: a.b\n"
        )
        .is_err());
        assert!(from_yaml::<MapperConfig>("protocol: canbus\ncontext: vessels.x\n").is_err());
    }
}
