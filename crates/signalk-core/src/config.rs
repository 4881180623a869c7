//! Configuration loading shared by every pipeline role.
//!
//! Each role owns its own config struct; this module only knows how to read
//! one from YAML or JSON and how to reject invalid values before anything
//! starts.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid YAML for the expected shape.
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The file is not valid JSON for the expected shape.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The extension is neither yaml, yml nor json.
    #[error("unsupported config format: {0}")]
    UnsupportedFormat(String),

    /// A value parsed but is outside what the role accepts.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        ConfigError::Invalid(msg.into())
    }
}

/// Post-parse checks for a role's configuration.
pub trait Validate {
    fn validate(&self) -> Result<(), ConfigError>;
}

/// Parse a config from YAML text.
pub fn from_yaml<T: DeserializeOwned + Validate>(text: &str) -> Result<T, ConfigError> {
    let config: T = serde_yaml::from_str(text)?;
    config.validate()?;
    Ok(config)
}

/// Parse a config from JSON text.
pub fn from_json<T: DeserializeOwned + Validate>(text: &str) -> Result<T, ConfigError> {
    let config: T = serde_json::from_str(text)?;
    config.validate()?;
    Ok(config)
}

/// Load a config file, choosing the parser from its extension.
pub fn load<T: DeserializeOwned + Validate>(path: impl AsRef<Path>) -> Result<T, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;

    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => from_yaml(&text),
        Some("json") => from_json(&text),
        other => Err(ConfigError::UnsupportedFormat(
            other.unwrap_or("<none>").to_string(),
        )),
    }
}

/// Latest-value cache settings (`cache` block).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// Evict readings older than this many seconds. Absent means never.
    #[serde(default)]
    pub ttl_seconds: Option<u64>,

    /// Load the latest rows from the store at startup.
    #[serde(default)]
    pub warm: bool,
}

impl Validate for CacheConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl_seconds == Some(0) {
            return Err(ConfigError::invalid("cache.ttlSeconds must be positive"));
        }
        Ok(())
    }
}

impl Validate for crate::ratelimit::RateLimitConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.default_interval == 0 {
            return Err(ConfigError::invalid("defaultInterval must be positive"));
        }
        if let Some((path, _)) = self.rate_limits.iter().find(|(_, ms)| **ms == 0) {
            return Err(ConfigError::invalid(format!(
                "rateLimits.{path} must be positive"
            )));
        }
        Ok(())
    }
}
