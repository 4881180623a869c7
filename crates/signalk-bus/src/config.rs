//! `bus` block shared by every role config.

use serde::{Deserialize, Serialize};
use signalk_core::{ConfigError, Validate};

use crate::endpoint::Endpoint;
use crate::queue::DEFAULT_CAPACITY;
use crate::{Publisher, Subscriber};

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_reconnect_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusConfig {
    /// URL this stage binds its publisher on.
    #[serde(default)]
    pub publish: Option<String>,

    /// Publisher URLs this stage dials.
    #[serde(default)]
    pub subscribe: Vec<String>,

    #[serde(default = "default_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_reconnect_ms")]
    pub reconnect_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            publish: None,
            subscribe: Vec::new(),
            queue_capacity: default_capacity(),
            reconnect_ms: default_reconnect_ms(),
        }
    }
}

impl BusConfig {
    /// Bind the configured publisher, or an in-process one if none is set.
    pub async fn publisher(&self) -> Result<Publisher, crate::BusError> {
        match &self.publish {
            Some(url) => Publisher::bind(url, self.queue_capacity).await,
            None => Ok(Publisher::new(self.queue_capacity)),
        }
    }

    /// Dial the configured publishers.
    pub fn subscriber(&self) -> Result<Subscriber, crate::BusError> {
        Subscriber::connect_with(
            &self.subscribe,
            self.queue_capacity,
            std::time::Duration::from_millis(self.reconnect_ms),
        )
    }
}

impl Validate for BusConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::invalid("bus.queueCapacity must be positive"));
        }
        for url in self.publish.iter().chain(self.subscribe.iter()) {
            Endpoint::parse(url).map_err(|e| ConfigError::invalid(e.to_string()))?;
        }
        Ok(())
    }
}
