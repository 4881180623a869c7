//! # signalk-connectors
//!
//! One connector per external source. A connector opens its transport,
//! frames the byte stream and hands each frame to a [`RawEmitter`], which
//! stamps it and publishes it on the Raw bus. Connectors that can drive
//! their bus (Modbus, CAN, Manner-Ethernet) also accept write-back Raw
//! messages through [`Connector::subscribe`].

pub mod can;
pub mod config;
pub mod file;
pub mod http;
pub mod lines;
pub mod manner;
pub mod modbus;
pub mod net;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use signalk_bus::{BusError, Publisher, Subscriber};
use signalk_protocol::{EnvelopeError, RawStamper};

pub use config::{ConnectorConfig, Parity, RegisterGroup, UrlGroup};

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration: {0}")]
    Config(String),

    #[error("bus: {0}")]
    Bus(#[from] BusError),

    #[error("serial: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("modbus: {0}")]
    Modbus(#[from] modbus::ModbusClientError),

    #[error("unsupported on this platform: {0}")]
    Unsupported(&'static str),
}

/// Stamps frames for one connector and publishes them on the Raw bus.
///
/// Clones share the stamper, so timestamps stay strictly increasing across
/// every task of the connector.
#[derive(Clone)]
pub struct RawEmitter {
    stamper: Arc<Mutex<RawStamper>>,
    publisher: Publisher,
    emitted: Arc<AtomicU64>,
    rejected: Arc<AtomicU64>,
}

impl RawEmitter {
    pub fn new(connector: &str, protocol: &str, publisher: Publisher) -> Self {
        Self {
            stamper: Arc::new(Mutex::new(RawStamper::new(connector, protocol))),
            publisher,
            emitted: Arc::new(AtomicU64::new(0)),
            rejected: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Stamp and publish one frame. Oversized frames are logged and dropped.
    pub fn emit(&self, payload: impl Into<Bytes>) -> Result<(), ConnectorError> {
        let raw = match self.stamper.lock().stamp(payload) {
            Ok(raw) => raw,
            Err(EnvelopeError::PayloadTooLarge(n)) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(bytes = n, "dropping oversized frame");
                return Ok(());
            }
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "dropping frame");
                return Ok(());
            }
        };
        let encoded = match raw.encode() {
            Ok(b) => b,
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "dropping frame");
                return Ok(());
            }
        };
        self.publisher.publish(encoded)?;
        self.emitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// A source of Raw frames, optionally accepting writes back to its bus.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Name stamped on every Raw.
    fn name(&self) -> &str;

    /// Read the source until it ends (files) or forever (network and
    /// field buses), publishing one Raw per frame.
    async fn publish(&self, emitter: RawEmitter) -> Result<(), ConnectorError>;

    /// Write Raw messages from `subscriber` back to the transport. The
    /// default drains and discards them.
    async fn subscribe(&self, subscriber: Subscriber) -> Result<(), ConnectorError> {
        discard_writes(self.name(), subscriber).await;
        Ok(())
    }
}

/// Drain a write-back subscriber for a connector without a write path.
pub async fn discard_writes(name: &str, subscriber: Subscriber) {
    let mut warned = false;
    while let Some(raw) = subscriber.recv_raw().await {
        if !warned {
            warn!(connector = %name, "connector does not support write-back; dropping");
            warned = true;
        }
        debug!(connector = %name, uuid = %raw.uuid, "write-back dropped");
    }
}

/// Build the connector selected by the URL scheme.
pub fn build(config: &ConnectorConfig) -> Result<Box<dyn Connector>, ConnectorError> {
    let scheme = config
        .scheme()
        .map_err(|e| ConnectorError::Config(e.to_string()))?;
    Ok(match scheme.as_str() {
        "tcp" => Box::new(net::TcpConnector::new(config)?),
        "udp" => Box::new(net::UdpConnector::new(config)?),
        "file" => Box::new(file::FileConnector::new(config)?),
        "http" | "https" => Box::new(http::HttpConnector::new(config)?),
        "modbus" => Box::new(modbus::ModbusConnector::new(config)?),
        "canbus" => Box::new(can::CanConnector::new(config)?),
        "manner_ethernet" => Box::new(manner::MannerConnector::new(config)?),
        other => {
            return Err(ConnectorError::Config(format!("unknown scheme {other}")));
        }
    })
}

/// Host and port of a `scheme://host:port` URL.
pub(crate) fn host_port(raw: &str) -> Result<String, ConnectorError> {
    let url = url::Url::parse(raw).map_err(|e| ConnectorError::Config(format!("{raw}: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| ConnectorError::Config(format!("{raw}: missing host")))?;
    let port = url
        .port()
        .ok_or_else(|| ConnectorError::Config(format!("{raw}: missing port")))?;
    Ok(format!("{host}:{port}"))
}
