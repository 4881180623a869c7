//! Modbus register-group connector.
//!
//! `modbus://host:port` speaks Modbus TCP; `modbus:///dev/ttyUSB0` speaks RTU
//! over the serial settings of the connector config. One poller task runs
//! per register group; every request, including write-back, goes through the
//! per-bus mutex so a serial line only carries one transaction at a time.

pub mod pdu;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use signalk_bus::Subscriber;
use signalk_protocol::modbus::{extract_header, inject_header, ModbusError, ModbusHeader};

use crate::file::SerialSettings;
use crate::{Connector, ConnectorConfig, ConnectorError, RawEmitter, RegisterGroup};
use transport::Transport;

#[derive(Debug, thiserror::Error)]
pub enum ModbusClientError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("request timed out")]
    Timeout,

    #[error("link down, next connect attempt in {0:?}")]
    Reconnecting(Duration),

    #[error("framing: {0}")]
    Framing(String),

    #[error("exception {code} for function {function}")]
    Exception { function: u8, code: u8 },

    #[error("expected function {expected}, got {got}")]
    UnexpectedFunction { expected: u8, got: u8 },

    #[error("response of {0} bytes is too short")]
    ShortResponse(usize),

    #[error("need {needed} data bytes, have {have}")]
    ShortData { needed: usize, have: usize },

    #[error("function code {0} is not a write")]
    NotWritable(u16),

    #[error("payload: {0}")]
    Payload(#[from] ModbusError),
}

impl ModbusClientError {
    /// Errors after which the connection is no longer trustworthy.
    fn breaks_link(&self) -> bool {
        matches!(
            self,
            ModbusClientError::Io(_)
                | ModbusClientError::Serial(_)
                | ModbusClientError::Timeout
                | ModbusClientError::Framing(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusTarget {
    Tcp(String),
    Rtu(String),
}

impl BusTarget {
    pub fn from_url(raw: &str) -> Result<Self, ConnectorError> {
        let url =
            url::Url::parse(raw).map_err(|e| ConnectorError::Config(format!("{raw}: {e}")))?;
        match (url.host_str(), url.port()) {
            (Some(host), Some(port)) if !host.is_empty() => {
                Ok(BusTarget::Tcp(format!("{host}:{port}")))
            }
            (Some(host), None) if !host.is_empty() => Ok(BusTarget::Tcp(format!("{host}:502"))),
            _ if url.path().len() > 1 => Ok(BusTarget::Rtu(url.path().to_string())),
            _ => Err(ConnectorError::Config(format!(
                "{raw}: expected modbus://host:port or modbus:///dev/path"
            ))),
        }
    }
}

#[derive(Default)]
struct Link {
    transport: Option<Transport>,
    retry_after: Option<Instant>,
}

/// One physical Modbus bus, shared by every poller and the write-back task.
#[derive(Clone)]
pub struct ModbusBus {
    target: BusTarget,
    serial: SerialSettings,
    timeout: Duration,
    reconnect: Duration,
    link: Arc<Mutex<Link>>,
}

impl ModbusBus {
    pub fn new(
        target: BusTarget,
        serial: SerialSettings,
        timeout: Duration,
        reconnect: Duration,
    ) -> Self {
        Self {
            target,
            serial,
            timeout,
            reconnect,
            link: Arc::new(Mutex::new(Link::default())),
        }
    }

    /// Dial the bus. Bounded by the request timeout since the caller holds
    /// the link lock.
    async fn open(&self) -> Result<Transport, ModbusClientError> {
        match &self.target {
            BusTarget::Tcp(addr) => tokio::time::timeout(self.timeout, Transport::connect_tcp(addr))
                .await
                .map_err(|_| ModbusClientError::Timeout)?,
            BusTarget::Rtu(path) => Ok(Transport::rtu(self.serial.open(path)?)),
        }
    }

    async fn transact(&self, slave: u8, request: &[u8]) -> Result<Vec<u8>, ModbusClientError> {
        let mut link = self.link.lock().await;
        if link.transport.is_none() {
            let now = Instant::now();
            if let Some(at) = link.retry_after.filter(|at| *at > now) {
                return Err(ModbusClientError::Reconnecting(at - now));
            }
            match self.open().await {
                Ok(transport) => {
                    link.transport = Some(transport);
                    link.retry_after = None;
                }
                Err(e) => {
                    link.retry_after = Some(Instant::now() + self.reconnect);
                    return Err(e);
                }
            }
        }
        let Some(transport) = link.transport.as_mut() else {
            return Err(ModbusClientError::Framing("no link".to_string()));
        };
        let result = transport.request(slave, request, self.timeout).await;
        if let Err(e) = &result {
            if e.breaks_link() {
                link.transport = None;
            }
        }
        result
    }

    /// Execute a read and return the payload-layout data.
    pub async fn read(&self, header: &ModbusHeader) -> Result<Vec<u8>, ModbusClientError> {
        let response = self.transact(header.slave, &pdu::read_request(header)).await?;
        pdu::read_response(header, &response)
    }

    /// Execute a write described by a header and payload-layout data.
    pub async fn write(&self, header: &ModbusHeader, data: &[u8]) -> Result<(), ModbusClientError> {
        let request = pdu::write_request(header, data)?;
        let response = self.transact(header.slave, &request).await?;
        pdu::write_response(header, &response)
    }
}

pub struct ModbusConnector {
    name: String,
    groups: Vec<RegisterGroup>,
    bus: ModbusBus,
}

impl ModbusConnector {
    pub fn new(config: &ConnectorConfig) -> Result<Self, ConnectorError> {
        for group in &config.register_groups {
            group
                .header()
                .map_err(|e| ConnectorError::Config(e.to_string()))?;
        }
        Ok(Self {
            name: config.name.clone(),
            groups: config.register_groups.clone(),
            bus: ModbusBus::new(
                BusTarget::from_url(&config.url)?,
                SerialSettings::from_config(config),
                Duration::from_millis(config.timeout_ms),
                Duration::from_millis(config.reconnect_ms),
            ),
        })
    }

    pub fn bus(&self) -> &ModbusBus {
        &self.bus
    }
}

async fn poll_group(
    name: String,
    header: ModbusHeader,
    interval: Duration,
    bus: ModbusBus,
    emitter: RawEmitter,
) -> Result<(), ConnectorError> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        match bus.read(&header).await {
            Ok(data) => {
                debug!(connector = %name, address = header.address, count = header.count, "group read");
                emitter.emit(inject_header(&header, &data))?;
            }
            Err(ModbusClientError::Reconnecting(wait)) => {
                debug!(connector = %name, wait_ms = wait.as_millis() as u64, "modbus link backing off");
            }
            Err(e) => {
                warn!(
                    connector = %name,
                    slave = header.slave,
                    function = %header.function,
                    address = header.address,
                    error = %e,
                    "modbus read failed"
                );
            }
        }
    }
}

#[async_trait]
impl Connector for ModbusConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, emitter: RawEmitter) -> Result<(), ConnectorError> {
        let mut tasks = tokio::task::JoinSet::new();
        for group in &self.groups {
            let header = group
                .header()
                .map_err(|e| ConnectorError::Config(e.to_string()))?;
            info!(
                connector = %self.name,
                function = %header.function,
                address = header.address,
                count = header.count,
                interval_ms = group.interval_ms,
                "polling register group"
            );
            tasks.spawn(poll_group(
                self.name.clone(),
                header,
                Duration::from_millis(group.interval_ms),
                self.bus.clone(),
                emitter.clone(),
            ));
        }
        while let Some(joined) = tasks.join_next().await {
            if let Ok(Err(e)) = joined {
                tasks.abort_all();
                return Err(e);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, subscriber: Subscriber) -> Result<(), ConnectorError> {
        while let Some(raw) = subscriber.recv_raw().await {
            let (header, data) = match extract_header(&raw.payload) {
                Ok(parts) => parts,
                Err(e) => {
                    warn!(connector = %self.name, error = %e, "bad write-back payload");
                    continue;
                }
            };
            if !header.function.is_write() {
                warn!(connector = %self.name, function = %header.function, "write-back with read function code");
                continue;
            }
            match self.bus.write(&header, data).await {
                Ok(()) => debug!(
                    connector = %self.name,
                    function = %header.function,
                    address = header.address,
                    "write-back done"
                ),
                Err(e) => warn!(connector = %self.name, error = %e, "write-back failed"),
            }
        }
        Ok(())
    }
}
