//! TCP and UDP line sources.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{info, warn};

use crate::lines::{pump_lines, split_lines};
use crate::{host_port, Connector, ConnectorConfig, ConnectorError, RawEmitter};

/// Newline-framed TCP source; dials, or accepts one peer at a time when
/// `listen` is set. Reconnects after the configured back-off.
pub struct TcpConnector {
    name: String,
    addr: String,
    listen: bool,
    reconnect: Duration,
}

impl TcpConnector {
    pub fn new(config: &ConnectorConfig) -> Result<Self, ConnectorError> {
        Ok(Self {
            name: config.name.clone(),
            addr: host_port(&config.url)?,
            listen: config.listen,
            reconnect: Duration::from_millis(config.reconnect_ms),
        })
    }

    async fn session(&self, emitter: &RawEmitter) -> Result<u64, ConnectorError> {
        let stream = if self.listen {
            let listener = TcpListener::bind(&self.addr).await?;
            info!(connector = %self.name, addr = %self.addr, "waiting for TCP peer");
            let (stream, peer) = listener.accept().await?;
            info!(connector = %self.name, peer = %peer, "TCP peer connected");
            stream
        } else {
            let stream = TcpStream::connect(&self.addr).await?;
            info!(connector = %self.name, addr = %self.addr, "TCP source connected");
            stream
        };
        pump_lines(stream, emitter).await
    }
}

#[async_trait]
impl Connector for TcpConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, emitter: RawEmitter) -> Result<(), ConnectorError> {
        loop {
            match self.session(&emitter).await {
                Ok(lines) => {
                    info!(connector = %self.name, lines, "TCP source closed, reconnecting");
                }
                Err(ConnectorError::Bus(e)) => return Err(ConnectorError::Bus(e)),
                Err(e) => {
                    warn!(connector = %self.name, error = %e, "TCP source failed, reconnecting");
                }
            }
            tokio::time::sleep(self.reconnect).await;
        }
    }
}

/// UDP source. Each datagram may carry several lines.
pub struct UdpConnector {
    name: String,
    addr: String,
    listen: bool,
    reconnect: Duration,
}

impl UdpConnector {
    pub fn new(config: &ConnectorConfig) -> Result<Self, ConnectorError> {
        Ok(Self {
            name: config.name.clone(),
            addr: host_port(&config.url)?,
            listen: config.listen,
            reconnect: Duration::from_millis(config.reconnect_ms),
        })
    }

    async fn session(&self, emitter: &RawEmitter) -> Result<(), ConnectorError> {
        let socket = if self.listen {
            UdpSocket::bind(&self.addr).await?
        } else {
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket.connect(&self.addr).await?;
            // a datagram lets the peer learn our address
            socket.send(b"\n").await?;
            socket
        };
        info!(connector = %self.name, addr = %self.addr, listen = self.listen, "UDP source ready");

        let mut buf = vec![0u8; 65_536];
        loop {
            let n = socket.recv(&mut buf).await?;
            for line in split_lines(&buf[..n]) {
                emitter.emit(line.to_vec())?;
            }
        }
    }
}

#[async_trait]
impl Connector for UdpConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, emitter: RawEmitter) -> Result<(), ConnectorError> {
        loop {
            match self.session(&emitter).await {
                Ok(()) => {}
                Err(ConnectorError::Bus(e)) => return Err(ConnectorError::Bus(e)),
                Err(e) => {
                    warn!(connector = %self.name, error = %e, "UDP source failed, reconnecting");
                }
            }
            tokio::time::sleep(self.reconnect).await;
        }
    }
}
