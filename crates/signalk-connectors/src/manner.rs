//! Manner-Ethernet source: bit-packed frames over TCP.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use signalk_bus::Subscriber;
use signalk_protocol::manner::{decode_frame, values_to_payload, MannerFramer};

use crate::{host_port, Connector, ConnectorConfig, ConnectorError, RawEmitter};

pub struct MannerConnector {
    name: String,
    addr: String,
    reconnect: Duration,
    /// Write half of the live connection, shared with write-back.
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
}

impl MannerConnector {
    pub fn new(config: &ConnectorConfig) -> Result<Self, ConnectorError> {
        Ok(Self {
            name: config.name.clone(),
            addr: host_port(&config.url)?,
            reconnect: Duration::from_millis(config.reconnect_ms),
            writer: Arc::new(Mutex::new(None)),
        })
    }

    async fn session(&self, emitter: &RawEmitter) -> Result<(), ConnectorError> {
        let stream = TcpStream::connect(&self.addr).await?;
        info!(connector = %self.name, addr = %self.addr, "Manner-Ethernet connected");
        let (mut reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);

        let mut framer = MannerFramer::new();
        let mut buf = [0u8; 4096];
        let result = loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(e.into()),
            };
            let emitted = framer
                .push(&buf[..n])
                .iter()
                .try_for_each(|frame| emitter.emit(values_to_payload(&decode_frame(frame))));
            if let Err(e) = emitted {
                break Err(e);
            }
        };
        *self.writer.lock().await = None;
        if framer.skipped() > 0 {
            debug!(connector = %self.name, skipped = framer.skipped(), "malformed frames skipped");
        }
        result
    }
}

#[async_trait]
impl Connector for MannerConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, emitter: RawEmitter) -> Result<(), ConnectorError> {
        loop {
            match self.session(&emitter).await {
                Err(ConnectorError::Bus(e)) => return Err(ConnectorError::Bus(e)),
                Ok(()) => info!(connector = %self.name, "Manner-Ethernet closed, reconnecting"),
                Err(e) => {
                    warn!(connector = %self.name, error = %e, "Manner-Ethernet failed, reconnecting")
                }
            }
            tokio::time::sleep(self.reconnect).await;
        }
    }

    async fn subscribe(&self, subscriber: Subscriber) -> Result<(), ConnectorError> {
        while let Some(raw) = subscriber.recv_raw().await {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(w) => {
                    if let Err(e) = w.write_all(&raw.payload).await {
                        warn!(connector = %self.name, error = %e, "write-back failed");
                        *writer = None;
                    }
                }
                None => warn!(connector = %self.name, "not connected, write-back dropped"),
            }
        }
        Ok(())
    }
}
