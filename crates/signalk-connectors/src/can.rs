//! SocketCAN source (`canbus://<iface>`).
//!
//! Frames are read on a blocking thread and forwarded as Raw payloads in the
//! `signalk_protocol::can` layout. Write-back is accepted but not applied
//! until DBC-driven encoding exists.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use signalk_bus::Subscriber;
use signalk_protocol::can::CanFrame;

use crate::{Connector, ConnectorConfig, ConnectorError, RawEmitter};

pub struct CanConnector {
    name: String,
    interface: String,
    reconnect: Duration,
}

impl CanConnector {
    pub fn new(config: &ConnectorConfig) -> Result<Self, ConnectorError> {
        let url = url::Url::parse(&config.url)
            .map_err(|e| ConnectorError::Config(format!("{}: {e}", config.url)))?;
        let interface = url
            .host_str()
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .or_else(|| {
                let path = url.path().trim_start_matches('/');
                (!path.is_empty()).then(|| path.to_string())
            })
            .ok_or_else(|| ConnectorError::Config(format!("{}: missing interface", config.url)))?;
        Ok(Self {
            name: config.name.clone(),
            interface,
            reconnect: Duration::from_millis(config.reconnect_ms),
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }
}

#[cfg(target_os = "linux")]
fn read_loop(
    interface: String,
    tx: tokio::sync::mpsc::Sender<CanFrame>,
) -> Result<(), std::io::Error> {
    use signalk_protocol::can::{FLAG_ERROR, FLAG_EXTENDED, FLAG_RTR};
    use socketcan::{CanSocket, EmbeddedFrame, Frame, Socket};

    let socket = CanSocket::open(&interface)?;
    socket.set_read_timeout(Duration::from_millis(500))?;
    debug!(interface = %interface, "CAN read loop started");

    loop {
        if tx.is_closed() {
            return Ok(());
        }
        match socket.read_frame() {
            Ok(frame) => {
                let mut flags = 0;
                if frame.is_extended() {
                    flags |= FLAG_EXTENDED;
                }
                if frame.is_remote_frame() {
                    flags |= FLAG_RTR;
                }
                if frame.is_error_frame() {
                    flags |= FLAG_ERROR;
                }
                match CanFrame::new(frame.raw_id(), flags, frame.data()) {
                    Ok(f) => {
                        if tx.blocking_send(f).is_err() {
                            return Ok(());
                        }
                    }
                    Err(e) => warn!(interface = %interface, error = %e, "skipping CAN frame"),
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(e) => return Err(e),
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn read_loop(
    _interface: String,
    _tx: tokio::sync::mpsc::Sender<CanFrame>,
) -> Result<(), std::io::Error> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "SocketCAN is only available on Linux",
    ))
}

#[async_trait]
impl Connector for CanConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, emitter: RawEmitter) -> Result<(), ConnectorError> {
        loop {
            let (tx, mut rx) = tokio::sync::mpsc::channel(1024);
            let interface = self.interface.clone();
            let reader = tokio::task::spawn_blocking(move || read_loop(interface, tx));
            info!(connector = %self.name, interface = %self.interface, "CAN source started");

            while let Some(frame) = rx.recv().await {
                emitter.emit(frame.encode())?;
            }

            match reader.await {
                Ok(Ok(())) => warn!(connector = %self.name, "CAN reader stopped"),
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::Unsupported => {
                    return Err(ConnectorError::Unsupported("SocketCAN"));
                }
                Ok(Err(e)) => warn!(connector = %self.name, error = %e, "CAN reader failed"),
                Err(e) => warn!(connector = %self.name, error = %e, "CAN reader panicked"),
            }
            tokio::time::sleep(self.reconnect).await;
        }
    }

    async fn subscribe(&self, subscriber: Subscriber) -> Result<(), ConnectorError> {
        while let Some(raw) = subscriber.recv_raw().await {
            debug!(
                connector = %self.name,
                uuid = %raw.uuid,
                "CAN write-back not applied"
            );
        }
        Ok(())
    }
}
