//! `file://` sources: plain files (replayed once) or serial ports.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio_serial::{DataBits, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::{info, warn};

use crate::lines::pump_lines;
use crate::{Connector, ConnectorConfig, ConnectorError, Parity, RawEmitter};

/// Serial line settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
}

impl SerialSettings {
    pub fn from_config(config: &ConnectorConfig) -> Self {
        Self {
            baud_rate: config.baud_rate,
            data_bits: config.data_bits,
            stop_bits: config.stop_bits,
            parity: config.parity,
        }
    }

    /// Open `path` as an async serial stream.
    pub fn open(&self, path: &str) -> Result<SerialStream, tokio_serial::Error> {
        let data_bits = match self.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };
        let stop_bits = match self.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        };
        let parity = match self.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        };
        let stream = tokio_serial::new(path, self.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .open_native_async()?;
        Ok(stream)
    }
}

pub fn is_char_device(path: &std::path::Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        std::fs::metadata(path)
            .map(|m| m.file_type().is_char_device())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        false
    }
}

pub struct FileConnector {
    name: String,
    path: PathBuf,
    serial: SerialSettings,
    reconnect: Duration,
}

impl FileConnector {
    pub fn new(config: &ConnectorConfig) -> Result<Self, ConnectorError> {
        let url = url::Url::parse(&config.url)
            .map_err(|e| ConnectorError::Config(format!("{}: {e}", config.url)))?;
        let path = url
            .to_file_path()
            .map_err(|_| ConnectorError::Config(format!("{}: not a file path", config.url)))?;
        Ok(Self {
            name: config.name.clone(),
            path,
            serial: SerialSettings::from_config(config),
            reconnect: Duration::from_millis(config.reconnect_ms),
        })
    }

    async fn read_serial(&self, emitter: &RawEmitter) -> Result<(), ConnectorError> {
        let path = self.path.to_string_lossy().to_string();
        loop {
            let result = match self.serial.open(&path) {
                Ok(stream) => {
                    info!(connector = %self.name, port = %path, baud = self.serial.baud_rate, "serial port open");
                    pump_lines(stream, emitter).await.map(|_| ())
                }
                Err(e) => Err(e.into()),
            };
            match result {
                Err(ConnectorError::Bus(e)) => return Err(ConnectorError::Bus(e)),
                Err(e) => warn!(connector = %self.name, error = %e, "serial port failed, reopening"),
                Ok(()) => warn!(connector = %self.name, "serial port closed, reopening"),
            }
            tokio::time::sleep(self.reconnect).await;
        }
    }
}

#[async_trait]
impl Connector for FileConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, emitter: RawEmitter) -> Result<(), ConnectorError> {
        if is_char_device(&self.path) {
            return self.read_serial(&emitter).await;
        }
        let file = tokio::fs::File::open(&self.path).await?;
        let lines = pump_lines(file, &emitter).await?;
        info!(connector = %self.name, path = %self.path.display(), lines, "file source finished");
        Ok(())
    }
}
