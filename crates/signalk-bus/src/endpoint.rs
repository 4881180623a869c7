//! Bus URLs and the stream framing shared by both ends.
//!
//! After connecting, the publisher writes an 8-byte greeting
//! (`SKBUS`, two reserved bytes, version). Every message follows as a
//! `u32` big-endian length and the message bytes. A zero length marks the
//! end of the stream.

use std::path::PathBuf;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use url::Url;

use crate::BusError;

pub const GREETING_MAGIC: &[u8; 5] = b"SKBUS";
pub const WIRE_VERSION: u8 = 1;
pub const GREETING: [u8; 8] = [b'S', b'K', b'B', b'U', b'S', 0, 0, WIRE_VERSION];

/// Refuse frames above this size; the stream is treated as corrupt.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Where a bus socket binds or dials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `tcp://host:port`
    Tcp(String),
    /// `ipc:///path/to/socket`
    Ipc(PathBuf),
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self, BusError> {
        let url = Url::parse(raw).map_err(|e| BusError::InvalidUrl(format!("{raw}: {e}")))?;
        match url.scheme() {
            "tcp" => {
                let host = url
                    .host_str()
                    .ok_or_else(|| BusError::InvalidUrl(format!("{raw}: missing host")))?;
                let port = url
                    .port()
                    .ok_or_else(|| BusError::InvalidUrl(format!("{raw}: missing port")))?;
                Ok(Endpoint::Tcp(format!("{host}:{port}")))
            }
            "ipc" => {
                if url.path().is_empty() || url.path() == "/" {
                    return Err(BusError::InvalidUrl(format!("{raw}: missing path")));
                }
                Ok(Endpoint::Ipc(PathBuf::from(url.path())))
            }
            other => Err(BusError::InvalidUrl(format!(
                "{raw}: unsupported scheme {other}"
            ))),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
            Endpoint::Ipc(path) => write!(f, "ipc://{}", path.display()),
        }
    }
}

pub async fn write_greeting<W: AsyncWrite + Unpin>(w: &mut W) -> Result<(), BusError> {
    w.write_all(&GREETING).await?;
    Ok(())
}

pub async fn read_greeting<R: AsyncRead + Unpin>(r: &mut R) -> Result<(), BusError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).await?;
    if &buf[..5] != GREETING_MAGIC {
        return Err(BusError::Handshake("bad magic".to_string()));
    }
    if buf[7] != WIRE_VERSION {
        return Err(BusError::Handshake(format!("unsupported version {}", buf[7])));
    }
    Ok(())
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, msg: &[u8]) -> Result<(), BusError> {
    let len = u32::try_from(msg.len()).map_err(|_| BusError::FrameTooLarge(msg.len()))?;
    if msg.len() > MAX_FRAME || len == 0 {
        return Err(BusError::FrameTooLarge(msg.len()));
    }
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(msg).await?;
    Ok(())
}

pub async fn write_end<W: AsyncWrite + Unpin>(w: &mut W) -> Result<(), BusError> {
    w.write_all(&0u32.to_be_bytes()).await?;
    w.flush().await?;
    Ok(())
}

/// Read one frame; `None` is the end-of-stream marker.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Bytes>, BusError> {
    let len = r.read_u32().await? as usize;
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_FRAME {
        return Err(BusError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(Some(Bytes::from(buf)))
}
