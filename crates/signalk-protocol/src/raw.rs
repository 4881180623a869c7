//! Raw envelope: one collected frame plus its provenance.
//!
//! Wire layout (the bus adds its own `u32` length prefix around this):
//!
//! ```text
//! version(1) | timestamp_ns(8 BE) | uuid(16) | name_len(2 BE) | name
//!            | proto_len(2 BE) | proto | payload...
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Envelope format version written by this build.
pub const ENVELOPE_VERSION: u8 = 1;

/// Largest payload a connector may publish.
pub const MAX_PAYLOAD: usize = 64 * 1024;

const FIXED_LEN: usize = 1 + 8 + 16 + 2 + 2;

#[derive(Debug, Error, PartialEq)]
pub enum EnvelopeError {
    #[error("envelope truncated: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },

    #[error("unsupported envelope version {0}")]
    Version(u8),

    #[error("payload of {0} bytes exceeds the 64 KiB limit")]
    PayloadTooLarge(usize),

    #[error("{0} field is longer than 65535 bytes")]
    FieldTooLong(&'static str),

    #[error("{0} field is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("timestamp outside the representable range")]
    Timestamp,
}

/// A framed reading with provenance, as carried on the Raw bus.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub timestamp: DateTime<Utc>,
    pub uuid: Uuid,
    pub connector: String,
    pub protocol: String,
    pub payload: Bytes,
}

impl RawMessage {
    /// Serialize to the envelope layout.
    pub fn encode(&self) -> Result<Bytes, EnvelopeError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(EnvelopeError::PayloadTooLarge(self.payload.len()));
        }
        let name_len = u16::try_from(self.connector.len())
            .map_err(|_| EnvelopeError::FieldTooLong("connector"))?;
        let proto_len = u16::try_from(self.protocol.len())
            .map_err(|_| EnvelopeError::FieldTooLong("protocol"))?;
        let nanos = self
            .timestamp
            .timestamp_nanos_opt()
            .and_then(|n| u64::try_from(n).ok())
            .ok_or(EnvelopeError::Timestamp)?;

        let mut buf = BytesMut::with_capacity(
            FIXED_LEN + self.connector.len() + self.protocol.len() + self.payload.len(),
        );
        buf.put_u8(ENVELOPE_VERSION);
        buf.put_u64(nanos);
        buf.put_slice(self.uuid.as_bytes());
        buf.put_u16(name_len);
        buf.put_slice(self.connector.as_bytes());
        buf.put_u16(proto_len);
        buf.put_slice(self.protocol.as_bytes());
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Parse an envelope produced by [`RawMessage::encode`].
    pub fn decode(mut buf: Bytes) -> Result<Self, EnvelopeError> {
        ensure(&buf, FIXED_LEN)?;
        let version = buf.get_u8();
        if version != ENVELOPE_VERSION {
            return Err(EnvelopeError::Version(version));
        }
        let nanos = i64::try_from(buf.get_u64()).map_err(|_| EnvelopeError::Timestamp)?;
        let timestamp = DateTime::from_timestamp_nanos(nanos);

        let mut id = [0u8; 16];
        buf.copy_to_slice(&mut id);
        let connector = read_str(&mut buf, "connector")?;
        ensure(&buf, 2)?;
        let protocol = read_str(&mut buf, "protocol")?;

        if buf.len() > MAX_PAYLOAD {
            return Err(EnvelopeError::PayloadTooLarge(buf.len()));
        }

        Ok(Self {
            timestamp,
            uuid: Uuid::from_bytes(id),
            connector,
            protocol,
            payload: buf,
        })
    }
}

fn ensure(buf: &Bytes, needed: usize) -> Result<(), EnvelopeError> {
    if buf.len() < needed {
        return Err(EnvelopeError::Truncated {
            needed,
            have: buf.len(),
        });
    }
    Ok(())
}

fn read_str(buf: &mut Bytes, field: &'static str) -> Result<String, EnvelopeError> {
    let len = buf.get_u16() as usize;
    ensure(buf, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| EnvelopeError::InvalidUtf8(field))
}

/// Stamps frames from one connector with strictly increasing timestamps
/// and time-ordered v7 UUIDs.
#[derive(Debug, Clone)]
pub struct RawStamper {
    connector: String,
    protocol: String,
    last_nanos: i64,
}

impl RawStamper {
    pub fn new(connector: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            connector: connector.into(),
            protocol: protocol.into(),
            last_nanos: 0,
        }
    }

    pub fn connector(&self) -> &str {
        &self.connector
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Wrap a payload collected now.
    pub fn stamp(&mut self, payload: impl Into<Bytes>) -> Result<RawMessage, EnvelopeError> {
        self.stamp_at(Utc::now(), payload)
    }

    /// Wrap a payload collected at `at`, bumped forward if the clock has
    /// not advanced since the previous frame.
    pub fn stamp_at(
        &mut self,
        at: DateTime<Utc>,
        payload: impl Into<Bytes>,
    ) -> Result<RawMessage, EnvelopeError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD {
            return Err(EnvelopeError::PayloadTooLarge(payload.len()));
        }
        let nanos = at.timestamp_nanos_opt().ok_or(EnvelopeError::Timestamp)?;
        let nanos = nanos.max(self.last_nanos + 1);
        self.last_nanos = nanos;

        Ok(RawMessage {
            timestamp: DateTime::from_timestamp_nanos(nanos),
            uuid: Uuid::now_v7(),
            connector: self.connector.clone(),
            protocol: self.protocol.clone(),
            payload,
        })
    }
}
