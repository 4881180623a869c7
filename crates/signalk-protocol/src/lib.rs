//! # signalk-protocol
//!
//! Wire formats for the data plane.
//!
//! - WebSocket and discovery messages, JSON codec for deltas
//! - The Raw envelope carried on the bus
//! - Binary payload layouts for Modbus, CAN and Manner-Ethernet frames

pub mod can;
pub mod codec;
pub mod manner;
pub mod messages;
pub mod modbus;
pub mod raw;

pub use codec::CodecError;
pub use messages::*;
pub use raw::{EnvelopeError, RawMessage, RawStamper, MAX_PAYLOAD};
