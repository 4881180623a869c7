//! CAN frame payload layout.
//!
//! `id(4 BE) | dlc(1) | flags(1) | res0(1) | res1(1) | data(0..8)`

use thiserror::Error;

pub const CAN_HEADER_LEN: usize = 8;
pub const CAN_MAX_DATA: usize = 8;

pub const FLAG_EXTENDED: u8 = 0x01;
pub const FLAG_RTR: u8 = 0x02;
pub const FLAG_ERROR: u8 = 0x04;

#[derive(Debug, Error, PartialEq)]
pub enum CanError {
    #[error("CAN payload shorter than header ({0} bytes)")]
    Short(usize),
    #[error("DLC {dlc} does not match {have} data bytes")]
    Dlc { dlc: u8, have: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    pub id: u32,
    pub flags: u8,
    pub data: Vec<u8>,
}

impl CanFrame {
    pub fn new(id: u32, flags: u8, data: &[u8]) -> Result<Self, CanError> {
        if data.len() > CAN_MAX_DATA {
            return Err(CanError::Dlc {
                dlc: CAN_MAX_DATA as u8,
                have: data.len(),
            });
        }
        Ok(Self {
            id,
            flags,
            data: data.to_vec(),
        })
    }

    pub fn is_extended(&self) -> bool {
        self.flags & FLAG_EXTENDED != 0
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CAN_HEADER_LEN + self.data.len());
        out.extend_from_slice(&self.id.to_be_bytes());
        out.push(self.data.len() as u8);
        out.push(self.flags);
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&self.data);
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CanError> {
        if payload.len() < CAN_HEADER_LEN {
            return Err(CanError::Short(payload.len()));
        }
        let id = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let dlc = payload[4];
        let data = &payload[CAN_HEADER_LEN..];
        if dlc as usize > CAN_MAX_DATA || data.len() != dlc as usize {
            return Err(CanError::Dlc {
                dlc,
                have: data.len(),
            });
        }
        Ok(Self {
            id,
            flags: payload[5],
            data: data.to_vec(),
        })
    }
}
