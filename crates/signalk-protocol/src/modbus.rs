//! Modbus payload layout carried in Raw messages.
//!
//! Every Modbus Raw payload starts with a 7-byte header
//! `slave(1) | function(2 BE) | address(2 BE) | count(2 BE)` followed by the
//! register bytes (big-endian) or packed coils. Coil `i` lives in byte
//! `i / 8`, filling each byte from its most significant bit down, so the
//! payload reads left to right in coil order. The last byte is zero padded.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const HEADER_LEN: usize = 7;
pub const MAX_SLAVE_ID: u8 = 247;
pub const MAX_COILS: u16 = 2000;
pub const MAX_REGISTERS: u16 = 125;

#[derive(Debug, Error, PartialEq)]
pub enum ModbusError {
    #[error("payload shorter than the 7-byte header ({0} bytes)")]
    ShortHeader(usize),

    #[error("slave id {0} outside 0..=247")]
    SlaveId(u8),

    #[error("unsupported function code {0}")]
    FunctionCode(u16),

    #[error("count {count} invalid for function code {function} (1..={max})")]
    Count { function: u16, count: u16, max: u16 },

    #[error("register data has odd length {0}")]
    OddLength(usize),

    #[error("need {needed} data bytes for {count} items, have {have}")]
    ShortData {
        count: u16,
        needed: usize,
        have: usize,
    },
}

/// Function codes handled by the connectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum FunctionCode {
    ReadCoils,
    ReadDiscreteInputs,
    ReadHoldingRegisters,
    ReadInputRegisters,
    WriteSingleCoil,
    WriteSingleRegister,
    WriteMultipleCoils,
    WriteMultipleRegisters,
}

impl FunctionCode {
    pub fn code(self) -> u16 {
        match self {
            FunctionCode::ReadCoils => 1,
            FunctionCode::ReadDiscreteInputs => 2,
            FunctionCode::ReadHoldingRegisters => 3,
            FunctionCode::ReadInputRegisters => 4,
            FunctionCode::WriteSingleCoil => 5,
            FunctionCode::WriteSingleRegister => 6,
            FunctionCode::WriteMultipleCoils => 15,
            FunctionCode::WriteMultipleRegisters => 16,
        }
    }

    /// True for the coil/discrete-input family.
    pub fn is_bit_access(self) -> bool {
        matches!(
            self,
            FunctionCode::ReadCoils
                | FunctionCode::ReadDiscreteInputs
                | FunctionCode::WriteSingleCoil
                | FunctionCode::WriteMultipleCoils
        )
    }

    pub fn is_write(self) -> bool {
        self.code() >= 5
    }

    /// Upper bound on `count` for this function.
    pub fn max_count(self) -> u16 {
        match self {
            FunctionCode::WriteSingleCoil | FunctionCode::WriteSingleRegister => 1,
            fc if fc.is_bit_access() => MAX_COILS,
            _ => MAX_REGISTERS,
        }
    }

    /// Number of data bytes that carry `count` items.
    pub fn data_len(self, count: u16) -> usize {
        if self.is_bit_access() {
            (count as usize + 7) / 8
        } else {
            count as usize * 2
        }
    }
}

impl TryFrom<u16> for FunctionCode {
    type Error = ModbusError;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        Ok(match code {
            1 => FunctionCode::ReadCoils,
            2 => FunctionCode::ReadDiscreteInputs,
            3 => FunctionCode::ReadHoldingRegisters,
            4 => FunctionCode::ReadInputRegisters,
            5 => FunctionCode::WriteSingleCoil,
            6 => FunctionCode::WriteSingleRegister,
            15 => FunctionCode::WriteMultipleCoils,
            16 => FunctionCode::WriteMultipleRegisters,
            other => return Err(ModbusError::FunctionCode(other)),
        })
    }
}

impl From<FunctionCode> for u16 {
    fn from(fc: FunctionCode) -> u16 {
        fc.code()
    }
}

impl std::fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Header prepended to every Modbus Raw payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModbusHeader {
    pub slave: u8,
    pub function: FunctionCode,
    pub address: u16,
    pub count: u16,
}

impl ModbusHeader {
    /// Build a header, checking the slave id and the count bound.
    pub fn new(
        slave: u8,
        function: FunctionCode,
        address: u16,
        count: u16,
    ) -> Result<Self, ModbusError> {
        let header = Self {
            slave,
            function,
            address,
            count,
        };
        header.validate()?;
        Ok(header)
    }

    pub fn validate(&self) -> Result<(), ModbusError> {
        if self.slave > MAX_SLAVE_ID {
            return Err(ModbusError::SlaveId(self.slave));
        }
        let max = self.function.max_count();
        if self.count == 0 || self.count > max {
            return Err(ModbusError::Count {
                function: self.function.code(),
                count: self.count,
                max,
            });
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let fc = self.function.code().to_be_bytes();
        let addr = self.address.to_be_bytes();
        let count = self.count.to_be_bytes();
        [
            self.slave, fc[0], fc[1], addr[0], addr[1], count[0], count[1],
        ]
    }
}

/// Prepend `header` to `data`.
pub fn inject_header(header: &ModbusHeader, data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + data.len());
    buf.put_slice(&header.to_bytes());
    buf.put_slice(data);
    buf.to_vec()
}

/// Split a payload into its header and the bytes after it.
pub fn extract_header(payload: &[u8]) -> Result<(ModbusHeader, &[u8]), ModbusError> {
    if payload.len() < HEADER_LEN {
        return Err(ModbusError::ShortHeader(payload.len()));
    }
    let function = FunctionCode::try_from(u16::from_be_bytes([payload[1], payload[2]]))?;
    let header = ModbusHeader::new(
        payload[0],
        function,
        u16::from_be_bytes([payload[3], payload[4]]),
        u16::from_be_bytes([payload[5], payload[6]]),
    )?;
    Ok((header, &payload[HEADER_LEN..]))
}

pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(registers.len() * 2);
    for r in registers {
        buf.put_u16(*r);
    }
    buf.to_vec()
}

pub fn bytes_to_registers(bytes: &[u8]) -> Result<Vec<u16>, ModbusError> {
    if bytes.len() % 2 != 0 {
        return Err(ModbusError::OddLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect())
}

fn coil_mask(i: usize) -> u8 {
    0x80 >> (i % 8)
}

/// Pack coils eight per byte in coil order, zero padded.
pub fn coils_to_bytes(coils: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; (coils.len() + 7) / 8];
    for (i, on) in coils.iter().enumerate() {
        if *on {
            out[i / 8] |= coil_mask(i);
        }
    }
    out
}

/// Unpack the first `count` coils.
pub fn bytes_to_coils(bytes: &[u8], count: usize) -> Result<Vec<bool>, ModbusError> {
    let needed = (count + 7) / 8;
    if bytes.len() < needed {
        return Err(ModbusError::ShortData {
            count: u16::try_from(count).unwrap_or(u16::MAX),
            needed,
            have: bytes.len(),
        });
    }
    Ok((0..count).map(|i| bytes[i / 8] & coil_mask(i) != 0).collect())
}

/// Decode the data after a header into one integer per item: register values
/// for word access, 0/1 for bit access.
pub fn decode_items(header: &ModbusHeader, data: &[u8]) -> Result<Vec<u16>, ModbusError> {
    let needed = header.function.data_len(header.count);
    if data.len() < needed {
        return Err(ModbusError::ShortData {
            count: header.count,
            needed,
            have: data.len(),
        });
    }
    if header.function.is_bit_access() {
        Ok(bytes_to_coils(data, header.count as usize)?
            .into_iter()
            .map(u16::from)
            .collect())
    } else {
        bytes_to_registers(&data[..needed])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coil_packing_layout() {
        let (f, t) = (false, true);
        let coils = [
            f, t, t, f, f, f, t, f, //
            t, t, f, f, t, f, t, t, //
            f, t, t, f, f, f, t, f, //
            t,
        ];
        let header = ModbusHeader::new(1, FunctionCode::ReadDiscreteInputs, 50, 25).unwrap();

        let payload = inject_header(&header, &coils_to_bytes(&coils));
        assert_eq!(
            payload,
            vec![0x01, 0x00, 0x02, 0x00, 0x32, 0x00, 0x19, 0x62, 0xCB, 0x62, 0x80]
        );
    }

    #[test]
    fn test_coil_bits_match_indices() {
        let coils = [true, false, false, true, false, false, false, false, true];
        let packed = coils_to_bytes(&coils);
        assert_eq!(packed, vec![0b1001_0000, 0b1000_0000]);
        for (i, on) in coils.iter().enumerate() {
            assert_eq!(packed[i / 8] & (0x80 >> (i % 8)) != 0, *on);
        }
        assert_eq!(bytes_to_coils(&packed, coils.len()).unwrap(), coils.to_vec());
    }

    #[test]
    fn test_register_bytes_are_big_endian() {
        let regs = [0x0102, 0xABCD, 0];
        let bytes = registers_to_bytes(&regs);
        assert_eq!(bytes, vec![0x01, 0x02, 0xAB, 0xCD, 0, 0]);
        assert_eq!(bytes_to_registers(&bytes).unwrap(), regs.to_vec());
        assert_eq!(bytes_to_registers(&[1, 2, 3]), Err(ModbusError::OddLength(3)));
    }

    /// xorshift sequence so the generated vectors are reproducible.
    fn words(seed: u32, len: usize) -> Vec<u16> {
        let mut x = seed.max(1);
        (0..len)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                (x >> 8) as u16
            })
            .collect()
    }

    #[test]
    fn test_generated_registers_round_trip() {
        for len in 0..=125usize {
            let regs = words(len as u32 + 1, len);
            let bytes = registers_to_bytes(&regs);
            assert_eq!(bytes.len(), len * 2);
            assert_eq!(bytes_to_registers(&bytes).unwrap(), regs);

            if len > 0 {
                let header =
                    ModbusHeader::new(3, FunctionCode::ReadInputRegisters, 40, len as u16).unwrap();
                let payload = inject_header(&header, &bytes);
                let (parsed, data) = extract_header(&payload).unwrap();
                assert_eq!(decode_items(&parsed, data).unwrap(), regs);
            }
        }
    }

    #[test]
    fn test_generated_coils_round_trip() {
        for len in 0..=100usize {
            let coils: Vec<bool> = words(len as u32 + 77, len)
                .into_iter()
                .map(|w| w & 1 == 1)
                .collect();
            let packed = coils_to_bytes(&coils);
            assert_eq!(packed.len(), (len + 7) / 8);
            assert_eq!(bytes_to_coils(&packed, len).unwrap(), coils);
            if len % 8 != 0 {
                // padding bits stay clear
                assert_eq!(packed[len / 8] & (0xFF >> (len % 8)), 0);
            }

            if len > 0 {
                let header = ModbusHeader::new(2, FunctionCode::ReadCoils, 0, len as u16).unwrap();
                let (parsed, data) = extract_header(&inject_header(&header, &packed))
                    .map(|(h, d)| (h, d.to_vec()))
                    .unwrap();
                let expected: Vec<u16> = coils.iter().map(|c| u16::from(*c)).collect();
                assert_eq!(decode_items(&parsed, &data).unwrap(), expected);
            }
        }
    }

    #[test]
    fn test_header_reinjection_is_stable() {
        let header = ModbusHeader::new(7, FunctionCode::ReadHoldingRegisters, 100, 2).unwrap();
        let payload = inject_header(&header, &[0, 1, 0, 2]);
        let (parsed, rest) = extract_header(&payload).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(inject_header(&header, rest), payload);
    }

    #[test]
    fn test_count_bounds() {
        assert!(ModbusHeader::new(1, FunctionCode::ReadCoils, 0, 2000).is_ok());
        assert!(ModbusHeader::new(1, FunctionCode::ReadCoils, 0, 2001).is_err());
        assert!(ModbusHeader::new(1, FunctionCode::ReadInputRegisters, 0, 125).is_ok());
        assert!(matches!(
            ModbusHeader::new(1, FunctionCode::ReadInputRegisters, 0, 126),
            Err(ModbusError::Count { max: 125, .. })
        ));
        assert!(ModbusHeader::new(1, FunctionCode::ReadHoldingRegisters, 0, 0).is_err());
        assert_eq!(
            ModbusHeader::new(248, FunctionCode::ReadCoils, 0, 1),
            Err(ModbusError::SlaveId(248))
        );
    }

    #[test]
    fn test_extract_rejects_garbage() {
        assert_eq!(extract_header(&[1, 0, 3]), Err(ModbusError::ShortHeader(3)));
        assert_eq!(
            extract_header(&[1, 0, 9, 0, 0, 0, 1]),
            Err(ModbusError::FunctionCode(9))
        );
    }

    #[test]
    fn test_decode_items() {
        let header = ModbusHeader::new(1, FunctionCode::ReadHoldingRegisters, 0, 2).unwrap();
        assert_eq!(decode_items(&header, &[0, 5, 1, 0]).unwrap(), vec![5, 256]);
        assert!(decode_items(&header, &[0, 5]).is_err());

        let header = ModbusHeader::new(1, FunctionCode::ReadCoils, 0, 3).unwrap();
        assert_eq!(decode_items(&header, &[0b1010_0000]).unwrap(), vec![1, 0, 1]);
    }
}
