//! Modbus request/response PDUs and RTU checksums.
//!
//! On the wire coils are packed LSB first (standard Modbus); the Raw payload
//! layout in `signalk_protocol::modbus` packs them in coil order, so reads
//! and writes convert between the two here.

use signalk_protocol::modbus::{bytes_to_coils, coils_to_bytes, FunctionCode, ModbusHeader};

use super::ModbusClientError;

pub fn read_request(header: &ModbusHeader) -> Vec<u8> {
    let mut pdu = vec![header.function.code() as u8];
    pdu.extend_from_slice(&header.address.to_be_bytes());
    pdu.extend_from_slice(&header.count.to_be_bytes());
    pdu
}

/// Build a write PDU from a header and payload-layout data.
pub fn write_request(header: &ModbusHeader, data: &[u8]) -> Result<Vec<u8>, ModbusClientError> {
    let needed = header.function.data_len(header.count);
    if data.len() < needed {
        return Err(ModbusClientError::ShortData {
            needed,
            have: data.len(),
        });
    }
    let mut pdu = vec![header.function.code() as u8];
    pdu.extend_from_slice(&header.address.to_be_bytes());
    match header.function {
        FunctionCode::WriteSingleCoil => {
            let on = data[0] & 0x80 != 0;
            pdu.extend_from_slice(if on { &[0xFF, 0x00] } else { &[0x00, 0x00] });
        }
        FunctionCode::WriteSingleRegister => {
            pdu.extend_from_slice(&data[..2]);
        }
        FunctionCode::WriteMultipleCoils => {
            let coils = bytes_to_coils(data, header.count as usize)?;
            let packed = pack_wire_coils(&coils);
            pdu.extend_from_slice(&header.count.to_be_bytes());
            pdu.push(packed.len() as u8);
            pdu.extend_from_slice(&packed);
        }
        FunctionCode::WriteMultipleRegisters => {
            pdu.extend_from_slice(&header.count.to_be_bytes());
            pdu.push(needed as u8);
            pdu.extend_from_slice(&data[..needed]);
        }
        other => return Err(ModbusClientError::NotWritable(other.code())),
    }
    Ok(pdu)
}

/// Check a response PDU and return the payload-layout data for a read.
pub fn read_response(header: &ModbusHeader, pdu: &[u8]) -> Result<Vec<u8>, ModbusClientError> {
    check_function(header, pdu)?;
    if pdu.len() < 2 {
        return Err(ModbusClientError::ShortResponse(pdu.len()));
    }
    let byte_count = pdu[1] as usize;
    let data = &pdu[2..];
    let needed = header.function.data_len(header.count);
    if byte_count < needed || data.len() < needed {
        return Err(ModbusClientError::ShortData {
            needed,
            have: data.len().min(byte_count),
        });
    }
    if header.function.is_bit_access() {
        let coils = unpack_wire_coils(&data[..needed], header.count as usize);
        Ok(coils_to_bytes(&coils))
    } else {
        Ok(data[..needed].to_vec())
    }
}

/// Check a write acknowledgement.
pub fn write_response(header: &ModbusHeader, pdu: &[u8]) -> Result<(), ModbusClientError> {
    check_function(header, pdu)?;
    if pdu.len() < 5 {
        return Err(ModbusClientError::ShortResponse(pdu.len()));
    }
    Ok(())
}

fn check_function(header: &ModbusHeader, pdu: &[u8]) -> Result<(), ModbusClientError> {
    let Some(&fc) = pdu.first() else {
        return Err(ModbusClientError::ShortResponse(0));
    };
    let expected = header.function.code() as u8;
    if fc == expected | 0x80 {
        return Err(ModbusClientError::Exception {
            function: expected,
            code: pdu.get(1).copied().unwrap_or(0),
        });
    }
    if fc != expected {
        return Err(ModbusClientError::UnexpectedFunction {
            expected,
            got: fc,
        });
    }
    Ok(())
}

pub fn pack_wire_coils(coils: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; (coils.len() + 7) / 8];
    for (i, on) in coils.iter().enumerate() {
        if *on {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out
}

pub fn unpack_wire_coils(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| bytes.get(i / 8).map_or(false, |b| (b >> (i % 8)) & 1 == 1))
        .collect()
}

/// Modbus RTU CRC-16 (polynomial 0xA001, initial 0xFFFF).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Expected RTU response length after slave and function bytes, given the
/// third byte when it is a byte count.
pub fn rtu_remaining(function: u8, third: u8) -> usize {
    if function & 0x80 != 0 {
        // exception code already read as `third`, CRC follows
        return 2;
    }
    match function {
        1..=4 => third as usize + 2,
        // address(2) + value/count(2), one byte of it already read
        _ => 3 + 2,
    }
}
