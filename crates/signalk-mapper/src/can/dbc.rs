//! Minimal DBC reader: messages (`BO_`) and their signals (`SG_`).
//!
//! Everything else in a DBC file (nodes, value tables, comments, attributes)
//! is skipped. Multiplexed signals are parsed but decoded unconditionally.

use std::collections::HashMap;

use regex::Regex;

use crate::MapError;

/// Bit 31 marks an extended (29-bit) identifier in DBC message ids.
pub const DBC_EXTENDED: u32 = 0x8000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// `@1`, little endian.
    Intel,
    /// `@0`, big endian with the start bit naming the MSB.
    Motorola,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DbcSignal {
    pub name: String,
    pub start_bit: u16,
    pub length: u16,
    pub byte_order: ByteOrder,
    pub signed: bool,
    pub factor: f64,
    pub offset: f64,
    pub min: f64,
    pub max: f64,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DbcMessage {
    pub id: u32,
    pub name: String,
    pub dlc: u8,
    pub signals: Vec<DbcSignal>,
}

impl DbcMessage {
    pub fn get_signal(&self, name: &str) -> Option<&DbcSignal> {
        self.signals.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DbcDatabase {
    messages: HashMap<u32, DbcMessage>,
}

impl DbcDatabase {
    pub fn get_message(&self, id: u32) -> Option<&DbcMessage> {
        self.messages.get(&id)
    }

    /// Look up the message for a received frame id.
    pub fn message_for_frame(&self, id: u32, extended: bool) -> Option<&DbcMessage> {
        if extended {
            if let Some(m) = self.messages.get(&(id | DBC_EXTENDED)) {
                return Some(m);
            }
        }
        self.messages.get(&id)
    }

    pub fn messages(&self) -> impl Iterator<Item = &DbcMessage> {
        self.messages.values()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// A decoded signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalValue {
    pub raw: i64,
    pub physical: f64,
}

impl DbcSignal {
    /// Extract the signal from frame data. `None` when the signal does not
    /// fit in the data that was received.
    pub fn decode(&self, data: &[u8]) -> Option<SignalValue> {
        let len = u32::from(self.length);
        if len == 0 || len > 64 {
            return None;
        }
        let mut buf = [0u8; 8];
        let n = data.len().min(8);
        buf[..n].copy_from_slice(&data[..n]);
        let mask = if len == 64 { u64::MAX } else { (1u64 << len) - 1 };
        let bits = (n * 8) as u32;

        let raw = match self.byte_order {
            ByteOrder::Intel => {
                let start = u32::from(self.start_bit);
                if start + len > bits {
                    return None;
                }
                (u64::from_le_bytes(buf) >> start) & mask
            }
            ByteOrder::Motorola => {
                let start = u32::from(self.start_bit);
                let msb = (start / 8) * 8 + (7 - start % 8);
                if msb + len > bits {
                    return None;
                }
                (u64::from_be_bytes(buf) >> (64 - msb - len)) & mask
            }
        };

        let raw = if self.signed && len < 64 && raw & (1 << (len - 1)) != 0 {
            (raw | !mask) as i64
        } else {
            raw as i64
        };
        Some(SignalValue {
            raw,
            physical: raw as f64 * self.factor + self.offset,
        })
    }
}

fn number<T: std::str::FromStr>(text: &str, line: usize) -> Result<T, MapError> {
    text.trim()
        .parse()
        .map_err(|_| MapError::Dbc(format!("line {line}: bad number {text:?}")))
}

pub fn parse_dbc(content: &str) -> Result<DbcDatabase, MapError> {
    let message_re = Regex::new(r"^BO_\s+(\d+)\s+(\w+)\s*:\s*(\d+)")
        .map_err(|e| MapError::Dbc(e.to_string()))?;
    let signal_re = Regex::new(
        r#"^SG_\s+(\w+)(?:\s+\w+)?\s*:\s*(\d+)\|(\d+)@([01])([+-])\s*\(([^,]+),([^)]+)\)\s*\[([^|]+)\|([^\]]+)\]\s*"([^"]*)""#,
    )
    .map_err(|e| MapError::Dbc(e.to_string()))?;

    let mut db = DbcDatabase::default();
    let mut current: Option<u32> = None;

    for (index, line) in content.lines().enumerate() {
        let line_no = index + 1;
        let line = line.trim();
        if line.starts_with("BO_ ") {
            let caps = message_re
                .captures(line)
                .ok_or_else(|| MapError::Dbc(format!("line {line_no}: bad message {line:?}")))?;
            let id: u32 = number(&caps[1], line_no)?;
            db.messages.insert(
                id,
                DbcMessage {
                    id,
                    name: caps[2].to_string(),
                    dlc: number(&caps[3], line_no)?,
                    signals: Vec::new(),
                },
            );
            current = Some(id);
        } else if line.starts_with("SG_ ") {
            let caps = signal_re
                .captures(line)
                .ok_or_else(|| MapError::Dbc(format!("line {line_no}: bad signal {line:?}")))?;
            let message = current
                .and_then(|id| db.messages.get_mut(&id))
                .ok_or_else(|| MapError::Dbc(format!("line {line_no}: signal outside a message")))?;
            message.signals.push(DbcSignal {
                name: caps[1].to_string(),
                start_bit: number(&caps[2], line_no)?,
                length: number(&caps[3], line_no)?,
                byte_order: if &caps[4] == "1" {
                    ByteOrder::Intel
                } else {
                    ByteOrder::Motorola
                },
                signed: &caps[5] == "-",
                factor: number(&caps[6], line_no)?,
                offset: number(&caps[7], line_no)?,
                min: number(&caps[8], line_no)?,
                max: number(&caps[9], line_no)?,
                unit: caps[10].to_string(),
            });
        } else if !line.is_empty() {
            current = None;
        }
    }
    Ok(db)
}
